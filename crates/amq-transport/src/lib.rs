//! Link-oriented message transport abstraction.
//!
//! A transport multiplexes independent sending and receiving links, each bound
//! to one address, over a single broker connection. Everything the transport
//! reports asynchronously (link attached, message arrived, link failed) is
//! delivered as events on a per-link channel, so higher layers never run code
//! inside the transport's own event loop.
//!
//! Specific transport implementations are provided in separate crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker_list;
mod error;
mod message;
mod options;

pub use broker_list::BrokerList;
pub use error::TransportError;
pub use error::TransportError as Error;
pub use message::{Delivery, TransportMessage};
pub use options::{
    ConnectionDetails, ConnectionOptions, DEFAULT_PORT, ReceiverOptions, ReconnectPolicy, Scheme,
    Selector, SenderOptions,
};

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

/// Error condition attached to a link by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkError {
    /// Symbolic AMQP condition, e.g. `amqp:not-found`.
    pub condition: String,

    /// Human readable description.
    pub description: Option<String>,
}

impl LinkError {
    /// Creates a link error.
    pub fn new<C, D>(condition: C, description: D) -> Self
    where
        C: Into<String>,
        D: Into<String>,
    {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {description}", self.condition),
            None => write!(f, "{}", self.condition),
        }
    }
}

/// Events emitted by a sending link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SenderEvent {
    /// The link is attached and has credit.
    Sendable,

    /// A delivery was rejected by the broker.
    Rejected(LinkError),

    /// The link failed.
    Error(LinkError),

    /// The link was closed.
    Closed,
}

/// Events emitted by a receiving link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// The link is attached.
    Opened,

    /// A message arrived.
    Message(TransportMessage),

    /// The link failed.
    Error(LinkError),

    /// The link was closed.
    Closed,
}

/// Events emitted by a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection was lost or closed.
    Disconnected {
        /// Cause, if the connection was not closed deliberately.
        error: Option<TransportError>,
        /// Whether the transport is re-establishing the connection itself.
        reconnecting: bool,
    },

    /// A connection level error occurred.
    Error(TransportError),
}

/// Stream of events for a sending link.
pub type SenderEvents = mpsc::UnboundedReceiver<SenderEvent>;

/// Stream of events for a receiving link.
pub type ReceiverEvents = mpsc::UnboundedReceiver<ReceiverEvent>;

/// A unidirectional sending link bound to one address.
pub trait SenderLink: Debug + Send + Sync + 'static {
    /// Target address.
    fn address(&self) -> &str;

    /// Whether the link is attached.
    fn is_open(&self) -> bool;

    /// Puts a message on the link.
    ///
    /// Returns `None` if the delivery was not accepted.
    fn send(&self, message: TransportMessage) -> Option<Delivery>;

    /// Detaches the link. Completion is signalled with [`SenderEvent::Closed`].
    fn close(&self);
}

/// A unidirectional receiving link bound to one address.
pub trait ReceiverLink: Debug + Send + Sync + 'static {
    /// Source address.
    fn address(&self) -> &str;

    /// Whether the link is attached.
    fn is_open(&self) -> bool;

    /// Last error the broker attached to the link.
    fn error(&self) -> Option<LinkError>;

    /// Detaches the link. Completion is signalled with [`ReceiverEvent::Closed`].
    fn close(&self);
}

/// A freshly created sending link and its event stream.
#[derive(Debug)]
pub struct SenderHandle {
    /// The link.
    pub link: Arc<dyn SenderLink>,

    /// Events emitted by the link.
    pub events: SenderEvents,
}

/// A freshly created receiving link and its event stream.
#[derive(Debug)]
pub struct ReceiverHandle {
    /// The link.
    pub link: Arc<dyn ReceiverLink>,

    /// Events emitted by the link.
    pub events: ReceiverEvents,
}

/// An open broker connection.
#[async_trait]
pub trait Connection: Debug + Send + Sync + 'static {
    /// Whether the connection is open.
    fn is_open(&self) -> bool;

    /// Subscribes to connection level events.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Starts attaching a sending link.
    ///
    /// The link is usable once [`SenderEvent::Sendable`] arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    fn open_sender(&self, options: SenderOptions) -> Result<SenderHandle, TransportError>;

    /// Starts attaching a receiving link.
    ///
    /// The link is usable once [`ReceiverEvent::Opened`] arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    fn open_receiver(&self, options: ReceiverOptions) -> Result<ReceiverHandle, TransportError>;

    /// Closes the connection and every link on it.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Transport trait for establishing broker connections.
///
/// Retry and backoff live here, driven by [`ConnectionOptions::reconnect`];
/// callers see a single outcome per `connect`.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Connects to the broker described by the options.
    ///
    /// Resolves once the connection is open.
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}
