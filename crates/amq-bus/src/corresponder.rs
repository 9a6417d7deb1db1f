//! Paired sender/receiver link ownership.
//!
//! A [`Corresponder`] opens up to two links for a route and keeps them
//! together: the [`Role`] decides which route address feeds which link. Link
//! events are drained by one task per link and handed to a [`LinkHandler`];
//! the tasks only hold a weak reference to it.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use proven_amq_transport::{
    LinkError, ReceiverEvent, ReceiverEvents, ReceiverLink, ReceiverOptions, SenderEvent,
    SenderEvents, SenderLink, SenderOptions, TransportError, TransportMessage,
};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::awaiter::Awaiter;
use crate::config::{DEFAULT_OPEN_TIMEOUT, RouteOptions};
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::result::OperationStatus;

/// Which route address feeds which link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends to `address`, receives replies on `reply_to`.
    Producer,

    /// Receives on `address`, sends replies to `reply_to`.
    Consumer,
}

impl Role {
    /// Address the sending link attaches to.
    #[must_use]
    pub fn sender_address(self, route: &RouteOptions) -> Option<&str> {
        let address = match self {
            Self::Producer => route.address.as_deref(),
            Self::Consumer => route.reply_to.as_deref(),
        };
        address.filter(|address| !address.is_empty())
    }

    /// Address the receiving link attaches to.
    #[must_use]
    pub fn receiver_address(self, route: &RouteOptions) -> Option<&str> {
        let address = match self {
            Self::Producer => route.reply_to.as_deref(),
            Self::Consumer => route.address.as_deref(),
        };
        address.filter(|address| !address.is_empty())
    }
}

/// Lifecycle of a corresponder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CorresponderState {
    /// No links.
    #[default]
    Closed,

    /// Links are attaching.
    Opening,

    /// Links are attached.
    Open,

    /// Links are detaching.
    Closing,
}

/// Receives the events of a corresponder's links.
#[async_trait]
pub trait LinkHandler: Send + Sync + 'static {
    /// Opening or closing the links failed.
    fn connection_error(&self, error: &Error);

    /// The sending link reported an error or a rejected delivery.
    fn sender_error(&self, address: &str, error: &LinkError);

    /// A message arrived on the receiving link.
    async fn receiver_message(&self, address: &str, message: TransportMessage);

    /// The receiving link reported an error.
    async fn receiver_error(&self, address: &str, error: LinkError);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
enum LinkStatus {
    #[default]
    Attaching,
    Open,
    Failed(LinkError),
    Closed,
}

impl LinkStatus {
    fn failure(&self) -> Option<LinkError> {
        match self {
            Self::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }
}

type StatusSlot = Arc<Mutex<LinkStatus>>;

struct Link<L: ?Sized> {
    link: Arc<L>,
    status: StatusSlot,
}

impl<L: ?Sized> Clone for Link<L> {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
            status: self.status.clone(),
        }
    }
}

/// Owner of one sending and one receiving link for a route.
pub struct Corresponder {
    connector: Connector,
    handler: Weak<dyn LinkHandler>,
    lifecycle: tokio::sync::Mutex<()>,
    receiver: Mutex<Option<Link<dyn ReceiverLink>>>,
    role: Role,
    route: Mutex<Option<RouteOptions>>,
    sender: Mutex<Option<Link<dyn SenderLink>>>,
    state: Mutex<CorresponderState>,
    tasks: TaskTracker,
}

impl Corresponder {
    /// Creates a closed corresponder.
    #[must_use]
    pub fn new(connector: Connector, role: Role, handler: Weak<dyn LinkHandler>) -> Self {
        Self {
            connector,
            handler,
            lifecycle: tokio::sync::Mutex::new(()),
            receiver: Mutex::new(None),
            role,
            route: Mutex::new(None),
            sender: Mutex::new(None),
            state: Mutex::new(CorresponderState::Closed),
            tasks: TaskTracker::new(),
        }
    }

    /// The role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The connector links are opened through.
    #[must_use]
    pub const fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CorresponderState {
        *self.state.lock()
    }

    /// Route of the current or last attempted open.
    #[must_use]
    pub fn route(&self) -> Option<RouteOptions> {
        self.route.lock().clone()
    }

    /// Address of the sending link, per role.
    #[must_use]
    pub fn sender_address(&self) -> Option<String> {
        self.route
            .lock()
            .as_ref()
            .and_then(|route| self.role.sender_address(route).map(str::to_string))
    }

    /// Address of the receiving link, per role.
    #[must_use]
    pub fn receiver_address(&self) -> Option<String> {
        self.route
            .lock()
            .as_ref()
            .and_then(|route| self.role.receiver_address(route).map(str::to_string))
    }

    /// The sending link, if attached.
    #[must_use]
    pub fn sender(&self) -> Option<Arc<dyn SenderLink>> {
        self.sender
            .lock()
            .as_ref()
            .filter(|sender| {
                *sender.status.lock() == LinkStatus::Open && sender.link.is_open()
            })
            .map(|sender| sender.link.clone())
    }

    /// Whether the sending link is attached.
    #[must_use]
    pub fn is_sender_open(&self) -> bool {
        self.sender().is_some()
    }

    /// Whether the receiving link is attached.
    #[must_use]
    pub fn is_receiver_open(&self) -> bool {
        self.receiver.lock().as_ref().is_some_and(|receiver| {
            *receiver.status.lock() == LinkStatus::Open && receiver.link.is_open()
        })
    }

    /// Error the sending link failed with, until the link is closed.
    #[must_use]
    pub fn sender_failure(&self) -> Option<LinkError> {
        self.sender
            .lock()
            .as_ref()
            .and_then(|sender| sender.status.lock().failure())
    }

    /// Error the receiving link failed with, until the link is closed.
    #[must_use]
    pub fn receiver_failure(&self) -> Option<LinkError> {
        self.receiver
            .lock()
            .as_ref()
            .and_then(|receiver| receiver.status.lock().failure())
    }

    /// Why [`Corresponder::sender`] yields nothing.
    pub(crate) fn sender_unavailable(&self) -> (OperationStatus, Error) {
        if !self.connector.is_connected() {
            return (OperationStatus::ConnectionError, Error::ConnectionNotDefined);
        }
        match self.sender_failure() {
            Some(error) => (OperationStatus::SenderError, Error::Sender(error)),
            None => (OperationStatus::ConfigError, Error::SenderNotOpened),
        }
    }

    /// Whether the link carrying the role's primary traffic is attached.
    #[must_use]
    pub fn is_open(&self) -> bool {
        match self.role {
            Role::Producer => self.is_sender_open(),
            Role::Consumer => self.is_receiver_open(),
        }
    }

    /// Opens the links configured for the route.
    ///
    /// Links of a previous open are closed first. Both links attach
    /// concurrently, bounded by the route timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if a link cannot be created, is refused, or does not
    /// attach in time. The error is also passed to the handler's
    /// `connection_error` and any link that did attach is closed again.
    pub async fn open(&self, route: RouteOptions) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Err(error) = self.close_links().await {
            debug!(%error, "previous links did not close cleanly");
        }

        *self.state.lock() = CorresponderState::Opening;
        *self.route.lock() = Some(route.clone());

        match self.attach(&route).await {
            Ok(()) => {
                *self.state.lock() = CorresponderState::Open;
                info!(
                    role = ?self.role,
                    address = route.address.as_deref().unwrap_or_default(),
                    reply_to = route.reply_to.as_deref().unwrap_or_default(),
                    "corresponder opened"
                );
                Ok(())
            }
            Err(error) => {
                if let Err(close_error) = self.close_links().await {
                    debug!(%close_error, "failed to close partially opened links");
                }
                self.route.lock().take();
                *self.state.lock() = CorresponderState::Closed;

                if let Some(handler) = self.handler.upgrade() {
                    handler.connection_error(&error);
                }
                Err(error)
            }
        }
    }

    /// Closes both links and waits until they report closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the links do not report closed in time. The error
    /// is also passed to the handler's `connection_error`.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        *self.state.lock() = CorresponderState::Closing;
        self.route.lock().take();

        let result = self.close_links().await;
        *self.state.lock() = CorresponderState::Closed;

        if let Err(error) = &result {
            if let Some(handler) = self.handler.upgrade() {
                handler.connection_error(error);
            }
        }
        result
    }

    async fn attach(&self, route: &RouteOptions) -> Result<()> {
        let timeout = route.open_timeout();

        if let Some(address) = self.role.receiver_address(route) {
            let handle = self.connector.create_receiver(ReceiverOptions {
                address: address.to_string(),
                selector: None,
                timeout: Some(timeout),
            })?;
            let status = StatusSlot::default();
            self.spawn_receiver_events(address.to_string(), handle.events, status.clone());
            *self.receiver.lock() = Some(Link {
                link: handle.link,
                status,
            });
        }

        if let Some(address) = self.role.sender_address(route) {
            let handle = self.connector.create_sender(SenderOptions {
                address: address.to_string(),
                timeout: Some(timeout),
            })?;
            let status = StatusSlot::default();
            self.spawn_sender_events(address.to_string(), handle.events, status.clone());
            *self.sender.lock() = Some(Link {
                link: handle.link,
                status,
            });
        }

        Awaiter::new(timeout).wait(|_| self.attach_outcome()).await?
    }

    /// `Some` once every link attached or one of them failed.
    fn attach_outcome(&self) -> Option<Result<()>> {
        let sender = self
            .sender
            .lock()
            .as_ref()
            .map(|sender| (sender.link.address().to_string(), sender.status.lock().clone()));
        let receiver = self
            .receiver
            .lock()
            .as_ref()
            .map(|receiver| (receiver.link.address().to_string(), receiver.status.lock().clone()));

        let mut attached = true;
        for (address, status) in sender.into_iter().chain(receiver) {
            match status {
                LinkStatus::Open => {}
                LinkStatus::Attaching => attached = false,
                LinkStatus::Failed(error) => {
                    return Some(Err(Error::Transport(TransportError::LinkRefused {
                        address,
                        reason: error.to_string(),
                    })));
                }
                LinkStatus::Closed => {
                    return Some(Err(Error::Transport(TransportError::ConnectionClosed)));
                }
            }
        }

        attached.then_some(Ok(()))
    }

    async fn close_links(&self) -> Result<()> {
        let sender = self.sender.lock().take();
        let receiver = self.receiver.lock().take();

        let mut statuses = Vec::with_capacity(2);
        if let Some(sender) = sender {
            sender.link.close();
            statuses.push(sender.status);
        }
        if let Some(receiver) = receiver {
            receiver.link.close();
            statuses.push(receiver.status);
        }

        if statuses.is_empty() {
            return Ok(());
        }

        Awaiter::new(DEFAULT_OPEN_TIMEOUT)
            .wait(|_| {
                statuses
                    .iter()
                    .all(|status| *status.lock() == LinkStatus::Closed)
                    .then_some(())
            })
            .await
    }

    fn spawn_sender_events(&self, address: String, mut events: SenderEvents, status: StatusSlot) {
        let handler = self.handler.clone();

        self.tasks.spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SenderEvent::Sendable => {
                        let mut status = status.lock();
                        if *status == LinkStatus::Attaching {
                            *status = LinkStatus::Open;
                        }
                    }
                    SenderEvent::Rejected(error) => {
                        if let Some(handler) = handler.upgrade() {
                            handler.sender_error(&address, &error);
                        }
                    }
                    SenderEvent::Error(error) => {
                        *status.lock() = LinkStatus::Failed(error.clone());
                        if let Some(handler) = handler.upgrade() {
                            handler.sender_error(&address, &error);
                        }
                    }
                    SenderEvent::Closed => break,
                }
            }

            trace!(%address, "sender link closed");
            *status.lock() = LinkStatus::Closed;
        });
    }

    fn spawn_receiver_events(
        &self,
        address: String,
        mut events: ReceiverEvents,
        status: StatusSlot,
    ) {
        let handler = self.handler.clone();

        self.tasks.spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ReceiverEvent::Opened => {
                        let mut status = status.lock();
                        if *status == LinkStatus::Attaching {
                            *status = LinkStatus::Open;
                        }
                    }
                    ReceiverEvent::Message(message) => {
                        let Some(handler) = handler.upgrade() else {
                            break;
                        };
                        handler.receiver_message(&address, message).await;
                    }
                    ReceiverEvent::Error(error) => {
                        *status.lock() = LinkStatus::Failed(error.clone());
                        if let Some(handler) = handler.upgrade() {
                            handler.receiver_error(&address, error).await;
                        }
                    }
                    ReceiverEvent::Closed => break,
                }
            }

            trace!(%address, "receiver link closed");
            *status.lock() = LinkStatus::Closed;
        });
    }

    #[cfg(test)]
    pub(crate) async fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        self.tasks.close();
        let idle = tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok();
        self.tasks.reopen();
        idle
    }
}

impl fmt::Debug for Corresponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Corresponder")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("route", &self.route())
            .field("sender_open", &self.is_sender_open())
            .field("receiver_open", &self.is_receiver_open())
            .finish_non_exhaustive()
    }
}

impl Drop for Corresponder {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.get_mut().take() {
            sender.link.close();
        }
        if let Some(receiver) = self.receiver.get_mut().take() {
            receiver.link.close();
        }
        self.tasks.close();
    }
}
