use proven_amq_transport::{LinkError, TransportError};
use thiserror::Error;

/// Errors that can occur on the bus.
///
/// Errors are cloneable so they can be kept as the cause of an
/// [`OperationResult`](crate::OperationResult).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A bounded wait ran out of time.
    #[error("Timeout elapsed ({0} ms)")]
    Timeout(u64),

    /// A link was requested while the connector has no connection.
    #[error("Connection not defined")]
    ConnectionNotDefined,

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A reply is already awaited for the correlation id.
    #[error("Duplicate request")]
    DuplicateRequest,

    /// A reply arrived for a request that was already answered.
    #[error("Duplicate response")]
    DuplicateResponse,

    /// A reply arrived for a request nobody waits for.
    #[error("Correlated request [{0}] not found")]
    CorrelationNotFound(String),

    /// A message carries no correlation id.
    #[error("Correlation rule is not defined")]
    CorrelationUndefined,

    /// No reply address is configured.
    #[error("ReplyTo not defined")]
    ReplyToUndefined,

    /// Reply requested for a message that was never sent.
    #[error("No request, no reply")]
    NoRequest,

    /// No address to send to or receive from is configured.
    #[error("Address not defined")]
    AddressUndefined,

    /// A client request was sent a second time.
    #[error("Request already sent")]
    RequestAlreadySent,

    /// The sending link is not open.
    #[error("Sender not opened")]
    SenderNotOpened,

    /// The broker did not accept the delivery.
    #[error("Message delivery failed")]
    DeliveryFailed,

    /// The sending link reported an error.
    #[error("sender error: {0}")]
    Sender(LinkError),

    /// The receiving link reported an error.
    #[error("receiver error: {0}")]
    Receiver(LinkError),

    /// No route with the given name is configured.
    #[error("route '{0}' not found")]
    RouteNotFound(String),

    /// Configuration could not be applied.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Sink for errors that surface outside any call, e.g. a failed link.
pub type ErrorHandler = std::sync::Arc<dyn Fn(&Error) + Send + Sync>;
