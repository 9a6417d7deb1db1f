use thiserror::Error;

/// Errors reported by a transport implementation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Authentication with the broker was refused.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A broker list entry could not be parsed.
    #[error("invalid broker '{0}' - expected 'host:port'")]
    InvalidBroker(String),

    /// The broker list contained no entries.
    #[error("broker list is empty")]
    EmptyBrokerList,

    /// The broker refused to attach a link.
    #[error("link to '{address}' refused: {reason}")]
    LinkRefused {
        /// Address the link was opened against.
        address: String,
        /// Reason reported by the broker.
        reason: String,
    },
}
