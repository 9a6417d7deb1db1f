use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::Message;

/// Outcome class of a bus operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// The operation succeeded.
    Success,

    /// Something required was not configured or not opened.
    ConfigError,

    /// The transport is not connected or a link could not be opened.
    ConnectionError,

    /// The sending link reported an error.
    SenderError,

    /// The receiving link reported an error.
    ReceiverError,

    /// The broker did not accept a delivery, or correlation failed.
    OperationError,

    /// The deadline elapsed first.
    TimedOut,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::ConfigError => "CONFIG_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::SenderError => "SENDER_ERROR",
            Self::ReceiverError => "RECEIVER_ERROR",
            Self::OperationError => "OPERATION_ERROR",
            Self::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// Result of a send, receive or reply call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationResult {
    /// Outcome class.
    pub status: OperationStatus,

    /// Address the operation worked on.
    pub address: Option<String>,

    /// Message sent or received.
    pub message: Option<Message>,

    /// Error behind a non-success status.
    pub cause: Option<Error>,

    /// Human readable summary.
    pub status_text: Option<String>,
}

impl OperationResult {
    /// A successful result.
    #[must_use]
    pub const fn success(address: Option<String>) -> Self {
        Self {
            status: OperationStatus::Success,
            address,
            message: None,
            cause: None,
            status_text: None,
        }
    }

    /// A failed result; the status text is taken from the cause.
    #[must_use]
    pub fn failure(status: OperationStatus, address: Option<String>, cause: Error) -> Self {
        Self {
            status,
            address,
            message: None,
            status_text: Some(cause.to_string()),
            cause: Some(cause),
        }
    }

    /// Attaches a message.
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    /// Sets the status text.
    #[must_use]
    pub fn with_status_text<T>(mut self, status_text: T) -> Self
    where
        T: Into<String>,
    {
        self.status_text = Some(status_text.into());
        self
    }

    /// Whether the operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }
}
