use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A message as carried by the transport.
///
/// Field names follow the AMQP 1.0 message properties section; the transport
/// never interprets them beyond selector matching.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportMessage {
    /// Application headers.
    pub application_properties: Option<HashMap<String, String>>,

    /// Payload.
    pub body: Option<Bytes>,

    /// Correlation identifier.
    pub correlation_id: Option<String>,

    /// Creation time stamped by the sender.
    pub creation_time: Option<DateTime<Utc>>,

    /// Message identifier.
    pub message_id: Option<String>,

    /// Address a reply is expected on.
    pub reply_to: Option<String>,
}

impl TransportMessage {
    /// Creates a message with the given body and no properties.
    pub fn with_body<B>(body: B) -> Self
    where
        B: Into<Bytes>,
    {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }
}

/// Acknowledgement handle returned for an accepted delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Link-scoped delivery sequence number.
    pub id: u64,

    /// Encoded payload as it was put on the link.
    pub data: Bytes,
}
