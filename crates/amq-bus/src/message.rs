use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use proven_amq_transport::TransportMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application headers carried next to the payload.
pub type Headers = HashMap<String, String>;

/// A decoded bus message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Identifier of the request this message answers, or the request's own
    /// correlation token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Address a reply is expected on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Textual payload, `None` for an empty body.
    pub data: Option<String>,

    /// Creation time stamped by the sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    /// Application headers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

impl From<&TransportMessage> for Message {
    fn from(message: &TransportMessage) -> Self {
        Self {
            message_id: message.message_id.clone(),
            correlation_id: message.correlation_id.clone(),
            reply_to: message.reply_to.clone(),
            data: message
                .body
                .as_ref()
                .filter(|body| !body.is_empty())
                .map(|body| String::from_utf8_lossy(body).into_owned()),
            created: message.creation_time,
            headers: message.application_properties.clone(),
        }
    }
}

/// What to send: a body plus optional identifiers, headers and timeout.
///
/// Plain strings convert into a config carrying just the body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestConfig {
    /// Payload.
    pub body: Option<String>,

    /// Message identifier, generated if absent.
    pub message_id: Option<String>,

    /// Correlation identifier, generated if absent.
    pub correlation_id: Option<String>,

    /// Reply address overriding the route's.
    pub reply_to: Option<String>,

    /// Application headers.
    pub headers: Option<Headers>,

    /// Reply timeout used when `receive_reply` is called without one.
    pub timeout: Option<Duration>,
}

impl RequestConfig {
    /// Creates a config with the given body.
    pub fn new<B>(body: B) -> Self
    where
        B: Into<String>,
    {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    /// Sets the message id.
    #[must_use]
    pub fn with_message_id<I>(mut self, message_id: I) -> Self
    where
        I: Into<String>,
    {
        self.message_id = Some(message_id.into());
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id<I>(mut self, correlation_id: I) -> Self
    where
        I: Into<String>,
    {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the reply address.
    #[must_use]
    pub fn with_reply_to<A>(mut self, reply_to: A) -> Self
    where
        A: Into<String>,
    {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Adds an application header.
    #[must_use]
    pub fn with_header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(key.into(), value.into());
        self
    }

    /// Sets the reply timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fills in missing identifiers.
    ///
    /// With neither id set one fresh id is used for both; with only one set
    /// the other copies it.
    pub(crate) fn with_ids(mut self) -> Self {
        match (&self.message_id, &self.correlation_id) {
            (None, None) => {
                let id = Uuid::new_v4().to_string();
                self.message_id = Some(id.clone());
                self.correlation_id = Some(id);
            }
            (Some(id), None) => self.correlation_id = Some(id.clone()),
            (None, Some(id)) => self.message_id = Some(id.clone()),
            (Some(_), Some(_)) => {}
        }
        self
    }

    pub(crate) fn to_transport(&self, reply_to: Option<&str>) -> TransportMessage {
        TransportMessage {
            application_properties: self.headers.clone(),
            body: self.body.clone().map(Bytes::from),
            correlation_id: self.correlation_id.clone(),
            creation_time: Some(Utc::now()),
            message_id: self.message_id.clone(),
            reply_to: self.reply_to.as_deref().or(reply_to).map(str::to_string),
        }
    }
}

impl From<&str> for RequestConfig {
    fn from(body: &str) -> Self {
        Self::new(body)
    }
}

impl From<String> for RequestConfig {
    fn from(body: String) -> Self {
        Self::new(body)
    }
}

/// Re-sending a received message keeps its identity and routing.
impl From<Message> for RequestConfig {
    fn from(message: Message) -> Self {
        Self {
            body: message.data,
            message_id: message.message_id,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            headers: message.headers,
            timeout: None,
        }
    }
}

/// Renders headers as `key: value` lines, sorted by key.
#[must_use]
pub fn headers_to_string(headers: &Headers) -> String {
    let mut entries: Vec<_> = headers.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut out = String::new();
    for (index, (key, value)) in entries.into_iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{key}: {value}");
    }
    out
}
