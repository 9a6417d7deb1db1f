use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::broker_list::BrokerList;
use crate::message::TransportMessage;

/// Default AMQP port.
pub const DEFAULT_PORT: u16 = 5672;

/// Socket transport used to reach the broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain TCP.
    #[default]
    Tcp,

    /// TLS over TCP.
    Tls,
}

impl Scheme {
    /// Parses the scheme names accepted in configuration (`tcp`, `tls`, `ssl`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" | "" => Some(Self::Tcp),
            "tls" | "ssl" => Some(Self::Tls),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Tls => write!(f, "tls"),
        }
    }
}

/// A single broker endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionDetails {
    /// Broker host.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Socket transport.
    pub scheme: Scheme,
}

impl ConnectionDetails {
    /// Returns the `host:port` form of the endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Reconnect behaviour applied by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether the transport retries failed or lost connections.
    pub enabled: bool,

    /// Delay before the first retry; doubled on every further attempt.
    pub initial_delay: Duration,

    /// Upper bound for the retry delay.
    pub max_delay: Duration,

    /// Maximum number of retries, unbounded if `None`.
    pub limit: Option<u32>,
}

impl ReconnectPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Backoff delay before retry number `attempt` (zero based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Whether another retry is allowed after `attempts` retries.
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        self.enabled && self.limit.is_none_or(|limit| attempts < limit)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            limit: None,
        }
    }
}

/// Options used to open a connection.
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    /// PEM encoded certificate authority for TLS.
    pub ca: Option<String>,

    /// Optional resolver rotating through several brokers.
    pub connection_details: Option<Arc<BrokerList>>,

    /// Broker host, used when no broker list is configured.
    pub host: String,

    /// Password for SASL PLAIN.
    pub password: Option<String>,

    /// Broker port, used when no broker list is configured.
    pub port: u16,

    /// Reconnect policy.
    pub reconnect: ReconnectPolicy,

    /// Socket transport, used when no broker list is configured.
    pub scheme: Scheme,

    /// Username for SASL PLAIN.
    pub username: Option<String>,
}

impl ConnectionOptions {
    /// Options for a single broker endpoint.
    pub fn new<H>(host: H, port: u16) -> Self
    where
        H: Into<String>,
    {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Endpoint for the next connection attempt.
    ///
    /// Rotates through the broker list if one is configured.
    #[must_use]
    pub fn next_details(&self) -> ConnectionDetails {
        self.connection_details.as_ref().map_or_else(
            || ConnectionDetails {
                host: self.host.clone(),
                port: self.port,
                scheme: self.scheme,
            },
            |brokers| brokers.next(),
        )
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("connection_details", &self.connection_details)
            .field("reconnect", &self.reconnect)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "{*hidden}"))
            .field("ca", &self.ca.as_ref().map(|_| "{*hidden}"))
            .finish()
    }
}

/// Options used to attach a sending link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderOptions {
    /// Target address.
    pub address: String,

    /// Attach timeout advertised to the broker.
    pub timeout: Option<Duration>,
}

impl From<&str> for SenderOptions {
    fn from(address: &str) -> Self {
        Self {
            address: address.to_string(),
            timeout: None,
        }
    }
}

impl From<String> for SenderOptions {
    fn from(address: String) -> Self {
        Self {
            address,
            timeout: None,
        }
    }
}

/// Message filter applied by the broker on a receiving link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// Only messages whose correlation id equals the value.
    CorrelationId(String),

    /// Only messages without a correlation id.
    CorrelationIdIsNull,
}

impl Selector {
    /// Whether the message passes the filter.
    #[must_use]
    pub fn matches(&self, message: &TransportMessage) -> bool {
        match self {
            Self::CorrelationId(expected) => {
                message.correlation_id.as_deref() == Some(expected.as_str())
            }
            Self::CorrelationIdIsNull => message.correlation_id.is_none(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorrelationId(value) => write!(f, "JMSCorrelationID = '{value}'"),
            Self::CorrelationIdIsNull => write!(f, "JMSCorrelationID is null"),
        }
    }
}

/// Options used to attach a receiving link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// Source address.
    pub address: String,

    /// Optional message filter.
    pub selector: Option<Selector>,

    /// Attach timeout advertised to the broker.
    pub timeout: Option<Duration>,
}

impl From<&str> for ReceiverOptions {
    fn from(address: &str) -> Self {
        Self {
            address: address.to_string(),
            selector: None,
            timeout: None,
        }
    }
}

impl From<String> for ReceiverOptions {
    fn from(address: String) -> Self {
        Self {
            address,
            selector: None,
            timeout: None,
        }
    }
}
