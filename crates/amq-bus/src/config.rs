//! Configuration types.
//!
//! Keys are camelCase. Numeric settings accept either JSON numbers or numeric
//! strings, since values usually come from environment variables.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use proven_amq_transport::{BrokerList, ConnectionOptions, DEFAULT_PORT, ReconnectPolicy, Scheme};
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Link-open deadline used when a route sets none.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(30_000);

const DEFAULT_HOST: &str = "localhost";

/// Top-level bus configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmqBusConfig {
    /// Broker connection.
    pub connector: ConnectorConfig,

    /// Route served by the consumer.
    #[serde(default)]
    pub consumer: Option<RouteOptions>,

    /// Producer route or named routes.
    #[serde(default)]
    pub producer: Option<Routes>,

    /// Dead-letter route.
    #[serde(default)]
    pub backout: Option<RouteOptions>,
}

impl AmqBusConfig {
    /// Looks up a producer route; `None` selects the default route.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouteNotFound`] if no such route is configured.
    pub fn producer_route(&self, name: Option<&str>) -> Result<&RouteOptions> {
        self.producer.as_ref().map_or_else(
            || Err(Error::RouteNotFound(name.unwrap_or("default").to_string())),
            |routes| routes.route(name),
        )
    }
}

/// Broker connection settings.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Socket transport: `tcp`, `tls` or `ssl`.
    #[serde(default)]
    pub transport: Option<String>,

    /// Broker host.
    #[serde(default)]
    pub host: Option<String>,

    /// Broker port.
    #[serde(default, deserialize_with = "de::opt_u16")]
    pub port: Option<u16>,

    /// SASL username.
    #[serde(default)]
    pub username: Option<String>,

    /// SASL password.
    #[serde(default)]
    pub password: Option<String>,

    /// PEM certificate authority.
    #[serde(default)]
    pub ca: Option<String>,

    /// Comma separated `host:port` list, takes precedence over host and port.
    #[serde(default)]
    pub brokers: Option<String>,

    /// Reconnect behaviour.
    #[serde(default)]
    pub reconnect_options: Option<ReconnectConfig>,
}

impl ConnectorConfig {
    /// Builds transport connection options.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport name, broker list or reconnect
    /// settings are invalid.
    pub fn connection_options(&self) -> Result<ConnectionOptions> {
        let transport = self.transport.as_deref().unwrap_or_default();
        let scheme = Scheme::parse(transport)
            .ok_or_else(|| Error::InvalidConfig(format!("unsupported transport '{transport}'")))?;

        let connection_details = self
            .brokers
            .as_deref()
            .map(|brokers| BrokerList::parse(brokers, scheme).map(Arc::new))
            .transpose()?;

        let reconnect = self
            .reconnect_options
            .as_ref()
            .map(ReconnectConfig::policy)
            .transpose()?
            .unwrap_or_default();

        Ok(ConnectionOptions {
            ca: self.ca.clone(),
            connection_details,
            host: self
                .host
                .clone()
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            password: self.password.clone(),
            port: self.port.unwrap_or(DEFAULT_PORT),
            reconnect,
            scheme,
            username: self.username.clone(),
        })
    }
}

impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("transport", &self.transport)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("brokers", &self.brokers)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "{*hidden}"))
            .field("ca", &self.ca.as_ref().map(|_| "{*hidden}"))
            .field("reconnect_options", &self.reconnect_options)
            .finish()
    }
}

/// The `reconnect` setting: a flag, a fixed delay in ms, or either as text.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ReconnectSetting {
    /// Enable or disable reconnecting.
    Flag(bool),

    /// Reconnect with a fixed delay in milliseconds.
    Delay(u64),

    /// `"true"`, `"false"` or a delay in milliseconds.
    Text(String),
}

/// Reconnect settings handed to the transport.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    /// Whether to reconnect, or the fixed delay to use. Enabled if absent.
    #[serde(default)]
    pub reconnect: Option<ReconnectSetting>,

    /// Maximum number of attempts.
    #[serde(default, deserialize_with = "de::opt_u32")]
    pub attempt_limit: Option<u32>,

    /// First backoff interval.
    #[serde(default, deserialize_with = "de::opt_millis")]
    pub min_interval: Option<Duration>,

    /// Backoff ceiling.
    #[serde(default, deserialize_with = "de::opt_millis")]
    pub max_interval: Option<Duration>,
}

impl ReconnectConfig {
    /// Maps the settings onto a transport reconnect policy.
    ///
    /// # Errors
    ///
    /// Returns an error if a textual setting is neither a flag nor a number.
    pub fn policy(&self) -> Result<ReconnectPolicy> {
        let mut policy = ReconnectPolicy {
            enabled: true,
            limit: self.attempt_limit,
            ..ReconnectPolicy::default()
        };
        if let Some(min) = self.min_interval {
            policy.initial_delay = min;
        }
        if let Some(max) = self.max_interval {
            policy.max_delay = max;
        }

        let fixed_delay = match &self.reconnect {
            None => None,
            Some(ReconnectSetting::Flag(enabled)) => {
                policy.enabled = *enabled;
                None
            }
            Some(ReconnectSetting::Delay(delay)) => Some(*delay),
            Some(ReconnectSetting::Text(text)) => match text.trim() {
                "true" => None,
                "false" => {
                    policy.enabled = false;
                    None
                }
                other => Some(other.parse::<u64>().map_err(|_| {
                    Error::InvalidConfig(format!("invalid reconnect setting '{other}'"))
                })?),
            },
        };

        if let Some(delay) = fixed_delay {
            policy.initial_delay = Duration::from_millis(delay);
            policy.max_delay = Duration::from_millis(delay);
        }

        Ok(policy)
    }
}

/// Addresses and link-open timeout of a producer or consumer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOptions {
    /// Route name, used to pick one out of several producer routes.
    #[serde(default)]
    pub name: Option<String>,

    /// Primary address.
    #[serde(default)]
    pub address: Option<String>,

    /// Paired address for the other direction.
    #[serde(default)]
    pub reply_to: Option<String>,

    /// Link-open deadline.
    #[serde(default, deserialize_with = "de::opt_millis")]
    pub timeout: Option<Duration>,
}

impl RouteOptions {
    /// A route with just a primary address.
    pub fn new<A>(address: A) -> Self
    where
        A: Into<String>,
    {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
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

    /// Sets the link-open deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Link-open deadline, defaulted.
    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_OPEN_TIMEOUT)
    }
}

/// A single route or a list of named routes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Routes {
    /// One route.
    Single(RouteOptions),

    /// Routes looked up by name.
    Named(Vec<RouteOptions>),
}

impl Routes {
    /// Looks up a route by name; `None` selects the first route.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouteNotFound`] if no route matches.
    pub fn route(&self, name: Option<&str>) -> Result<&RouteOptions> {
        let routes = match self {
            Self::Single(route) => std::slice::from_ref(route),
            Self::Named(routes) => routes.as_slice(),
        };

        let route = match name {
            None => routes.first(),
            Some(name) => routes
                .iter()
                .find(|route| route.name.as_deref() == Some(name)),
        };

        route.ok_or_else(|| Error::RouteNotFound(name.unwrap_or("default").to_string()))
    }
}

mod de {
    use super::{Deserialize, Deserializer, Duration};

    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        Text(String),
    }

    fn opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<NumberOrString>::deserialize(deserializer)?
            .map(|value| match value {
                NumberOrString::Number(number) => Ok(number),
                NumberOrString::Text(text) => text
                    .trim()
                    .parse()
                    .map_err(|_| D::Error::custom(format!("'{text}' is not a number"))),
            })
            .transpose()
    }

    pub fn opt_u16<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        opt_u64(deserializer)?
            .map(|value| u16::try_from(value).map_err(D::Error::custom))
            .transpose()
    }

    pub fn opt_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        opt_u64(deserializer)?
            .map(|value| u32::try_from(value).map_err(D::Error::custom))
            .transpose()
    }

    pub fn opt_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(opt_u64(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proven_amq_transport::TransportError;
    use serde_json::json;

    #[test]
    fn test_full_config() {
        let config: AmqBusConfig = serde_json::from_value(json!({
            "connector": {
                "transport": "tls",
                "host": "broker.local",
                "port": "5671",
                "username": "artemis",
                "password": "secret",
                "reconnectOptions": {
                    "reconnect": "true",
                    "attemptLimit": "5",
                    "minInterval": 100,
                    "maxInterval": "2000"
                }
            },
            "consumer": { "address": "Q.IN", "replyTo": "Q.OUT", "timeout": "5000" },
            "producer": { "address": "Q.IN", "replyTo": "Q.OUT" },
            "backout": { "address": "DLQ" }
        }))
        .unwrap();

        let options = config.connector.connection_options().unwrap();
        assert_eq!(options.host, "broker.local");
        assert_eq!(options.port, 5671);
        assert_eq!(options.scheme, Scheme::Tls);
        assert_eq!(
            options.reconnect,
            ReconnectPolicy {
                enabled: true,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(2000),
                limit: Some(5),
            }
        );

        let consumer = config.consumer.unwrap();
        assert_eq!(consumer.open_timeout(), Duration::from_millis(5000));
        assert_eq!(
            config.backout.unwrap().open_timeout(),
            DEFAULT_OPEN_TIMEOUT
        );
    }

    #[test]
    fn test_defaults() {
        let config: ConnectorConfig = serde_json::from_value(json!({})).unwrap();
        let options = config.connection_options().unwrap();

        assert_eq!(options.host, "localhost");
        assert_eq!(options.port, DEFAULT_PORT);
        assert_eq!(options.scheme, Scheme::Tcp);
        assert!(!options.reconnect.enabled);
        assert!(options.connection_details.is_none());
    }

    #[test]
    fn test_invalid_values() {
        assert!(serde_json::from_value::<ConnectorConfig>(json!({"port": "abc"})).is_err());
        assert!(serde_json::from_value::<ConnectorConfig>(json!({"port": 70000})).is_err());

        let config: ConnectorConfig =
            serde_json::from_value(json!({"transport": "carrier-pigeon"})).unwrap();
        assert!(matches!(
            config.connection_options(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_broker_list() {
        let config: ConnectorConfig =
            serde_json::from_value(json!({"brokers": "host1:1111,host2:2222"})).unwrap();
        let options = config.connection_options().unwrap();

        let endpoints: Vec<_> = (0..3).map(|_| options.next_details().endpoint()).collect();
        assert_eq!(endpoints, ["host1:1111", "host2:2222", "host1:1111"]);

        let config: ConnectorConfig =
            serde_json::from_value(json!({"brokers": "host1"})).unwrap();
        assert!(matches!(
            config.connection_options(),
            Err(Error::Transport(TransportError::InvalidBroker(_)))
        ));
    }

    #[test]
    fn test_reconnect_settings() {
        let policy = |value: serde_json::Value| {
            serde_json::from_value::<ReconnectConfig>(json!({ "reconnect": value }))
                .unwrap()
                .policy()
        };

        assert!(policy(json!(true)).unwrap().enabled);
        assert!(!policy(json!(false)).unwrap().enabled);
        assert!(!policy(json!("false")).unwrap().enabled);
        assert!(policy(json!("true")).unwrap().enabled);

        let fixed = policy(json!(250)).unwrap();
        assert!(fixed.enabled);
        assert_eq!(fixed.initial_delay, Duration::from_millis(250));
        assert_eq!(fixed.max_delay, Duration::from_millis(250));

        assert_eq!(
            policy(json!("750")).unwrap().initial_delay,
            Duration::from_millis(750)
        );
        assert!(matches!(policy(json!("often")), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_named_routes() {
        let config: AmqBusConfig = serde_json::from_value(json!({
            "connector": {},
            "producer": [
                { "name": "orders", "address": "Q.ORDERS", "replyTo": "Q.ORDERS.REPLY" },
                { "name": "audit", "address": "Q.AUDIT" }
            ]
        }))
        .unwrap();

        assert_eq!(
            config.producer_route(Some("audit")).unwrap().address.as_deref(),
            Some("Q.AUDIT")
        );
        assert_eq!(
            config.producer_route(None).unwrap().name.as_deref(),
            Some("orders")
        );
        assert_eq!(
            config.producer_route(Some("billing")),
            Err(Error::RouteNotFound("billing".to_string()))
        );
    }

    #[test]
    fn test_debug_hides_credentials() {
        let config: ConnectorConfig =
            serde_json::from_value(json!({"username": "artemis", "password": "secret"})).unwrap();

        let debug = format!("{config:?}");
        assert!(debug.contains("artemis"));
        assert!(!debug.contains("secret"));
    }
}
