use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::TransportError;
use crate::options::{ConnectionDetails, Scheme};

/// Round-robin resolver over a list of brokers.
///
/// Every call to [`BrokerList::next`] returns the following endpoint, wrapping
/// around at the end of the list. Transports call it once per connection
/// attempt, so reconnects rotate through the brokers.
#[derive(Debug)]
pub struct BrokerList {
    attempt: AtomicUsize,
    brokers: Vec<ConnectionDetails>,
}

impl BrokerList {
    /// Parses a comma separated `host:port` list.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty or an entry is not `host:port`.
    pub fn parse(brokers: &str, scheme: Scheme) -> Result<Self, TransportError> {
        let brokers = brokers
            .split(',')
            .map(str::trim)
            .filter(|broker| !broker.is_empty())
            .map(|broker| {
                let (host, port) = broker
                    .rsplit_once(':')
                    .ok_or_else(|| TransportError::InvalidBroker(broker.to_string()))?;
                let port = port
                    .parse()
                    .map_err(|_| TransportError::InvalidBroker(broker.to_string()))?;
                if host.is_empty() {
                    return Err(TransportError::InvalidBroker(broker.to_string()));
                }

                Ok(ConnectionDetails {
                    host: host.to_string(),
                    port,
                    scheme,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(brokers)
    }

    /// Creates a resolver over the given endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is given.
    pub fn new(brokers: Vec<ConnectionDetails>) -> Result<Self, TransportError> {
        if brokers.is_empty() {
            return Err(TransportError::EmptyBrokerList);
        }

        Ok(Self {
            attempt: AtomicUsize::new(0),
            brokers,
        })
    }

    /// Returns the endpoint for the next connection attempt.
    pub fn next(&self) -> ConnectionDetails {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
        let details = self.brokers[attempt % self.brokers.len()].clone();

        debug!(
            attempt = attempt + 1,
            endpoint = %details.endpoint(),
            "resolved broker for connection attempt"
        );

        details
    }

    /// All configured endpoints.
    #[must_use]
    pub fn brokers(&self) -> &[ConnectionDetails] {
        &self.brokers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let _ = tracing_subscriber::fmt::try_init();

        let list = BrokerList::parse("host1:1111,host2:2222", Scheme::Tcp).unwrap();

        let first = list.next();
        assert_eq!(first.host, "host1");
        assert_eq!(first.port, 1111);

        let second = list.next();
        assert_eq!(second.host, "host2");
        assert_eq!(second.port, 2222);

        let third = list.next();
        assert_eq!(third.host, "host1");
        assert_eq!(third.port, 1111);
    }

    #[test]
    fn test_scheme_is_applied() {
        let list = BrokerList::parse("broker:5671", Scheme::Tls).unwrap();
        assert_eq!(list.next().scheme, Scheme::Tls);
    }

    #[test]
    fn test_invalid_entries() {
        assert_eq!(
            BrokerList::parse("host1", Scheme::Tcp).unwrap_err(),
            TransportError::InvalidBroker("host1".to_string())
        );
        assert_eq!(
            BrokerList::parse("host1:port", Scheme::Tcp).unwrap_err(),
            TransportError::InvalidBroker("host1:port".to_string())
        );
        assert_eq!(
            BrokerList::parse(" , ", Scheme::Tcp).unwrap_err(),
            TransportError::EmptyBrokerList
        );
    }
}
