//! In-memory transport implementation for testing
//!
//! Brokers live inside the process and are bound to `host:port` endpoints of a
//! [`MemoryTransport`], so connection options (including broker lists and
//! reconnect policies) resolve exactly as they would against a real broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod connection;
mod link;

pub use broker::MemoryBroker;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use proven_amq_transport::{
    Connection, ConnectionDetails, ConnectionOptions, Transport, TransportError,
};
use tracing::{debug, warn};

use crate::connection::MemoryConnection;

/// Memory transport implementation
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    endpoints: Arc<DashMap<String, MemoryBroker>>,
}

impl MemoryTransport {
    /// Creates a transport with no brokers bound.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport with a single broker bound to `host:port`.
    #[must_use]
    pub fn with_broker(host: &str, port: u16, broker: &MemoryBroker) -> Self {
        let transport = Self::new();
        transport.bind(host, port, broker);
        transport
    }

    /// Makes the broker reachable at `host:port`.
    pub fn bind(&self, host: &str, port: u16, broker: &MemoryBroker) {
        self.endpoints
            .insert(format!("{host}:{port}"), broker.clone());
    }

    /// Removes whatever broker is bound to `host:port`.
    pub fn unbind(&self, host: &str, port: u16) {
        self.endpoints.remove(&format!("{host}:{port}"));
    }

    fn try_connect(
        &self,
        details: &ConnectionDetails,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let endpoint = details.endpoint();

        let broker = self
            .endpoints
            .get(&endpoint)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("no broker listening on {endpoint}"))
            })?;

        if !broker.is_online() {
            return Err(TransportError::ConnectionFailed(format!(
                "broker {} on {endpoint} is offline",
                broker.name()
            )));
        }

        broker.authenticate(options.username.as_deref(), options.password.as_deref())?;

        debug!(%endpoint, broker = %broker.name(), "connecting to memory broker");

        Ok(Arc::new(MemoryConnection::open(broker)))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let mut retries = 0;

        loop {
            let details = options.next_details();

            match self.try_connect(&details, options) {
                Ok(connection) => return Ok(connection),
                Err(error) if options.reconnect.allows(retries) => {
                    let delay = options.reconnect.delay(retries);
                    warn!(
                        endpoint = %details.endpoint(),
                        %error,
                        retry = retries + 1,
                        ?delay,
                        "connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
