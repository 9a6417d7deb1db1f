use std::sync::Arc;
use std::time::Duration;

use crate::config::RouteOptions;
use crate::connector::Connector;
use crate::consumer::ConsumerResult;
use crate::error::{Error, ErrorHandler, Result};
use crate::log_adapter::LogAdapter;
use crate::message::{Message, RequestConfig};
use crate::producer::{Producer, ProducerResult};
use crate::result::{OperationResult, OperationStatus};

/// Moves requests a consumer cannot handle to a backout address.
///
/// Backed-out messages keep their ids and reply address, so whoever handles
/// the backout queue can still answer the original requester.
#[derive(Clone, Debug)]
pub struct BackoutProducer {
    producer: Producer,
}

impl BackoutProducer {
    /// Creates a closed backout producer.
    #[must_use]
    pub fn new(connector: &Connector) -> Self {
        Self {
            producer: Producer::new(connector),
        }
    }

    /// Sets the handler receiving link failures.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.producer.set_error_handler(handler);
    }

    /// Sets the log adapter.
    pub fn set_log_adapter(&self, log_adapter: Arc<dyn LogAdapter>) {
        self.producer.set_log_adapter(log_adapter);
    }

    /// The producer used for sending.
    #[must_use]
    pub const fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Whether the backout link is attached.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.producer.is_open()
    }

    /// Opens the link to the backout address.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be opened.
    pub async fn open(&self, route: RouteOptions) -> Result<()> {
        self.producer.open(route).await
    }

    /// Closes the link.
    ///
    /// # Errors
    ///
    /// Returns an error if the link does not close in time.
    pub async fn close(&self) -> Result<()> {
        self.producer.close().await
    }

    /// Sends a new message to the backout address.
    pub fn send<R>(&self, request: R) -> ProducerResult
    where
        R: Into<RequestConfig>,
    {
        self.producer.send(request)
    }

    /// Sends a new message to the backout address and waits for its reply.
    pub async fn request_reply<R>(&self, request: R, timeout: Option<Duration>) -> OperationResult
    where
        R: Into<RequestConfig>,
    {
        self.producer.request_reply(request, timeout).await
    }

    /// Forwards a received message unchanged.
    pub fn republish(&self, message: &Message) -> ProducerResult {
        self.producer.send(message.clone())
    }

    /// Forwards the request behind a consumer result.
    pub fn backout(&self, request: &ConsumerResult) -> OperationResult {
        let Some(message) = request.message.as_ref() else {
            return OperationResult::failure(
                OperationStatus::ConfigError,
                self.producer.address(),
                Error::NoRequest,
            );
        };

        let route = self.producer.corresponder().route().unwrap_or_default();
        self.producer
            .log_adapter()
            .on_consumer_backout(&route, message);

        self.republish(message).into_result()
    }
}
