use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use proven_amq_transport::{LinkError, TransportMessage};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RouteOptions;
use crate::connector::Connector;
use crate::corresponder::{Corresponder, LinkHandler, Role};
use crate::error::{Error, ErrorHandler, Result};
use crate::log_adapter::{LogAdapter, Observers};
use crate::message::{Message, RequestConfig};
use crate::result::{OperationResult, OperationStatus};

/// Receives the requests (and receiver failures) of a [`Consumer`].
///
/// Implemented for async closures taking a [`ConsumerResult`].
#[async_trait]
pub trait ConsumerHandler: Send + Sync + 'static {
    /// Handles one inbound request or one receiver failure.
    async fn handle(&self, result: ConsumerResult);
}

#[async_trait]
impl<F, Fut> ConsumerHandler for F
where
    F: Fn(ConsumerResult) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, result: ConsumerResult) {
        self(result).await;
    }
}

struct ConsumerInner {
    corresponder: Corresponder,
    handler: RwLock<Option<Arc<dyn ConsumerHandler>>>,
    observers: Observers,
    this: Weak<Self>,
}

impl ConsumerInner {
    async fn dispatch(&self, result: OperationResult) {
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            warn!(status = %result.status, "no consumer handler set, dropping");
            return;
        };

        handler
            .handle(ConsumerResult {
                result,
                consumer: self.this.clone(),
            })
            .await;
    }

    fn send_reply(&self, request: Option<&Message>, reply: RequestConfig) -> OperationResult {
        let address = self.corresponder.sender_address();

        let correlation_id = reply.correlation_id.clone().or_else(|| {
            request.and_then(|request| {
                request
                    .correlation_id
                    .clone()
                    .or_else(|| request.message_id.clone())
            })
        });
        let Some(correlation_id) = correlation_id else {
            return OperationResult::failure(OperationStatus::ConfigError, address, Error::NoRequest);
        };

        let Some(sender) = self.corresponder.sender() else {
            let (status, error) = self.corresponder.sender_unavailable();
            return OperationResult::failure(status, address, error);
        };

        let reply = RequestConfig {
            correlation_id: Some(correlation_id),
            message_id: reply
                .message_id
                .or_else(|| Some(Uuid::new_v4().to_string())),
            ..reply
        };
        let transport_message = reply.to_transport(None);
        let message = Message::from(&transport_message);

        if sender.send(transport_message).is_none() {
            return OperationResult::failure(
                OperationStatus::OperationError,
                address,
                Error::DeliveryFailed,
            )
            .with_message(message);
        }

        let route = self.corresponder.route().unwrap_or_default();
        self.observers
            .log_adapter()
            .on_consumer_response(&route, &message);

        OperationResult::success(address).with_message(message)
    }
}

#[async_trait]
impl LinkHandler for ConsumerInner {
    fn connection_error(&self, error: &Error) {
        self.observers.log_adapter().on_connection_error(error);
        self.observers.report(error);
    }

    fn sender_error(&self, address: &str, error: &LinkError) {
        self.observers.log_adapter().on_sender_error(address, error);
    }

    async fn receiver_message(&self, address: &str, message: TransportMessage) {
        let message = Message::from(&message);
        let log_adapter = self.observers.log_adapter();
        log_adapter.on_receiver_message(address, &message);

        let route = self.corresponder.route().unwrap_or_default();
        log_adapter.on_consumer_request(&route, &message);

        self.dispatch(OperationResult::success(Some(address.to_string())).with_message(message))
            .await;
    }

    async fn receiver_error(&self, address: &str, error: LinkError) {
        self.observers.log_adapter().on_receiver_error(address, &error);

        let status_text = error
            .description
            .clone()
            .unwrap_or_else(|| error.condition.clone());
        let result = OperationResult::failure(
            OperationStatus::OperationError,
            Some(address.to_string()),
            Error::Receiver(error),
        )
        .with_status_text(status_text);

        self.dispatch(result).await;
    }
}

/// Receives requests and replies to them.
///
/// Requests are read from the route's `address` and handed to the
/// [`ConsumerHandler`]; replies go to the route's `reply_to`.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    /// Creates a closed consumer using the connector's error handler and log
    /// adapter.
    #[must_use]
    pub fn new(connector: &Connector) -> Self {
        let observers = Observers::inherit(connector.observers());
        let inner = Arc::new_cyclic(|this: &Weak<ConsumerInner>| {
            let handler: Weak<dyn LinkHandler> = this.clone();
            ConsumerInner {
                corresponder: Corresponder::new(connector.clone(), Role::Consumer, handler),
                handler: RwLock::new(None),
                observers,
                this: this.clone(),
            }
        });

        Self { inner }
    }

    /// Sets the handler receiving requests.
    ///
    /// Messages arriving while no handler is set are dropped.
    pub fn set_handler<H>(&self, handler: H)
    where
        H: ConsumerHandler,
    {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    /// Sets the handler receiving connection failures.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.inner.observers.set_error_handler(handler);
    }

    /// Sets the log adapter.
    pub fn set_log_adapter(&self, log_adapter: Arc<dyn LogAdapter>) {
        self.inner.observers.set_log_adapter(log_adapter);
    }

    /// The underlying links.
    #[must_use]
    pub fn corresponder(&self) -> &Corresponder {
        &self.inner.corresponder
    }

    /// Address requests are read from.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.inner.corresponder.receiver_address()
    }

    /// Address replies are sent to.
    #[must_use]
    pub fn reply_to(&self) -> Option<String> {
        self.inner.corresponder.sender_address()
    }

    /// Whether the receiving link is attached.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.corresponder.is_open()
    }

    /// Opens the links for the route.
    ///
    /// # Errors
    ///
    /// Returns an error if the links cannot be opened.
    pub async fn open(&self, route: RouteOptions) -> Result<()> {
        self.inner.corresponder.open(route.clone()).await?;
        if self.is_open() {
            debug!(address = ?self.address(), "consumer open");
            self.inner.observers.log_adapter().on_consumer_open(&route);
        }
        Ok(())
    }

    /// Closes the links.
    ///
    /// # Errors
    ///
    /// Returns an error if the links do not close in time.
    pub async fn close(&self) -> Result<()> {
        self.inner.corresponder.close().await
    }

    /// Sends a reply without an inbound request.
    ///
    /// The reply must carry its own correlation id.
    pub fn send_reply<R>(&self, reply: R) -> OperationResult
    where
        R: Into<RequestConfig>,
    {
        self.inner.send_reply(None, reply.into())
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("corresponder", &self.inner.corresponder)
            .field("has_handler", &self.inner.handler.read().is_some())
            .finish()
    }
}

/// An inbound request, or a receiver failure, as seen by a
/// [`ConsumerHandler`].
///
/// Dereferences to the [`OperationResult`].
pub struct ConsumerResult {
    result: OperationResult,
    consumer: Weak<ConsumerInner>,
}

impl ConsumerResult {
    /// Replies to the request.
    ///
    /// The reply's correlation id defaults to the request's correlation id,
    /// then to its message id. Fails with [`OperationStatus::ConfigError`] if
    /// the consumer is gone or has no reply link.
    pub fn send_reply<R>(&self, reply: R) -> OperationResult
    where
        R: Into<RequestConfig>,
    {
        let reply = reply.into();
        match self.consumer.upgrade() {
            Some(consumer) => consumer.send_reply(self.result.message.as_ref(), reply),
            None => OperationResult::failure(
                OperationStatus::ConfigError,
                None,
                Error::SenderNotOpened,
            ),
        }
    }

    /// The consumer that received the request, if still alive.
    #[must_use]
    pub fn consumer(&self) -> Option<Consumer> {
        self.consumer.upgrade().map(|inner| Consumer { inner })
    }

    /// The underlying result.
    #[must_use]
    pub fn into_result(self) -> OperationResult {
        self.result
    }
}

impl Deref for ConsumerResult {
    type Target = OperationResult;

    fn deref(&self) -> &Self::Target {
        &self.result
    }
}

impl fmt::Debug for ConsumerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerResult")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}
