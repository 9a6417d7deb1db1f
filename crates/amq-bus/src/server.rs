//! Serving requests sent by [`ClientRequest`](crate::ClientRequest)s.
//!
//! A [`ConsumerServer`] reads its address with the selector
//! `correlationId is null`, so replies travelling on a shared queue are never
//! mistaken for requests. Each answer is a [`ServerResponse`] sent over a
//! sender opened just for it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use proven_amq_transport::{ReceiverEvent, ReceiverLink, ReceiverOptions, Selector};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RouteOptions;
use crate::connector::Connector;
use crate::error::{Error, ErrorHandler, Result};
use crate::log_adapter::{LogAdapter, Observers};
use crate::message::{Message, RequestConfig};
use crate::result::{OperationResult, OperationStatus};
use crate::transient::send_once;

/// Builds the reply body for a request.
///
/// Implemented for async closures taking the request [`Message`].
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// Returns the reply body, or `None` to send no reply.
    async fn respond(&self, request: Message) -> Option<String>;
}

#[async_trait]
impl<F, Fut> ServerHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    async fn respond(&self, request: Message) -> Option<String> {
        self(request).await
    }
}

/// The reply to one request, sent over its own link.
///
/// Carries a fresh message id and the request's message id as correlation id.
pub struct ServerResponse {
    connector: Connector,
    correlation_id: Option<String>,
    log_adapter: Arc<dyn LogAdapter>,
    message_id: String,
    route: RouteOptions,
}

impl ServerResponse {
    /// A response to `request`, sent to the route's `reply_to` by default.
    #[must_use]
    pub fn new(connector: &Connector, route: RouteOptions, request: &Message) -> Self {
        Self {
            connector: connector.clone(),
            correlation_id: request.message_id.clone(),
            log_adapter: connector.observers().log_adapter(),
            message_id: Uuid::new_v4().to_string(),
            route,
        }
    }

    /// Sets the log adapter.
    #[must_use]
    pub fn with_log_adapter(mut self, log_adapter: Arc<dyn LogAdapter>) -> Self {
        self.log_adapter = log_adapter;
        self
    }

    /// Id of the reply message.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Correlation id of the reply message.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Sends the reply to the route's `reply_to`.
    pub async fn send<B>(&self, body: B) -> OperationResult
    where
        B: Into<String>,
    {
        self.send_to(body, None).await
    }

    /// Sends the reply to `address`, falling back to the route's `reply_to`.
    ///
    /// Without any address the result is [`OperationStatus::ConfigError`]; a
    /// sender that cannot be created is [`OperationStatus::ConnectionError`];
    /// a sender that fails, times out or loses the delivery is
    /// [`OperationStatus::SenderError`].
    pub async fn send_to<B>(&self, body: B, address: Option<&str>) -> OperationResult
    where
        B: Into<String>,
    {
        let address = address
            .map(str::to_string)
            .or_else(|| self.route.reply_to.clone())
            .filter(|address| !address.is_empty());

        let result = match address {
            None => OperationResult::failure(
                OperationStatus::ConfigError,
                None,
                Error::ReplyToUndefined,
            ),
            Some(address) => self.deliver(body.into(), address).await,
        };

        self.log_adapter.on_server_response(&self.route, &result);
        result
    }

    async fn deliver(&self, body: String, address: String) -> OperationResult {
        let reply = RequestConfig {
            message_id: Some(self.message_id.clone()),
            correlation_id: self.correlation_id.clone(),
            ..RequestConfig::new(body)
        };
        let transport_message = reply.to_transport(None);
        let message = Message::from(&transport_message);

        let delivered = send_once(
            &self.connector,
            &address,
            transport_message,
            self.route.open_timeout(),
        )
        .await;

        match delivered {
            Ok(Some(_)) => OperationResult::success(Some(address)).with_message(message),
            Ok(None) => OperationResult::failure(
                OperationStatus::SenderError,
                Some(address),
                Error::DeliveryFailed,
            ),
            Err((status, error)) => OperationResult::failure(status, Some(address), error),
        }
    }
}

impl fmt::Debug for ServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerResponse")
            .field("message_id", &self.message_id)
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.route.reply_to)
            .finish_non_exhaustive()
    }
}

/// State shared with the receive loop.
struct ServerContext {
    connector: Connector,
    handler: Arc<dyn ServerHandler>,
    observers: Observers,
    route: RouteOptions,
}

impl ServerContext {
    async fn serve(&self, request: Message) {
        let log_adapter = self.observers.log_adapter();
        log_adapter.on_server_request(&self.route, &request);

        let response = ServerResponse::new(&self.connector, self.route.clone(), &request)
            .with_log_adapter(log_adapter);

        let Some(body) = self.handler.respond(request).await else {
            debug!(message_id = %response.message_id, "handler sent no reply");
            return;
        };

        let result = response.send(body).await;
        if let Some(error) = &result.cause {
            warn!(status = %result.status, %error, "server reply not sent");
        }
    }
}

struct Running {
    link: Arc<dyn ReceiverLink>,
    token: CancellationToken,
}

/// Serves requests arriving on a route's `address`.
///
/// Requests are handled one at a time in arrival order. Replies go to the
/// route's `reply_to`.
pub struct ConsumerServer {
    context: Arc<ServerContext>,
    running: Mutex<Option<Running>>,
    tasks: TaskTracker,
}

impl ConsumerServer {
    /// Creates a stopped server using the connector's error handler and log
    /// adapter.
    pub fn new<H>(connector: &Connector, route: RouteOptions, handler: H) -> Self
    where
        H: ServerHandler,
    {
        Self {
            context: Arc::new(ServerContext {
                connector: connector.clone(),
                handler: Arc::new(handler),
                observers: Observers::inherit(connector.observers()),
                route,
            }),
            running: Mutex::new(None),
            tasks: TaskTracker::new(),
        }
    }

    /// Sets the handler receiving receiver failures.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.context.observers.set_error_handler(handler);
    }

    /// Sets the log adapter.
    pub fn set_log_adapter(&self, log_adapter: Arc<dyn LogAdapter>) {
        self.context.observers.set_log_adapter(log_adapter);
    }

    /// The route served.
    #[must_use]
    pub fn route(&self) -> &RouteOptions {
        &self.context.route
    }

    /// Whether the request receiver is attached.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| running.link.is_open())
    }

    /// Starts receiving requests. Does nothing if already started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressUndefined`] without an address, or the
    /// connector's error if the receiver cannot be created. Creation errors
    /// also reach the error handler.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("server already started");
            return Ok(());
        }

        let context = &self.context;
        let Some(address) = context
            .route
            .address
            .clone()
            .filter(|address| !address.is_empty())
        else {
            return Err(Error::AddressUndefined);
        };

        let selector = Selector::CorrelationIdIsNull;
        let handle = match context.connector.create_receiver(ReceiverOptions {
            address: address.clone(),
            selector: Some(selector.clone()),
            timeout: Some(context.route.open_timeout()),
        }) {
            Ok(handle) => handle,
            Err(error) => {
                drop(running);
                context.observers.log_adapter().on_connection_error(&error);
                context.observers.report(&error);
                return Err(error);
            }
        };

        info!(%address, %selector, "consumer server started");

        let token = CancellationToken::new();
        *running = Some(Running {
            link: handle.link,
            token: token.clone(),
        });
        drop(running);

        let context = context.clone();
        let mut events = handle.events;
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        debug!(%address, "server stopped, exiting receive loop");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(ReceiverEvent::Opened) => debug!(%address, "server receiver attached"),
                        Some(ReceiverEvent::Message(message)) => {
                            let request = Message::from(&message);
                            context.observers.log_adapter().on_receiver_message(&address, &request);
                            context.serve(request).await;
                        }
                        Some(ReceiverEvent::Error(error)) => {
                            context.observers.log_adapter().on_receiver_error(&address, &error);
                            context.observers.report(&Error::Receiver(error));
                        }
                        Some(ReceiverEvent::Closed) | None => {
                            debug!(%address, "server receiver closed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Stops receiving and waits for the request in progress, if any.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.token.cancel();
            running.link.close();
        }

        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

impl fmt::Debug for ConsumerServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerServer")
            .field("route", &self.context.route)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Drop for ConsumerServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
            running.link.close();
        }
        self.tasks.close();
    }
}
