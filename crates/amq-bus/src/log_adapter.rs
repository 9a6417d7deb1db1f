use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;
use proven_amq_transport::{ConnectionOptions, LinkError, TransportError};
use tracing::{debug, error, info, warn};

use crate::config::RouteOptions;
use crate::error::{Error, ErrorHandler};
use crate::message::Message;
use crate::result::OperationResult;

const HIDDEN_ALTERNATE: &str = "{*hidden}";
const EMPTY_ALTERNATE: &str = "{*empty}";

/// Structured log sink for bus activity.
///
/// Every callback is fire-and-forget and defaults to doing nothing.
#[allow(unused_variables)]
pub trait LogAdapter: Debug + Send + Sync + 'static {
    /// The connector connected.
    fn on_connect(&self, options: &ConnectionOptions) {}

    /// The connector disconnected, with the cause if it was not deliberate.
    fn on_disconnect(&self, error: Option<&TransportError>) {}

    /// A connection or link could not be established.
    fn on_connection_error(&self, error: &Error) {}

    /// A sending link reported an error.
    fn on_sender_error(&self, address: &str, error: &LinkError) {}

    /// A receiving link reported an error.
    fn on_receiver_error(&self, address: &str, error: &LinkError) {}

    /// A message arrived on a receiving link.
    fn on_receiver_message(&self, address: &str, message: &Message) {}

    /// A producer opened.
    fn on_producer_open(&self, route: &RouteOptions) {}

    /// A producer sent a request.
    fn on_producer_request(&self, route: &RouteOptions, message: &Message) {}

    /// A producer received the reply to a request.
    fn on_producer_response(&self, route: &RouteOptions, message: &Message) {}

    /// A consumer opened.
    fn on_consumer_open(&self, route: &RouteOptions) {}

    /// A consumer received a request.
    fn on_consumer_request(&self, route: &RouteOptions, message: &Message) {}

    /// A consumer sent a reply.
    fn on_consumer_response(&self, route: &RouteOptions, message: &Message) {}

    /// A consumed request was moved to the dead-letter address.
    fn on_consumer_backout(&self, route: &RouteOptions, message: &Message) {}

    /// A client request was sent on its own link.
    fn on_client_request(&self, route: &RouteOptions, message: &Message) {}

    /// The reply to a client request arrived on its own link.
    fn on_client_response(&self, route: &RouteOptions, message: &Message) {}

    /// A server received a request.
    fn on_server_request(&self, route: &RouteOptions, message: &Message) {}

    /// A server answered a request, successfully or not.
    fn on_server_response(&self, route: &RouteOptions, result: &OperationResult) {}

    /// Something went wrong outside any call.
    fn on_error(&self, context: &str, error: &Error) {}
}

/// Log adapter emitting `tracing` events.
///
/// Each event carries an `event` field naming it. Payloads are replaced by
/// `{*hidden}` unless `show_content` is set.
#[derive(Clone, Debug, Default)]
pub struct TracingLogAdapter {
    /// Log message payloads verbatim.
    pub show_content: bool,
}

impl TracingLogAdapter {
    /// Creates an adapter.
    #[must_use]
    pub const fn new(show_content: bool) -> Self {
        Self { show_content }
    }

    fn payload<'a>(&self, data: Option<&'a str>) -> &'a str {
        match data {
            None | Some("") => EMPTY_ALTERNATE,
            Some(_) if !self.show_content => HIDDEN_ALTERNATE,
            Some(data) => data,
        }
    }

    fn message_event(
        &self,
        event: &'static str,
        text: &'static str,
        route: &RouteOptions,
        message: &Message,
    ) {
        info!(
            event,
            address = route.address.as_deref().unwrap_or_default(),
            reply_to = route.reply_to.as_deref().unwrap_or_default(),
            message_id = message.message_id.as_deref().unwrap_or_default(),
            correlation_id = message.correlation_id.as_deref().unwrap_or_default(),
            data = self.payload(message.data.as_deref()),
            "{text}"
        );
    }
}

impl LogAdapter for TracingLogAdapter {
    fn on_connect(&self, options: &ConnectionOptions) {
        info!(
            event = "AmqBusConnected",
            host = %options.host,
            port = options.port,
            scheme = %options.scheme,
            brokers = ?options.connection_details.as_ref().map(|brokers| brokers.brokers().len()),
            username = options.username.as_deref().unwrap_or_default(),
            "AMQ Connector connected"
        );
    }

    fn on_disconnect(&self, error: Option<&TransportError>) {
        match error {
            Some(error) => warn!(event = "AmqBusDisconnected", %error, "AMQ Connector disconnected"),
            None => info!(event = "AmqBusDisconnected", "AMQ Connector disconnected"),
        }
    }

    fn on_connection_error(&self, error: &Error) {
        error!(event = "AmqBusConnectionError", %error, "AMQ connection error");
    }

    fn on_sender_error(&self, address: &str, error: &LinkError) {
        warn!(event = "AmqSenderError", address, %error, "AMQ sender error");
    }

    fn on_receiver_error(&self, address: &str, error: &LinkError) {
        warn!(event = "AmqReceiverError", address, %error, "AMQ receiver error");
    }

    fn on_receiver_message(&self, address: &str, message: &Message) {
        debug!(
            event = "AmqReceiverMessage",
            address,
            message_id = message.message_id.as_deref().unwrap_or_default(),
            correlation_id = message.correlation_id.as_deref().unwrap_or_default(),
            "AMQ message received"
        );
    }

    fn on_producer_open(&self, route: &RouteOptions) {
        info!(
            event = "AmqProducerOpen",
            address = route.address.as_deref().unwrap_or_default(),
            reply_to = route.reply_to.as_deref().unwrap_or_default(),
            "AMQ Producer opened"
        );
    }

    fn on_producer_request(&self, route: &RouteOptions, message: &Message) {
        self.message_event("AmqProducerRequest", "Outgoing AMQ request SENT", route, message);
    }

    fn on_producer_response(&self, route: &RouteOptions, message: &Message) {
        self.message_event(
            "AmqProducerResponse",
            "Outgoing AMQ request response RECEIVED",
            route,
            message,
        );
    }

    fn on_consumer_open(&self, route: &RouteOptions) {
        info!(
            event = "AmqConsumerOpen",
            address = route.address.as_deref().unwrap_or_default(),
            reply_to = route.reply_to.as_deref().unwrap_or_default(),
            "AMQ Consumer opened"
        );
    }

    fn on_consumer_request(&self, route: &RouteOptions, message: &Message) {
        self.message_event("AmqConsumerRequest", "Incoming AMQ request RECEIVED", route, message);
    }

    fn on_consumer_response(&self, route: &RouteOptions, message: &Message) {
        self.message_event(
            "AmqConsumerResponse",
            "Incoming AMQ request response REPLY",
            route,
            message,
        );
    }

    fn on_consumer_backout(&self, route: &RouteOptions, message: &Message) {
        self.message_event(
            "AmqConsumerBackout",
            "Incoming AMQ request backout",
            route,
            message,
        );
    }

    fn on_client_request(&self, route: &RouteOptions, message: &Message) {
        self.message_event("AmqClientRequest", "Outgoing AMQ client request SENT", route, message);
    }

    fn on_client_response(&self, route: &RouteOptions, message: &Message) {
        self.message_event(
            "AmqClientResponse",
            "Outgoing AMQ client request response RECEIVED",
            route,
            message,
        );
    }

    fn on_server_request(&self, route: &RouteOptions, message: &Message) {
        self.message_event("AmqServerRequest", "Incoming AMQ server request RECEIVED", route, message);
    }

    fn on_server_response(&self, route: &RouteOptions, result: &OperationResult) {
        let message = result.message.as_ref();
        let message_id = message.and_then(|m| m.message_id.as_deref()).unwrap_or_default();
        let correlation_id = message
            .and_then(|m| m.correlation_id.as_deref())
            .unwrap_or_default();

        if result.is_success() {
            info!(
                event = "AmqServerResponse",
                topic = route.address.as_deref().unwrap_or_default(),
                address = result.address.as_deref().unwrap_or_default(),
                status = %result.status,
                message_id,
                correlation_id,
                data = self.payload(message.and_then(|m| m.data.as_deref())),
                "Incoming AMQ server request response REPLY"
            );
        } else {
            warn!(
                event = "AmqServerResponse",
                topic = route.address.as_deref().unwrap_or_default(),
                address = result.address.as_deref().unwrap_or_default(),
                status = %result.status,
                error = result.status_text.as_deref().unwrap_or_default(),
                "Incoming AMQ server request response FAILED"
            );
        }
    }

    fn on_error(&self, context: &str, error: &Error) {
        error!(event = "AmqBusError", %error, "{context}");
    }
}

/// Error handler and log adapter of one bus component.
pub(crate) struct Observers {
    error_handler: RwLock<Option<ErrorHandler>>,
    log_adapter: RwLock<Arc<dyn LogAdapter>>,
}

impl Observers {
    pub fn new() -> Self {
        Self {
            error_handler: RwLock::new(None),
            log_adapter: RwLock::new(Arc::new(TracingLogAdapter::default())),
        }
    }

    /// Starts out with whatever `other` currently uses.
    pub fn inherit(other: &Self) -> Self {
        Self {
            error_handler: RwLock::new(other.error_handler.read().clone()),
            log_adapter: RwLock::new(other.log_adapter()),
        }
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.write() = Some(handler);
    }

    pub fn set_log_adapter(&self, log_adapter: Arc<dyn LogAdapter>) {
        *self.log_adapter.write() = log_adapter;
    }

    pub fn log_adapter(&self) -> Arc<dyn LogAdapter> {
        self.log_adapter.read().clone()
    }

    /// Passes the error to the error handler, if any.
    pub fn report(&self, error: &Error) {
        let handler = self.error_handler.read().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tracing_test::traced_test;

    fn message(data: Option<&str>) -> Message {
        Message {
            message_id: Some("m1".to_string()),
            correlation_id: Some("c1".to_string()),
            data: data.map(str::to_string),
            ..Message::default()
        }
    }

    #[test]
    fn test_payload_alternates() {
        let hidden = TracingLogAdapter::default();
        assert_eq!(hidden.payload(Some("secret")), HIDDEN_ALTERNATE);
        assert_eq!(hidden.payload(None), EMPTY_ALTERNATE);
        assert_eq!(hidden.payload(Some("")), EMPTY_ALTERNATE);

        let shown = TracingLogAdapter::new(true);
        assert_eq!(shown.payload(Some("ping")), "ping");
        assert_eq!(shown.payload(None), EMPTY_ALTERNATE);
    }

    #[traced_test]
    #[test]
    fn test_request_event_hides_payload() {
        let route = RouteOptions::new("Q.IN").with_reply_to("Q.OUT");

        TracingLogAdapter::default().on_producer_request(&route, &message(Some("card-number")));

        assert!(logs_contain("AmqProducerRequest"));
        assert!(logs_contain("Q.IN"));
        assert!(logs_contain("{*hidden}"));
        assert!(!logs_contain("card-number"));
    }

    #[traced_test]
    #[test]
    fn test_connect_event_omits_password() {
        let mut options = ConnectionOptions::new("broker.local", 5672);
        options.username = Some("artemis".to_string());
        options.password = Some("hunter2".to_string());

        TracingLogAdapter::default().on_connect(&options);

        assert!(logs_contain("AmqBusConnected"));
        assert!(logs_contain("broker.local"));
        assert!(!logs_contain("hunter2"));
    }

    #[traced_test]
    #[test]
    fn test_server_response_event_carries_status() {
        let route = RouteOptions::new("Q.SERVER").with_reply_to("Q.CLIENT");
        let adapter = TracingLogAdapter::default();

        adapter.on_server_response(
            &route,
            &OperationResult::success(Some("Q.CLIENT".to_string()))
                .with_message(message(Some("card-number"))),
        );
        assert!(logs_contain("AmqServerResponse"));
        assert!(logs_contain("SUCCESS"));
        assert!(!logs_contain("card-number"));

        adapter.on_server_response(
            &route,
            &OperationResult::failure(
                crate::result::OperationStatus::SenderError,
                Some("Q.CLIENT".to_string()),
                Error::DeliveryFailed,
            ),
        );
        assert!(logs_contain("SENDER_ERROR"));
        assert!(logs_contain("Message delivery failed"));
    }

    #[test]
    fn test_observers_inherit_and_report() {
        let reported = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let parent = Observers::new();
        let sink = reported.clone();
        parent.set_error_handler(Arc::new(move |error: &Error| {
            sink.lock().push(error.clone());
        }));

        let child = Observers::inherit(&parent);
        child.report(&Error::DuplicateResponse);

        assert_eq!(*reported.lock(), vec![Error::DuplicateResponse]);
    }
}
