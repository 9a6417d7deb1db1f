//! Request/reply with a link per request.
//!
//! A [`ClientRequest`] sends its request over a sender opened just for it,
//! without a correlation id, so it reaches a
//! [`ConsumerServer`](crate::ConsumerServer). The reply is read from a
//! receiver opened on the reply address with the selector
//! `correlationId = '<request message id>'`, so the broker hands each request
//! exactly its own reply and no pending table is needed.

use std::sync::Arc;
use std::time::Duration;

use proven_amq_transport::{ReceiverOptions, Selector};
use tracing::debug;
use uuid::Uuid;

use crate::config::RouteOptions;
use crate::connector::Connector;
use crate::error::Error;
use crate::log_adapter::{LogAdapter, Observers};
use crate::message::{Message, RequestConfig};
use crate::producer::REPLY_TIMEOUT;
use crate::result::{OperationResult, OperationStatus};
use crate::transient::{receive_once, send_once};

/// Creates [`ClientRequest`]s for one route.
///
/// Requests go to the route's `address`, replies are read from its
/// `reply_to`.
pub struct ProducerClient {
    connector: Connector,
    observers: Observers,
    route: RouteOptions,
}

impl ProducerClient {
    /// Creates a client using the connector's log adapter.
    #[must_use]
    pub fn new(connector: &Connector, route: RouteOptions) -> Self {
        Self {
            connector: connector.clone(),
            observers: Observers::inherit(connector.observers()),
            route,
        }
    }

    /// Sets the log adapter.
    pub fn set_log_adapter(&self, log_adapter: Arc<dyn LogAdapter>) {
        self.observers.set_log_adapter(log_adapter);
    }

    /// The route requests use.
    #[must_use]
    pub const fn route(&self) -> &RouteOptions {
        &self.route
    }

    /// A fresh, unsent request.
    #[must_use]
    pub fn create_request(&self) -> ClientRequest {
        ClientRequest {
            connector: self.connector.clone(),
            log_adapter: self.observers.log_adapter(),
            route: self.route.clone(),
            sent: None,
            timeout: None,
        }
    }

    /// Sends a message without waiting for anything back.
    ///
    /// A correlation id set on the request is kept, so notifications can
    /// answer somebody else's request.
    pub async fn notify<R>(&self, request: R) -> OperationResult
    where
        R: Into<RequestConfig>,
    {
        self.create_request().send(request).await
    }

    /// Sends a request and waits for its reply.
    ///
    /// Does not wait if sending failed.
    pub async fn request_reply<R>(&self, request: R, timeout: Option<Duration>) -> OperationResult
    where
        R: Into<RequestConfig>,
    {
        let mut request_handle = self.create_request();
        let sent = request_handle.send(request).await;
        if !sent.is_success() {
            return sent;
        }

        request_handle.receive_reply(timeout).await
    }
}

/// One request sent over its own link.
///
/// A request can be sent once. Its reply can be awaited as often as needed;
/// every wait opens its own receiver.
pub struct ClientRequest {
    connector: Connector,
    log_adapter: Arc<dyn LogAdapter>,
    route: RouteOptions,
    sent: Option<Message>,
    timeout: Option<Duration>,
}

impl ClientRequest {
    /// The request as sent, once sent.
    #[must_use]
    pub const fn sent(&self) -> Option<&Message> {
        self.sent.as_ref()
    }

    /// Sends the request.
    ///
    /// The message id defaults to a fresh id; the correlation id is only set
    /// if the request carries one. The reply address is stamped from the
    /// route. Fails with [`Error::RequestAlreadySent`] on the second call.
    pub async fn send<R>(&mut self, request: R) -> OperationResult
    where
        R: Into<RequestConfig>,
    {
        let address = self.route.address.clone().filter(|address| !address.is_empty());

        if self.sent.is_some() {
            return OperationResult::failure(
                OperationStatus::ConfigError,
                address,
                Error::RequestAlreadySent,
            );
        }
        let Some(address) = address else {
            return OperationResult::failure(
                OperationStatus::ConfigError,
                None,
                Error::AddressUndefined,
            );
        };

        let mut config = request.into();
        if config.message_id.is_none() {
            config.message_id = Some(Uuid::new_v4().to_string());
        }
        let transport_message = config.to_transport(self.route.reply_to.as_deref());
        let message = Message::from(&transport_message);

        let delivered = send_once(
            &self.connector,
            &address,
            transport_message,
            self.route.open_timeout(),
        )
        .await;

        let result = match delivered {
            Ok(Some(_)) => OperationResult::success(Some(address)),
            Ok(None) => OperationResult::failure(
                OperationStatus::OperationError,
                Some(address),
                Error::DeliveryFailed,
            ),
            Err((status, error)) => OperationResult::failure(status, Some(address), error),
        };

        match &result.cause {
            None => {
                self.log_adapter.on_client_request(&self.route, &message);
                self.timeout = config.timeout;
                self.sent = Some(message.clone());
            }
            Some(error) => self.log_adapter.on_error("AMQ client request not sent", error),
        }
        result.with_message(message)
    }

    /// Waits for the reply to the sent request.
    ///
    /// Without a timeout the request's own timeout applies, falling back to
    /// [`REPLY_TIMEOUT`].
    pub async fn receive_reply(&self, timeout: Option<Duration>) -> OperationResult {
        let address = self
            .route
            .reply_to
            .clone()
            .filter(|address| !address.is_empty());

        let Some(message_id) = self.sent.as_ref().and_then(|sent| sent.message_id.clone()) else {
            return OperationResult::failure(OperationStatus::ConfigError, address, Error::NoRequest);
        };
        let Some(address) = address else {
            return OperationResult::failure(
                OperationStatus::ConfigError,
                None,
                Error::ReplyToUndefined,
            );
        };

        let timeout = timeout.or(self.timeout).unwrap_or(REPLY_TIMEOUT);
        let options = ReceiverOptions {
            address: address.clone(),
            selector: Some(Selector::CorrelationId(message_id.clone())),
            timeout: Some(self.route.open_timeout()),
        };

        match receive_once(&self.connector, options, timeout).await {
            Ok(reply) => {
                let reply = Message::from(&reply);
                self.log_adapter.on_client_response(&self.route, &reply);
                OperationResult::success(Some(address)).with_message(reply)
            }
            Err((status, error)) => {
                debug!(%message_id, %status, %error, "no client reply");
                OperationResult::failure(status, Some(address), error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proven_amq_transport::{ConnectionOptions, LinkError, TransportMessage};
    use proven_amq_transport_memory::{MemoryBroker, MemoryTransport};

    async fn setup() -> (ProducerClient, MemoryBroker) {
        let broker = MemoryBroker::new("client");
        let connector = Connector::new(
            MemoryTransport::with_broker("localhost", 5672, &broker),
            ConnectionOptions::new("localhost", 5672),
        );
        connector.connect().await.unwrap();

        let client =
            ProducerClient::new(&connector, RouteOptions::new("Q.REQ").with_reply_to("Q.RES"));
        (client, broker)
    }

    fn reply_to(broker: &MemoryBroker, correlation_id: &str, body: &str) {
        let mut message = TransportMessage::with_body(body.to_string());
        message.correlation_id = Some(correlation_id.to_string());
        broker.publish("Q.RES", message);
    }

    #[tokio::test]
    async fn test_notify_leaves_correlation_unset() {
        let (client, broker) = setup().await;

        let sent = client.notify("hello").await;

        assert_eq!(sent.status, OperationStatus::Success);
        assert_eq!(sent.address.as_deref(), Some("Q.REQ"));
        let message = sent.message.unwrap();
        assert!(message.message_id.is_some());
        assert_eq!(message.correlation_id, None);
        assert_eq!(message.reply_to.as_deref(), Some("Q.RES"));
        assert_eq!(broker.queue_depth("Q.REQ"), 1);

        let sent = client
            .notify(RequestConfig::new("answer").with_correlation_id("c1"))
            .await;
        assert_eq!(
            sent.message.unwrap().correlation_id.as_deref(),
            Some("c1")
        );
    }

    #[tokio::test]
    async fn test_request_is_sent_once() {
        let (client, _broker) = setup().await;
        let mut request = client.create_request();

        assert!(request.send("first").await.is_success());
        let again = request.send("second").await;

        assert_eq!(again.status, OperationStatus::ConfigError);
        assert_eq!(again.cause, Some(Error::RequestAlreadySent));
        assert_eq!(
            request.sent().and_then(|sent| sent.data.as_deref()),
            Some("first")
        );
    }

    #[tokio::test]
    async fn test_reply_is_selected_by_message_id() {
        let (client, broker) = setup().await;
        let mut request = client.create_request();
        request.send(RequestConfig::new("ping").with_message_id("m1")).await;

        reply_to(&broker, "someone-else", "not yours");
        reply_to(&broker, "m1", "pong");

        let reply = request.receive_reply(Some(Duration::from_secs(1))).await;

        assert_eq!(reply.status, OperationStatus::Success);
        assert_eq!(reply.address.as_deref(), Some("Q.RES"));
        assert_eq!(reply.message.unwrap().data.as_deref(), Some("pong"));
        // The other reply stays for whoever asked for it.
        assert_eq!(broker.queue_depth("Q.RES"), 1);
        assert_eq!(broker.receiver_count("Q.RES"), 0);
    }

    #[tokio::test]
    async fn test_reply_without_request() {
        let (client, _broker) = setup().await;

        let reply = client.create_request().receive_reply(None).await;

        assert_eq!(reply.status, OperationStatus::ConfigError);
        assert_eq!(reply.cause, Some(Error::NoRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_timeout() {
        let (client, broker) = setup().await;

        let reply = client
            .request_reply(
                RequestConfig::new("ping").with_timeout(Duration::from_millis(100)),
                None,
            )
            .await;

        assert_eq!(reply.status, OperationStatus::TimedOut);
        assert_eq!(reply.cause, Some(Error::Timeout(100)));
        assert_eq!(broker.receiver_count("Q.RES"), 0);
    }

    #[tokio::test]
    async fn test_failed_reply_link() {
        let (client, broker) = setup().await;
        let mut request = client.create_request();
        request.send("ping").await;

        let error = LinkError::new("amqp:internal-error", "queue deleted");
        let (reply, ()) = tokio::join!(request.receive_reply(Some(Duration::from_secs(5))), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            broker.fail_receivers("Q.RES", &error);
        });

        assert_eq!(reply.status, OperationStatus::ReceiverError);
        assert_eq!(reply.cause, Some(Error::Receiver(error)));
    }

    #[tokio::test]
    async fn test_send_errors() {
        let (client, broker) = setup().await;

        broker.refuse_address("Q.REQ");
        let refused = client.notify("ping").await;
        assert_eq!(refused.status, OperationStatus::SenderError);
        assert!(matches!(refused.cause, Some(Error::Sender(_))));

        broker.accept_address("Q.REQ");
        broker.set_acknowledging("Q.REQ", false);
        let lost = client.notify("ping").await;
        assert_eq!(lost.status, OperationStatus::OperationError);
        assert_eq!(lost.cause, Some(Error::DeliveryFailed));

        client.connector.disconnect().await;
        let offline = client.request_reply("ping", None).await;
        assert_eq!(offline.status, OperationStatus::ConnectionError);
        assert_eq!(offline.cause, Some(Error::ConnectionNotDefined));
    }

    #[tokio::test]
    async fn test_route_without_address() {
        let (client, _broker) = setup().await;
        let client = ProducerClient::new(&client.connector, RouteOptions::default());

        let sent = client.notify("ping").await;

        assert_eq!(sent.status, OperationStatus::ConfigError);
        assert_eq!(sent.cause, Some(Error::AddressUndefined));
    }
}
