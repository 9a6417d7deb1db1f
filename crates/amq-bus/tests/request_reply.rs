use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proven_amq_bus::{
    AmqBusConfig, BackoutProducer, Connector, Consumer, ConsumerResult, ConsumerServer, Error,
    LogAdapter, Message, OperationStatus, Producer, ProducerClient, RequestConfig, RouteOptions,
};
use proven_amq_transport::{ConnectionOptions, TransportError};
use proven_amq_transport_memory::{MemoryBroker, MemoryTransport};

async fn connected(broker: &MemoryBroker) -> Connector {
    let _ = tracing_subscriber::fmt::try_init();

    let connector = Connector::new(
        MemoryTransport::with_broker("localhost", 5672, broker),
        ConnectionOptions::new("localhost", 5672),
    );
    connector.connect().await.unwrap();
    connector
}

async fn producer(connector: &Connector) -> Producer {
    let producer = Producer::new(connector);
    producer
        .open(RouteOptions::new("Q.IN").with_reply_to("Q.OUT"))
        .await
        .unwrap();
    producer
}

/// A consumer on `Q.IN` answering on `Q.OUT` with whatever `reply` builds.
async fn responder<F>(connector: &Connector, reply: F) -> Consumer
where
    F: Fn(&Message) -> RequestConfig + Send + Sync + 'static,
{
    let consumer = Consumer::new(connector);
    let reply = Arc::new(reply);
    consumer.set_handler(move |request: ConsumerResult| {
        let reply = reply.clone();
        async move {
            if let Some(message) = request.message.as_ref() {
                let sent = request.send_reply((*reply)(message));
                assert!(sent.is_success(), "reply failed: {sent:?}");
            }
        }
    });
    consumer
        .open(RouteOptions::new("Q.IN").with_reply_to("Q.OUT"))
        .await
        .unwrap();
    consumer
}

#[tokio::test]
async fn test_ping_pong() {
    let broker = MemoryBroker::new("ping-pong");
    let connector = connected(&broker).await;
    let _consumer = responder(&connector, |_| RequestConfig::new("pong")).await;
    let producer = producer(&connector).await;

    let produced = producer.send("ping");
    assert!(produced.is_success());
    let request_id = produced.message.as_ref().unwrap().message_id.clone();

    let reply = produced.receive_reply(Some(Duration::from_secs(5))).await;

    assert_eq!(reply.status, OperationStatus::Success);
    let message = reply.message.unwrap();
    assert_eq!(message.data.as_deref(), Some("pong"));
    assert_eq!(message.correlation_id, request_id);
    assert_eq!(producer.pending_requests(), 0);
}

#[tokio::test]
async fn test_reply_arriving_before_wait_is_kept() {
    let broker = MemoryBroker::new("early-reply");
    let connector = connected(&broker).await;
    let _consumer = responder(&connector, |_| RequestConfig::new("pong")).await;
    let producer = producer(&connector).await;

    let produced = producer.send("ping");
    assert!(produced.is_success());

    // The responder answers long before anyone waits.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reply = produced.receive_reply(Some(Duration::from_millis(500))).await;
    assert_eq!(reply.status, OperationStatus::Success);
    assert_eq!(reply.message.unwrap().data.as_deref(), Some("pong"));
    assert_eq!(producer.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reply_with_other_correlation_times_out() {
    let broker = MemoryBroker::new("mismatch");
    let connector = connected(&broker).await;
    let _consumer = responder(&connector, |_| {
        RequestConfig::new("pong").with_correlation_id("c2")
    })
    .await;
    let producer = producer(&connector).await;

    let start = tokio::time::Instant::now();
    let reply = producer
        .request_reply(
            RequestConfig::new("ping").with_correlation_id("c1"),
            Some(Duration::from_millis(200)),
        )
        .await;

    assert_eq!(reply.status, OperationStatus::TimedOut);
    assert_eq!(reply.cause, Some(Error::Timeout(200)));
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_millis(250));
    assert_eq!(producer.pending_requests(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_do_not_interfere() {
    let broker = MemoryBroker::new("concurrent");
    let connector = connected(&broker).await;
    let _consumer = responder(&connector, |request| {
        RequestConfig::new(format!("echo {}", request.data.as_deref().unwrap_or_default()))
    })
    .await;
    let producer = producer(&connector).await;

    let mut calls = Vec::new();
    for n in 0..10 {
        let producer = producer.clone();
        calls.push(tokio::spawn(async move {
            let reply = producer
                .request_reply(format!("request {n}"), Some(Duration::from_secs(5)))
                .await;
            (n, reply)
        }));
    }

    for call in calls {
        let (n, reply) = call.await.unwrap();
        assert_eq!(reply.status, OperationStatus::Success);
        assert_eq!(
            reply.message.unwrap().data,
            Some(format!("echo request {n}"))
        );
    }
    assert_eq!(producer.pending_requests(), 0);
}

#[tokio::test]
async fn test_clients_get_their_own_replies() {
    let broker = MemoryBroker::new("client-server");
    let connector = connected(&broker).await;
    let route = RouteOptions::new("Q.IN").with_reply_to("Q.OUT");

    let server = ConsumerServer::new(&connector, route.clone(), |request: Message| async move {
        Some(format!("echo {}", request.data.unwrap_or_default()))
    });
    server.start().unwrap();

    let client = Arc::new(ProducerClient::new(&connector, route));
    let mut calls = Vec::new();
    for n in 0..5 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let reply = client
                .request_reply(format!("request {n}"), Some(Duration::from_secs(5)))
                .await;
            (n, reply)
        }));
    }

    for call in calls {
        let (n, reply) = call.await.unwrap();
        assert_eq!(reply.status, OperationStatus::Success);
        assert_eq!(reply.message.unwrap().data, Some(format!("echo request {n}")));
    }

    server.stop().await;
    assert_eq!(broker.receiver_count("Q.IN"), 0);
    assert_eq!(broker.receiver_count("Q.OUT"), 0);
}

#[tokio::test]
async fn test_connect_while_connected() {
    let broker = MemoryBroker::new("reconnect");
    let connector = connected(&broker).await;
    assert_eq!(broker.connection_count(), 1);

    connector.connect().await.unwrap();

    assert!(connector.is_connected());
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test]
async fn test_open_and_close() {
    let broker = MemoryBroker::new("lifecycle");
    let connector = connected(&broker).await;

    let producer = producer(&connector).await;
    let consumer = Consumer::new(&connector);
    consumer
        .open(RouteOptions::new("Q.IN").with_reply_to("Q.OUT"))
        .await
        .unwrap();

    assert!(producer.is_open());
    assert!(consumer.is_open());
    assert_eq!(broker.receiver_count("Q.IN"), 1);
    assert_eq!(broker.receiver_count("Q.OUT"), 1);

    producer.close().await.unwrap();
    consumer.close().await.unwrap();

    assert!(!producer.is_open());
    assert!(!consumer.is_open());
    assert_eq!(broker.receiver_count("Q.IN"), 0);
    assert_eq!(broker.receiver_count("Q.OUT"), 0);
}

#[tokio::test]
async fn test_refused_link_fails_open() {
    let broker = MemoryBroker::new("refused");
    broker.refuse_address("Q.OUT");
    let connector = connected(&broker).await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    connector.set_error_handler(Arc::new(move |error: &Error| sink.lock().push(error.clone())));

    let producer = Producer::new(&connector);
    let result = producer
        .open(RouteOptions::new("Q.IN").with_reply_to("Q.OUT"))
        .await;

    assert!(matches!(
        result,
        Err(Error::Transport(TransportError::LinkRefused { ref address, .. })) if address == "Q.OUT"
    ));
    assert!(!producer.is_open());
    assert_eq!(errors.lock().len(), 1);

    let produced = producer.send("ping");
    assert_eq!(produced.status, OperationStatus::ConfigError);
}

#[tokio::test]
async fn test_dropped_connection_closes_links() {
    let broker = MemoryBroker::new("offline");
    let connector = connected(&broker).await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    connector.set_error_handler(Arc::new(move |error: &Error| sink.lock().push(error.clone())));

    let producer = producer(&connector).await;
    broker.set_online(false);

    tokio::time::timeout(Duration::from_secs(1), async {
        while !errors.lock().iter().any(|error| matches!(error, Error::Transport(_))) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(!connector.is_connected());
    assert!(!producer.is_open());
    let produced = producer.send("ping");
    assert_eq!(produced.status, OperationStatus::ConnectionError);
    assert_eq!(produced.cause, Some(Error::ConnectionNotDefined));
}

#[tokio::test]
async fn test_backout_reaches_original_requester() {
    let broker = MemoryBroker::new("backout");
    let connector = connected(&broker).await;

    // The regular consumer gives up on every request.
    let backout = BackoutProducer::new(&connector);
    backout.open(RouteOptions::new("Q.DLQ")).await.unwrap();
    let consumer = Consumer::new(&connector);
    let forward = backout.clone();
    consumer.set_handler(move |request: ConsumerResult| {
        let forward = forward.clone();
        async move {
            let moved = forward.backout(&request);
            assert!(moved.is_success(), "backout failed: {moved:?}");
        }
    });
    consumer
        .open(RouteOptions::new("Q.IN").with_reply_to("Q.OUT"))
        .await
        .unwrap();

    // Whoever drains the dead-letter queue answers the original requester.
    let dead_letters = Consumer::new(&connector);
    dead_letters.set_handler(|request: ConsumerResult| async move {
        let sent = request.send_reply("handled late");
        assert!(sent.is_success(), "reply failed: {sent:?}");
    });
    dead_letters
        .open(RouteOptions::new("Q.DLQ").with_reply_to("Q.OUT"))
        .await
        .unwrap();

    let producer = producer(&connector).await;
    let reply = producer
        .request_reply(
            RequestConfig::new("poison").with_correlation_id("c1"),
            Some(Duration::from_secs(5)),
        )
        .await;

    assert_eq!(reply.status, OperationStatus::Success);
    let message = reply.message.unwrap();
    assert_eq!(message.data.as_deref(), Some("handled late"));
    assert_eq!(message.correlation_id.as_deref(), Some("c1"));
}

#[derive(Debug, Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl LogAdapter for Recorder {
    fn on_producer_open(&self, route: &RouteOptions) {
        self.events
            .lock()
            .push(format!("producer open {}", route.address.as_deref().unwrap_or_default()));
    }

    fn on_producer_request(&self, _route: &RouteOptions, message: &Message) {
        self.events
            .lock()
            .push(format!("request {}", message.data.as_deref().unwrap_or_default()));
    }

    fn on_producer_response(&self, _route: &RouteOptions, message: &Message) {
        self.events
            .lock()
            .push(format!("response {}", message.data.as_deref().unwrap_or_default()));
    }
}

#[tokio::test]
async fn test_log_adapter_sees_request_and_response() {
    let broker = MemoryBroker::new("logging");
    let connector = connected(&broker).await;
    let _consumer = responder(&connector, |_| RequestConfig::new("pong")).await;

    let recorder = Arc::new(Recorder::default());
    let producer = Producer::new(&connector);
    producer.set_log_adapter(recorder.clone());
    producer
        .open(RouteOptions::new("Q.IN").with_reply_to("Q.OUT"))
        .await
        .unwrap();

    let reply = producer.request_reply("ping", Some(Duration::from_secs(5))).await;
    assert!(reply.is_success());

    assert_eq!(
        *recorder.events.lock(),
        vec![
            "producer open Q.IN".to_string(),
            "request ping".to_string(),
            "response pong".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_routes_from_config() {
    let config: AmqBusConfig = serde_json::from_value(serde_json::json!({
        "connector": { "host": "localhost", "port": "5672" },
        "consumer": { "address": "Q.ORDERS", "replyTo": "Q.ORDERS.REPLY" },
        "producer": [
            { "name": "audit", "address": "Q.AUDIT" },
            { "name": "orders", "address": "Q.ORDERS", "replyTo": "Q.ORDERS.REPLY", "timeout": "5000" }
        ]
    }))
    .unwrap();

    let broker = MemoryBroker::new("config");
    let connector = Connector::from_config(
        MemoryTransport::with_broker("localhost", 5672, &broker),
        &config.connector,
    )
    .unwrap();
    connector.connect().await.unwrap();

    let consumer = Consumer::new(&connector);
    consumer.set_handler(|request: ConsumerResult| async move {
        let _ = request.send_reply("accepted");
    });
    consumer.open(config.consumer.clone().unwrap()).await.unwrap();

    let producer = Producer::new(&connector);
    producer
        .open(config.producer_route(Some("orders")).unwrap().clone())
        .await
        .unwrap();

    let reply = producer.request_reply("order", Some(Duration::from_secs(5))).await;
    assert_eq!(reply.message.unwrap().data.as_deref(), Some("accepted"));

    assert!(matches!(
        config.producer_route(Some("billing")),
        Err(Error::RouteNotFound(_))
    ));
}
