//! Integration tests for memory transport

use std::time::Duration;

use bytes::Bytes;
use proven_amq_transport::{
    ConnectionEvent, ConnectionOptions, LinkError, ReceiverEvent, SenderEvent, Transport,
    TransportMessage,
};
use proven_amq_transport_memory::{MemoryBroker, MemoryTransport};
use tokio::time::timeout;
use tracing::info;

async fn next_message(events: &mut proven_amq_transport::ReceiverEvents) -> TransportMessage {
    loop {
        match timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("Timeout")
            .expect("Link event stream closed")
        {
            ReceiverEvent::Message(message) => return message,
            ReceiverEvent::Opened => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_memory_echo_responder() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new("echo");
    let transport = MemoryTransport::with_broker("localhost", 5672, &broker);
    let options = ConnectionOptions::new("localhost", 5672);

    // Server side: consume requests and echo them to their reply address.
    let server = transport.connect(&options).await.expect("Failed to connect");
    let mut requests = server
        .open_receiver("ECHO.IN".into())
        .expect("Failed to open receiver");
    let replies = server
        .open_sender("ECHO.OUT".into())
        .expect("Failed to open sender");

    let server_task = tokio::spawn(async move {
        while let Some(event) = requests.events.recv().await {
            match event {
                ReceiverEvent::Message(message) => {
                    info!("Server echoing {:?}", message.body);
                    let reply = TransportMessage {
                        correlation_id: message.message_id.clone(),
                        ..TransportMessage::with_body(message.body.unwrap_or_default())
                    };
                    replies.link.send(reply);
                }
                ReceiverEvent::Closed => break,
                _ => {}
            }
        }
    });

    // Client side.
    let client = transport.connect(&options).await.expect("Failed to connect");
    let mut sender = client
        .open_sender("ECHO.IN".into())
        .expect("Failed to open sender");
    let mut receiver = client
        .open_receiver("ECHO.OUT".into())
        .expect("Failed to open receiver");
    assert_eq!(sender.events.recv().await, Some(SenderEvent::Sendable));

    for (index, body) in ["Hello, Memory!", "Test message 2", "🦀 Rust is awesome!"]
        .into_iter()
        .enumerate()
    {
        let request = TransportMessage {
            message_id: Some(format!("id-{index}")),
            reply_to: Some("ECHO.OUT".to_string()),
            ..TransportMessage::with_body(body)
        };
        sender.link.send(request).expect("Delivery not accepted");

        let reply = next_message(&mut receiver.events).await;
        assert_eq!(reply.body, Some(Bytes::from(body)));
        assert_eq!(reply.correlation_id, Some(format!("id-{index}")));
    }

    assert_eq!(broker.connection_count(), 2);

    client.close().await.expect("Failed to close client");
    server.close().await.expect("Failed to close server");
    server_task.await.expect("Server task panicked");
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_competing_receivers_round_robin() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new("fanout");
    let transport = MemoryTransport::with_broker("localhost", 5672, &broker);
    let connection = transport
        .connect(&ConnectionOptions::new("localhost", 5672))
        .await
        .expect("Failed to connect");

    let mut first = connection.open_receiver("WORK".into()).unwrap();
    let mut second = connection.open_receiver("WORK".into()).unwrap();
    assert_eq!(broker.receiver_count("WORK"), 2);

    for body in ["a", "b", "c", "d"] {
        broker.publish("WORK", TransportMessage::with_body(body));
    }

    let mut first_bodies = vec![];
    let mut second_bodies = vec![];
    for _ in 0..2 {
        first_bodies.push(next_message(&mut first.events).await.body.unwrap());
        second_bodies.push(next_message(&mut second.events).await.body.unwrap());
    }

    assert_eq!(first_bodies, vec![Bytes::from("a"), Bytes::from("c")]);
    assert_eq!(second_bodies, vec![Bytes::from("b"), Bytes::from("d")]);
}

#[tokio::test]
async fn test_failed_receiver_reports_error() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new("faulty");
    let transport = MemoryTransport::with_broker("localhost", 5672, &broker);
    let connection = transport
        .connect(&ConnectionOptions::new("localhost", 5672))
        .await
        .expect("Failed to connect");

    let mut receiver = connection.open_receiver("FRAGILE".into()).unwrap();
    assert_eq!(receiver.events.recv().await, Some(ReceiverEvent::Opened));

    let error = LinkError::new("amqp:internal-error", "queue deleted");
    broker.fail_receivers("FRAGILE", &error);

    assert_eq!(
        receiver.events.recv().await,
        Some(ReceiverEvent::Error(error.clone()))
    );
    assert!(!receiver.link.is_open());
    assert_eq!(receiver.link.error(), Some(error));
    assert_eq!(broker.receiver_count("FRAGILE"), 0);

    receiver.link.close();
    assert_eq!(receiver.events.recv().await, Some(ReceiverEvent::Closed));
}

#[tokio::test]
async fn test_connection_closed() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new("closing");
    let transport = MemoryTransport::with_broker("localhost", 5672, &broker);
    let connection = transport
        .connect(&ConnectionOptions::new("localhost", 5672))
        .await
        .expect("Failed to connect");
    let mut connection_events = connection.events();

    let mut sender = connection.open_sender("Q".into()).unwrap();
    assert_eq!(sender.events.recv().await, Some(SenderEvent::Sendable));

    connection.close().await.expect("Failed to close");

    assert_eq!(sender.events.recv().await, Some(SenderEvent::Closed));
    assert!(sender.link.send(TransportMessage::with_body("late")).is_none());
    assert!(connection.open_receiver("Q".into()).is_err());
    assert_eq!(
        connection_events.recv().await.expect("No event"),
        ConnectionEvent::Disconnected {
            error: None,
            reconnecting: false
        }
    );

    // Closing twice is a no-op.
    connection.close().await.expect("Failed to close twice");
}
