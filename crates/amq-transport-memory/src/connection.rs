use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use proven_amq_transport::{
    Connection, ConnectionEvent, LinkError, ReceiverEvent, ReceiverHandle, ReceiverLink,
    ReceiverOptions, SenderEvent, SenderHandle, SenderLink, SenderOptions, TransportError,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::MemoryBroker;
use crate::link::{LinkState, MemoryReceiver, MemorySender};

const EVENT_CAPACITY: usize = 16;

/// State shared between a connection handle and its broker.
#[derive(Debug)]
pub struct ConnectionShared {
    broker: MemoryBroker,
    events: broadcast::Sender<ConnectionEvent>,
    id: Uuid,
    open: AtomicBool,
    receivers: Mutex<Vec<Arc<MemoryReceiver>>>,
    senders: Mutex<Vec<Arc<MemorySender>>>,
}

impl ConnectionShared {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close_links(&self) {
        for sender in self.senders.lock().drain(..) {
            sender.close();
        }
        for receiver in self.receivers.lock().drain(..) {
            receiver.close();
        }
    }

    /// Detaches every open sender on the address with the given error.
    pub fn fail_senders(&self, address: &str, error: &LinkError) {
        for sender in self.senders.lock().iter() {
            if sender.address != address || !sender.state.is_open() {
                continue;
            }

            debug!(address, link = sender.id, %error, "failing sender");
            sender.state.fail(error.clone());
            let _ = sender.events.send(SenderEvent::Error(error.clone()));
        }
    }

    /// Drops the connection as if the socket was lost.
    pub fn drop_with(&self, error: TransportError) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(connection = %self.id, %error, "memory connection dropped");
        self.close_links();
        let _ = self.events.send(ConnectionEvent::Disconnected {
            error: Some(error),
            reconnecting: false,
        });
    }
}

/// Memory connection implementation
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<ConnectionShared>,
}

impl MemoryConnection {
    pub fn open(broker: MemoryBroker) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(ConnectionShared {
            broker: broker.clone(),
            events,
            id: Uuid::new_v4(),
            open: AtomicBool::new(true),
            receivers: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        });
        broker.register(&shared);

        info!(connection = %shared.id, broker = %broker.name(), "memory connection established");

        Self { shared }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.shared.is_open() {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    fn open_sender(&self, options: SenderOptions) -> Result<SenderHandle, TransportError> {
        self.ensure_open()?;

        let broker = &self.shared.broker;
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Arc::new(MemorySender {
            address: options.address.clone(),
            broker: broker.clone(),
            events: tx.clone(),
            id: broker.next_link_id(),
            next_delivery: AtomicU64::new(0),
            state: LinkState::default(),
        });

        if broker.is_refused(&options.address) {
            debug!(address = %options.address, "sender attach refused");
            let error = LinkError::new(
                "amqp:unauthorized-access",
                format!("attach to '{}' refused", options.address),
            );
            sender.state.fail(error.clone());
            let _ = tx.send(SenderEvent::Error(error));
        } else {
            sender.state.attach();
            let _ = tx.send(SenderEvent::Sendable);
        }

        let mut senders = self.shared.senders.lock();
        senders.retain(|sender| !sender.state.is_closed());
        senders.push(sender.clone());
        drop(senders);

        Ok(SenderHandle {
            link: sender as Arc<dyn SenderLink>,
            events: rx,
        })
    }

    fn open_receiver(&self, options: ReceiverOptions) -> Result<ReceiverHandle, TransportError> {
        self.ensure_open()?;

        let broker = &self.shared.broker;
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(LinkState::default());
        let receiver = Arc::new(MemoryReceiver {
            address: options.address.clone(),
            broker: broker.clone(),
            events: tx.clone(),
            id: broker.next_link_id(),
            state: state.clone(),
        });

        if broker.is_refused(&options.address) {
            debug!(address = %options.address, "receiver attach refused");
            let error = LinkError::new(
                "amqp:unauthorized-access",
                format!("attach to '{}' refused", options.address),
            );
            state.fail(error.clone());
            let _ = tx.send(ReceiverEvent::Error(error));
        } else {
            state.attach();
            let _ = tx.send(ReceiverEvent::Opened);
            broker.attach(&options.address, receiver.id, options.selector, tx, state);
        }

        let mut receivers = self.shared.receivers.lock();
        receivers.retain(|receiver| !receiver.state.is_closed());
        receivers.push(receiver.clone());
        drop(receivers);

        Ok(ReceiverHandle {
            link: receiver,
            events: rx,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.shared.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        debug!(connection = %self.shared.id, "closing memory connection");
        self.shared.close_links();
        let _ = self.shared.events.send(ConnectionEvent::Disconnected {
            error: None,
            reconnecting: false,
        });

        Ok(())
    }
}
