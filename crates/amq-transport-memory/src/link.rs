use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use proven_amq_transport::{
    Delivery, LinkError, ReceiverEvent, ReceiverLink, SenderEvent, SenderLink, TransportMessage,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::MemoryBroker;

/// Attach state shared between a link and the broker.
#[derive(Debug, Default)]
pub struct LinkState {
    closed: AtomicBool,
    error: Mutex<Option<LinkError>>,
    open: AtomicBool,
}

impl LinkState {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn attach(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn fail(&self, error: LinkError) {
        self.open.store(false, Ordering::SeqCst);
        *self.error.lock() = Some(error);
    }

    pub fn error(&self) -> Option<LinkError> {
        self.error.lock().clone()
    }

    /// Marks the link closed; returns `false` if it already was.
    pub fn close(&self) -> bool {
        self.open.store(false, Ordering::SeqCst);
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// Sending side of a memory link.
#[derive(Debug)]
pub struct MemorySender {
    pub(crate) address: String,
    pub(crate) broker: MemoryBroker,
    pub(crate) events: mpsc::UnboundedSender<SenderEvent>,
    pub(crate) id: u64,
    pub(crate) next_delivery: AtomicU64,
    pub(crate) state: LinkState,
}

impl SenderLink for MemorySender {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn send(&self, message: TransportMessage) -> Option<Delivery> {
        if !self.state.is_open() || !self.broker.is_acknowledging(&self.address) {
            return None;
        }

        let delivery = Delivery {
            id: self.next_delivery.fetch_add(1, Ordering::SeqCst),
            data: message.body.clone().unwrap_or_default(),
        };
        self.broker.publish(&self.address, message);

        Some(delivery)
    }

    fn close(&self) {
        if self.state.close() {
            debug!(address = %self.address, link = self.id, "closing memory sender");
            let _ = self.events.send(SenderEvent::Closed);
        }
    }
}

/// Receiving side of a memory link.
#[derive(Debug)]
pub struct MemoryReceiver {
    pub(crate) address: String,
    pub(crate) broker: MemoryBroker,
    pub(crate) events: mpsc::UnboundedSender<ReceiverEvent>,
    pub(crate) id: u64,
    pub(crate) state: std::sync::Arc<LinkState>,
}

impl ReceiverLink for MemoryReceiver {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn error(&self) -> Option<LinkError> {
        self.state.error()
    }

    fn close(&self) {
        if self.state.close() {
            debug!(address = %self.address, link = self.id, "closing memory receiver");
            self.broker.detach(&self.address, self.id);
            let _ = self.events.send(ReceiverEvent::Closed);
        }
    }
}
