use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use proven_amq_transport::{LinkError, ReceiverEvent, Selector, TransportError, TransportMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::connection::ConnectionShared;
use crate::link::LinkState;

/// A receiver attached to a queue.
#[derive(Debug)]
struct Subscriber {
    id: u64,
    selector: Option<Selector>,
    events: mpsc::UnboundedSender<ReceiverEvent>,
    state: Arc<LinkState>,
}

impl Subscriber {
    fn accepts(&self, message: &TransportMessage) -> bool {
        self.state.is_open()
            && self
                .selector
                .as_ref()
                .is_none_or(|selector| selector.matches(message))
    }
}

/// Messages waiting for a receiver plus the receivers attached to one address.
#[derive(Debug, Default)]
struct Queue {
    cursor: usize,
    pending: VecDeque<TransportMessage>,
    subscribers: Vec<Subscriber>,
}

impl Queue {
    /// Hands the message to the next matching subscriber, round-robin.
    ///
    /// Gives the message back if nobody takes it.
    fn dispatch(&mut self, mut message: TransportMessage) -> Option<TransportMessage> {
        let mut tried = 0;
        while tried < self.subscribers.len() {
            let index = self.cursor % self.subscribers.len();
            self.cursor = self.cursor.wrapping_add(1);
            tried += 1;

            if !self.subscribers[index].accepts(&message) {
                continue;
            }

            match self.subscribers[index]
                .events
                .send(ReceiverEvent::Message(message))
            {
                Ok(()) => return None,
                Err(mpsc::error::SendError(event)) => {
                    // Event stream dropped: the receiver is gone.
                    self.subscribers.remove(index);
                    tried = 0;
                    let ReceiverEvent::Message(returned) = event else {
                        unreachable!("only messages are dispatched");
                    };
                    message = returned;
                }
            }
        }

        Some(message)
    }
}

#[derive(Debug)]
struct BrokerInner {
    connections: Mutex<Vec<Weak<ConnectionShared>>>,
    credentials: Mutex<Option<(String, String)>>,
    name: String,
    next_link_id: AtomicU64,
    online: AtomicBool,
    queues: Mutex<HashMap<String, Queue>>,
    refused: Mutex<HashSet<String>>,
    unacknowledged: Mutex<HashSet<String>>,
}

/// An in-process message broker with queue semantics.
///
/// Messages sent to an address are handed to one attached receiver whose
/// selector matches, rotating between receivers. Messages nobody can take are
/// buffered until a matching receiver attaches.
///
/// The broker also exposes fault injection hooks used to exercise error paths.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Creates an online broker with no queues.
    pub fn new<N>(name: N) -> Self
    where
        N: Into<String>,
    {
        Self {
            inner: Arc::new(BrokerInner {
                connections: Mutex::new(Vec::new()),
                credentials: Mutex::new(None),
                name: name.into(),
                next_link_id: AtomicU64::new(1),
                online: AtomicBool::new(true),
                queues: Mutex::new(HashMap::new()),
                refused: Mutex::new(HashSet::new()),
                unacknowledged: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Name of the broker.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the broker accepts connections.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Takes the broker on- or offline.
    ///
    /// Going offline drops every live connection with an error.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if !was_online || online {
            return;
        }

        info!(broker = %self.inner.name, "memory broker going offline");

        let connections: Vec<_> = self
            .inner
            .connections
            .lock()
            .drain(..)
            .filter_map(|connection| connection.upgrade())
            .collect();

        for connection in connections {
            connection.drop_with(TransportError::ConnectionFailed(format!(
                "broker {} went offline",
                self.inner.name
            )));
        }
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        let mut connections = self.inner.connections.lock();
        connections.retain(|connection| {
            connection
                .upgrade()
                .is_some_and(|connection| connection.is_open())
        });
        connections.len()
    }

    /// Requires SASL PLAIN credentials on connect.
    pub fn require_credentials<U, P>(&self, username: U, password: P)
    where
        U: Into<String>,
        P: Into<String>,
    {
        *self.inner.credentials.lock() = Some((username.into(), password.into()));
    }

    /// Makes the broker refuse links attached to the address.
    pub fn refuse_address<A>(&self, address: A)
    where
        A: Into<String>,
    {
        self.inner.refused.lock().insert(address.into());
    }

    /// Makes the broker accept links attached to the address again.
    pub fn accept_address(&self, address: &str) {
        self.inner.refused.lock().remove(address);
    }

    /// Controls whether deliveries to the address are acknowledged.
    pub fn set_acknowledging<A>(&self, address: A, acknowledging: bool)
    where
        A: Into<String>,
    {
        let address = address.into();
        let mut unacknowledged = self.inner.unacknowledged.lock();
        if acknowledging {
            unacknowledged.remove(&address);
        } else {
            unacknowledged.insert(address);
        }
    }

    /// Detaches every receiver on the address with the given error.
    pub fn fail_receivers(&self, address: &str, error: &LinkError) {
        let subscribers = self
            .inner
            .queues
            .lock()
            .get_mut(address)
            .map(|queue| std::mem::take(&mut queue.subscribers))
            .unwrap_or_default();

        for subscriber in subscribers {
            debug!(address, link = subscriber.id, %error, "failing receiver");
            subscriber.state.fail(error.clone());
            let _ = subscriber.events.send(ReceiverEvent::Error(error.clone()));
        }
    }

    /// Detaches every sender on the address with the given error.
    pub fn fail_senders(&self, address: &str, error: &LinkError) {
        let connections: Vec<_> = self
            .inner
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for connection in connections {
            connection.fail_senders(address, error);
        }
    }

    /// Publishes a message to the address.
    pub fn publish(&self, address: &str, message: TransportMessage) {
        let mut queues = self.inner.queues.lock();
        let queue = queues.entry(address.to_string()).or_default();

        if let Some(message) = queue.dispatch(message) {
            trace!(address, "no receiver, message queued");
            queue.pending.push_back(message);
        }
    }

    /// Number of messages waiting on the address.
    #[must_use]
    pub fn queue_depth(&self, address: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(address)
            .map_or(0, |queue| queue.pending.len())
    }

    /// Number of receivers attached to the address.
    #[must_use]
    pub fn receiver_count(&self, address: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(address)
            .map_or(0, |queue| {
                queue
                    .subscribers
                    .iter()
                    .filter(|subscriber| subscriber.state.is_open())
                    .count()
            })
    }

    pub(crate) fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), TransportError> {
        match &*self.inner.credentials.lock() {
            Some((expected_user, expected_password))
                if username != Some(expected_user.as_str())
                    || password != Some(expected_password.as_str()) =>
            {
                Err(TransportError::Authentication(format!(
                    "invalid credentials for user '{}'",
                    username.unwrap_or_default()
                )))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn is_refused(&self, address: &str) -> bool {
        self.inner.refused.lock().contains(address)
    }

    pub(crate) fn is_acknowledging(&self, address: &str) -> bool {
        !self.inner.unacknowledged.lock().contains(address)
    }

    pub(crate) fn next_link_id(&self) -> u64 {
        self.inner.next_link_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register(&self, connection: &Arc<ConnectionShared>) {
        self.inner.connections.lock().push(Arc::downgrade(connection));
    }

    /// Attaches a receiver and drains matching pending messages to it.
    pub(crate) fn attach(
        &self,
        address: &str,
        id: u64,
        selector: Option<Selector>,
        events: mpsc::UnboundedSender<ReceiverEvent>,
        state: Arc<LinkState>,
    ) {
        let mut queues = self.inner.queues.lock();
        let queue = queues.entry(address.to_string()).or_default();

        let subscriber = Subscriber {
            id,
            selector,
            events,
            state,
        };

        let mut kept = VecDeque::with_capacity(queue.pending.len());
        while let Some(message) = queue.pending.pop_front() {
            if subscriber.accepts(&message) {
                if let Err(mpsc::error::SendError(ReceiverEvent::Message(message))) =
                    subscriber.events.send(ReceiverEvent::Message(message))
                {
                    kept.push_back(message);
                }
            } else {
                kept.push_back(message);
            }
        }
        queue.pending = kept;
        queue.subscribers.push(subscriber);
    }

    pub(crate) fn detach(&self, address: &str, id: u64) {
        if let Some(queue) = self.inner.queues.lock().get_mut(address) {
            queue.subscribers.retain(|subscriber| subscriber.id != id);
        }
    }
}
