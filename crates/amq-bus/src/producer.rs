use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proven_amq_transport::{LinkError, TransportMessage};
use tracing::{debug, warn};

use crate::awaiter::wait_for;
use crate::config::RouteOptions;
use crate::connector::Connector;
use crate::corresponder::{Corresponder, LinkHandler, Role};
use crate::error::{Error, ErrorHandler, Result};
use crate::log_adapter::{LogAdapter, Observers};
use crate::message::{Message, RequestConfig};
use crate::result::{OperationResult, OperationStatus};

/// Reply timeout used when neither the call nor the request sets one.
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Poll interval while waiting for a reply.
pub const REPLY_CHECK_INTERVAL: Duration = Duration::from_millis(3);

/// Awaited replies keyed by correlation id; `None` until the reply arrives.
type PendingTable = Mutex<HashMap<String, Option<Message>>>;

/// A registered pending request. Removes its entry when dropped.
struct PendingEntry {
    correlation_id: String,
    inner: Arc<ProducerInner>,
}

impl PendingEntry {
    fn register(inner: &Arc<ProducerInner>, correlation_id: &str) -> Result<Self> {
        let mut table = inner.pending.lock();
        if table.contains_key(correlation_id) {
            return Err(Error::DuplicateRequest);
        }
        table.insert(correlation_id.to_string(), None);
        drop(table);

        Ok(Self {
            correlation_id: correlation_id.to_string(),
            inner: inner.clone(),
        })
    }

    fn reply(&self) -> Option<Message> {
        self.inner
            .pending
            .lock()
            .get(&self.correlation_id)
            .cloned()
            .flatten()
    }
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.correlation_id);
    }
}

/// How a reply wait ended before the deadline.
type ReplyOutcome = std::result::Result<Message, (OperationStatus, Error)>;

struct ProducerInner {
    corresponder: Corresponder,
    observers: Observers,
    pending: PendingTable,
}

impl ProducerInner {
    /// Resolves a wait once the reply arrived or can no longer arrive.
    fn reply_outcome(&self, entry: &PendingEntry) -> Option<ReplyOutcome> {
        if let Some(message) = entry.reply() {
            return Some(Ok(message));
        }
        if let Some(error) = self.corresponder.receiver_failure() {
            return Some(Err((OperationStatus::ReceiverError, Error::Receiver(error))));
        }
        if !self.corresponder.connector().is_connected() {
            return Some(Err((
                OperationStatus::ConnectionError,
                Error::ConnectionNotDefined,
            )));
        }
        None
    }

    /// Hands a reply to the request waiting for it.
    fn correlate(&self, message: Message) -> Result<()> {
        let correlation_id = message
            .correlation_id
            .clone()
            .ok_or(Error::CorrelationUndefined)?;

        let mut pending = self.pending.lock();
        match pending.get_mut(&correlation_id) {
            None => Err(Error::CorrelationNotFound(correlation_id)),
            Some(Some(_)) => Err(Error::DuplicateResponse),
            Some(slot) => {
                *slot = Some(message);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl LinkHandler for ProducerInner {
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

        if let Err(error) = self.correlate(message) {
            warn!(address, %error, "dropping uncorrelated reply");
            log_adapter.on_error("Reply dropped", &error);
        }
    }

    async fn receiver_error(&self, address: &str, error: LinkError) {
        self.observers.log_adapter().on_receiver_error(address, &error);
    }
}

/// Sends requests and awaits their correlated replies.
///
/// Requests go to the route's `address`; replies are expected on its
/// `reply_to`, matched to the waiting request by correlation id. Cloning is
/// cheap; clones share links and pending requests.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    /// Creates a closed producer using the connector's error handler and log
    /// adapter.
    #[must_use]
    pub fn new(connector: &Connector) -> Self {
        let observers = Observers::inherit(connector.observers());
        let inner = Arc::new_cyclic(|this: &Weak<ProducerInner>| {
            let handler: Weak<dyn LinkHandler> = this.clone();
            ProducerInner {
                corresponder: Corresponder::new(connector.clone(), Role::Producer, handler),
                observers,
                pending: Mutex::new(HashMap::new()),
            }
        });

        Self { inner }
    }

    /// Sets the handler receiving link failures.
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

    pub(crate) fn log_adapter(&self) -> Arc<dyn LogAdapter> {
        self.inner.observers.log_adapter()
    }

    /// Address requests are sent to.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.inner.corresponder.sender_address()
    }

    /// Address replies are expected on.
    #[must_use]
    pub fn reply_to(&self) -> Option<String> {
        self.inner.corresponder.receiver_address()
    }

    /// Whether the sending link is attached.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.corresponder.is_open()
    }

    /// Number of requests currently awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Opens the links for the route.
    ///
    /// # Errors
    ///
    /// Returns an error if the links cannot be opened.
    pub async fn open(&self, route: RouteOptions) -> Result<()> {
        self.inner.corresponder.open(route.clone()).await?;
        if self.is_open() {
            self.inner.observers.log_adapter().on_producer_open(&route);
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

    /// Sends a request.
    ///
    /// Missing ids are generated and the reply address is stamped on the
    /// message. The result offers [`ProducerResult::receive_reply`], which
    /// repeats the send failure if there was one.
    ///
    /// The pending entry for the reply is reserved before the request leaves,
    /// so a reply arriving before `receive_reply` is called is kept. The
    /// reservation is released when the result is dropped.
    pub fn send<R>(&self, request: R) -> ProducerResult
    where
        R: Into<RequestConfig>,
    {
        let config = request.into().with_ids();
        let address = self.address();

        let Some(sender) = self.inner.corresponder.sender() else {
            let (status, error) = self.inner.corresponder.sender_unavailable();
            return ProducerResult {
                result: OperationResult::failure(status, address, error),
                reply: self.reply_plan(None),
            };
        };

        let transport_message = config.to_transport(self.reply_to().as_deref());
        let message = Message::from(&transport_message);
        let reply = self.reply_plan(Some(&config));

        if sender.send(transport_message).is_none() {
            drop(reply);
            let result = OperationResult::failure(
                OperationStatus::OperationError,
                address,
                Error::DeliveryFailed,
            )
            .with_message(message);
            return ProducerResult {
                reply: ReplyPlan::Unavailable(result.clone()),
                result,
            };
        }

        let route = self.inner.corresponder.route().unwrap_or_default();
        self.inner
            .observers
            .log_adapter()
            .on_producer_request(&route, &message);

        ProducerResult {
            result: OperationResult::success(address).with_message(message),
            reply,
        }
    }

    /// Sends a request and waits for its reply.
    ///
    /// Does not wait if sending failed.
    pub async fn request_reply<R>(&self, request: R, timeout: Option<Duration>) -> OperationResult
    where
        R: Into<RequestConfig>,
    {
        let produced = self.send(request);
        if produced.is_success() {
            produced.receive_reply(timeout).await
        } else {
            produced.into_result()
        }
    }

    /// Waits for the reply correlated to `correlation_id`.
    ///
    /// At most one caller may wait for an id at a time. The pending entry is
    /// removed when the call returns or is dropped; replies arriving later are
    /// discarded. The wait ends early with [`OperationStatus::ReceiverError`]
    /// if the reply link fails and with [`OperationStatus::ConnectionError`]
    /// if the connection is lost.
    pub async fn receive_reply(&self, correlation_id: &str, timeout: Duration) -> OperationResult {
        let entry = PendingEntry::register(&self.inner, correlation_id);
        self.await_reply(entry, timeout).await
    }

    async fn await_reply(&self, entry: Result<PendingEntry>, timeout: Duration) -> OperationResult {
        let address = self.reply_to();
        if address.is_none() {
            return OperationResult::failure(
                OperationStatus::ConfigError,
                None,
                Error::ReplyToUndefined,
            );
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                return OperationResult::failure(OperationStatus::OperationError, address, error);
            }
        };

        let outcome = wait_for(timeout, REPLY_CHECK_INTERVAL, |_| {
            self.inner.reply_outcome(&entry)
        })
        .await;

        match outcome {
            Ok(Ok(message)) => {
                let route = self.inner.corresponder.route().unwrap_or_default();
                self.inner
                    .observers
                    .log_adapter()
                    .on_producer_response(&route, &message);
                OperationResult::success(address).with_message(message)
            }
            Ok(Err((status, error))) => {
                debug!(correlation_id = %entry.correlation_id, %error, "reply can no longer arrive");
                OperationResult::failure(status, address, error)
            }
            Err(error) => {
                debug!(correlation_id = %entry.correlation_id, %error, "no reply received");
                OperationResult::failure(OperationStatus::TimedOut, address, error)
            }
        }
    }

    fn reply_plan(&self, request: Option<&RequestConfig>) -> ReplyPlan {
        let address = self.reply_to();
        if address.is_none() {
            return ReplyPlan::Unavailable(OperationResult::failure(
                OperationStatus::ConfigError,
                None,
                Error::ReplyToUndefined,
            ));
        }

        let Some(request) = request else {
            return ReplyPlan::Unavailable(OperationResult::failure(
                OperationStatus::ConfigError,
                address,
                Error::NoRequest,
            ));
        };

        request.correlation_id.clone().map_or_else(
            || {
                ReplyPlan::Unavailable(OperationResult::failure(
                    OperationStatus::OperationError,
                    address,
                    Error::CorrelationUndefined,
                ))
            },
            |correlation_id| ReplyPlan::Await {
                producer: self.clone(),
                reserved: Mutex::new(PendingEntry::register(&self.inner, &correlation_id).ok()),
                correlation_id,
                timeout: request.timeout.unwrap_or(REPLY_TIMEOUT),
            },
        )
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("corresponder", &self.inner.corresponder)
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

enum ReplyPlan {
    Unavailable(OperationResult),
    Await {
        producer: Producer,
        correlation_id: String,
        timeout: Duration,
        /// Entry registered at send time, taken by the first wait.
        reserved: Mutex<Option<PendingEntry>>,
    },
}

/// Result of [`Producer::send`].
///
/// Dereferences to the send's [`OperationResult`].
pub struct ProducerResult {
    result: OperationResult,
    reply: ReplyPlan,
}

impl ProducerResult {
    /// Waits for the reply to the sent request.
    ///
    /// Without a timeout the request's own timeout applies, falling back to
    /// [`REPLY_TIMEOUT`].
    pub async fn receive_reply(&self, timeout: Option<Duration>) -> OperationResult {
        match &self.reply {
            ReplyPlan::Unavailable(result) => result.clone(),
            ReplyPlan::Await {
                producer,
                correlation_id,
                timeout: preset,
                reserved,
            } => {
                let entry = reserved.lock().take().map_or_else(
                    || PendingEntry::register(&producer.inner, correlation_id),
                    Ok,
                );
                producer
                    .await_reply(entry, timeout.unwrap_or(*preset))
                    .await
            }
        }
    }

    /// The send's result.
    #[must_use]
    pub fn into_result(self) -> OperationResult {
        self.result
    }
}

impl Deref for ProducerResult {
    type Target = OperationResult;

    fn deref(&self) -> &Self::Target {
        &self.result
    }
}

impl fmt::Debug for ProducerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerResult")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}
