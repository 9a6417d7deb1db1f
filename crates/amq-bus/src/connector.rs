use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use proven_amq_transport::{
    Connection, ConnectionEvent, ConnectionOptions, ReceiverHandle, ReceiverOptions,
    SenderHandle, SenderOptions, Transport,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::ConnectorConfig;
use crate::error::{Error, ErrorHandler, Result};
use crate::log_adapter::{LogAdapter, Observers};

/// Lifecycle of the connector's connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Disconnected,

    /// A connection attempt is in progress.
    Connecting,

    /// The connection is open.
    Connected,
}

struct ConnectorInner {
    connection: Mutex<Option<Arc<dyn Connection>>>,
    forwarder: Mutex<Option<CancellationToken>>,
    lifecycle: tokio::sync::Mutex<()>,
    observers: Observers,
    options: Mutex<ConnectionOptions>,
    state: Mutex<ConnectionState>,
    tasks: TaskTracker,
    transport: Arc<dyn Transport>,
}

impl ConnectorInner {
    fn stop_forwarder(&self) {
        if let Some(token) = self.forwarder.lock().take() {
            token.cancel();
        }
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Disconnected {
                reconnecting: true, ..
            } => {
                debug!("transport is reconnecting, ignoring disconnect");
            }
            ConnectionEvent::Disconnected { error, .. } => {
                self.connection.lock().take();
                *self.state.lock() = ConnectionState::Disconnected;

                let log_adapter = self.observers.log_adapter();
                log_adapter.on_disconnect(error.as_ref());
                if let Some(error) = error {
                    let error = Error::Transport(error);
                    log_adapter.on_connection_error(&error);
                    self.observers.report(&error);
                }
            }
            ConnectionEvent::Error(error) => {
                let error = Error::Transport(error);
                self.observers.log_adapter().on_connection_error(&error);
                self.observers.report(&error);
            }
        }
    }
}

/// Owner of the single broker connection.
///
/// Cloning is cheap; clones share the connection. Producers and consumers
/// open their links through it.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl Connector {
    /// Creates a disconnected connector.
    pub fn new<T>(transport: T, options: ConnectionOptions) -> Self
    where
        T: Transport,
    {
        Self {
            inner: Arc::new(ConnectorInner {
                connection: Mutex::new(None),
                forwarder: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                observers: Observers::new(),
                options: Mutex::new(options),
                state: Mutex::new(ConnectionState::Disconnected),
                tasks: TaskTracker::new(),
                transport: Arc::new(transport),
            }),
        }
    }

    /// Creates a disconnected connector from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_config<T>(transport: T, config: &ConnectorConfig) -> Result<Self>
    where
        T: Transport,
    {
        Ok(Self::new(transport, config.connection_options()?))
    }

    /// Sets the handler receiving connection level errors.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.inner.observers.set_error_handler(handler);
    }

    /// Sets the log adapter.
    pub fn set_log_adapter(&self, log_adapter: Arc<dyn LogAdapter>) {
        self.inner.observers.set_log_adapter(log_adapter);
    }

    pub(crate) fn observers(&self) -> &Observers {
        &self.inner.observers
    }

    /// Options used by [`Connector::connect`].
    #[must_use]
    pub fn options(&self) -> ConnectionOptions {
        self.inner.options.lock().clone()
    }

    /// Connects with the current options.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to connect.
    pub async fn connect(&self) -> Result<()> {
        let options = self.options();
        self.connect_with(options).await
    }

    /// Connects with new options, replacing any existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to connect. The connector is
    /// left disconnected.
    pub async fn connect_with(&self, options: ConnectionOptions) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        // A connection that died without a disconnect event still holds a
        // forwarder, so it is closed whether or not it is open.
        let existing = self.inner.connection.lock().is_some();
        if existing {
            info!("connection present, re-establishing connection");
            self.close_connection().await;
        }

        *self.inner.options.lock() = options.clone();
        *self.inner.state.lock() = ConnectionState::Connecting;

        let connection = match self.inner.transport.connect(&options).await {
            Ok(connection) => connection,
            Err(error) => {
                *self.inner.state.lock() = ConnectionState::Disconnected;
                let error = Error::Transport(error);
                self.inner.observers.log_adapter().on_connection_error(&error);
                return Err(error);
            }
        };

        self.spawn_forwarder(connection.events());
        *self.inner.connection.lock() = Some(connection);
        *self.inner.state.lock() = ConnectionState::Connected;

        self.inner.observers.log_adapter().on_connect(&options);

        Ok(())
    }

    /// Closes the connection. Does nothing if not connected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.close_connection().await;
    }

    /// Whether a connection exists and is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.is_open())
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let state = *self.inner.state.lock();
        if state == ConnectionState::Connected && !self.is_connected() {
            ConnectionState::Disconnected
        } else {
            state
        }
    }

    /// Starts attaching a sending link.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotDefined`] while disconnected.
    pub fn create_sender<O>(&self, options: O) -> Result<SenderHandle>
    where
        O: Into<SenderOptions>,
    {
        Ok(self.connection()?.open_sender(options.into())?)
    }

    /// Starts attaching a receiving link.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotDefined`] while disconnected.
    pub fn create_receiver<O>(&self, options: O) -> Result<ReceiverHandle>
    where
        O: Into<ReceiverOptions>,
    {
        Ok(self.connection()?.open_receiver(options.into())?)
    }

    fn connection(&self) -> Result<Arc<dyn Connection>> {
        self.inner
            .connection
            .lock()
            .clone()
            .ok_or(Error::ConnectionNotDefined)
    }

    async fn close_connection(&self) {
        self.inner.stop_forwarder();

        let connection = self.inner.connection.lock().take();
        *self.inner.state.lock() = ConnectionState::Disconnected;

        if let Some(connection) = connection {
            if let Err(error) = connection.close().await {
                error!(%error, "failed to close connection");
            }
            self.inner.observers.log_adapter().on_disconnect(None);
        }
    }

    fn spawn_forwarder(&self, mut events: broadcast::Receiver<ConnectionEvent>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.forwarder.lock().replace(token.clone()) {
            previous.cancel();
        }

        let inner: Weak<ConnectorInner> = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        debug!("connection event forwarder cancelled");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => {
                            let Some(inner) = inner.upgrade() else {
                                break;
                            };
                            inner.handle_event(event);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("connection event stream closed");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            error!("connection event forwarder lagged by {} events", n);
                        }
                    }
                }
            }
        });
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("state", &self.state())
            .field("options", &*self.inner.options.lock())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectorInner {
    fn drop(&mut self) {
        self.stop_forwarder();
        self.tasks.close();
    }
}
