//! Links opened for a single message.
//!
//! Clients and servers open a link per request or reply instead of keeping
//! one per route. The link is closed again whatever the outcome.

use std::time::Duration;

use proven_amq_transport::{
    Delivery, ReceiverEvent, ReceiverEvents, ReceiverOptions, SenderEvent, SenderEvents,
    SenderOptions, TransportError, TransportMessage,
};
use tracing::trace;

use crate::connector::Connector;
use crate::error::Error;
use crate::result::OperationStatus;

/// Why a transient link gave up.
pub(crate) type Failure = (OperationStatus, Error);

fn timeout_error(timeout: Duration) -> Error {
    Error::Timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
}

/// Opens a sender, waits until it is sendable, sends and closes it.
///
/// `Ok(None)` means the link took the message but the broker did not accept
/// the delivery.
pub(crate) async fn send_once(
    connector: &Connector,
    address: &str,
    message: TransportMessage,
    timeout: Duration,
) -> Result<Option<Delivery>, Failure> {
    let mut handle = connector
        .create_sender(SenderOptions {
            address: address.to_string(),
            timeout: Some(timeout),
        })
        .map_err(|error| (OperationStatus::ConnectionError, error))?;

    let outcome = match tokio::time::timeout(timeout, sendable(&mut handle.events)).await {
        Ok(Ok(())) => Ok(handle.link.send(message)),
        Ok(Err(failure)) => Err(failure),
        Err(_) => Err((OperationStatus::SenderError, timeout_error(timeout))),
    };

    trace!(address, "closing transient sender");
    handle.link.close();
    outcome
}

async fn sendable(events: &mut SenderEvents) -> Result<(), Failure> {
    while let Some(event) = events.recv().await {
        match event {
            SenderEvent::Sendable => return Ok(()),
            SenderEvent::Rejected(error) | SenderEvent::Error(error) => {
                return Err((OperationStatus::SenderError, Error::Sender(error)));
            }
            SenderEvent::Closed => break,
        }
    }

    Err((
        OperationStatus::ConnectionError,
        Error::Transport(TransportError::ConnectionClosed),
    ))
}

/// Opens a receiver, waits for the first message and closes it.
pub(crate) async fn receive_once(
    connector: &Connector,
    options: ReceiverOptions,
    timeout: Duration,
) -> Result<TransportMessage, Failure> {
    let address = options.address.clone();
    let mut handle = connector
        .create_receiver(options)
        .map_err(|error| (OperationStatus::ConnectionError, error))?;

    let outcome = match tokio::time::timeout(timeout, first_message(&mut handle.events)).await {
        Ok(outcome) => outcome,
        Err(_) => Err((OperationStatus::TimedOut, timeout_error(timeout))),
    };

    trace!(%address, "closing transient receiver");
    handle.link.close();
    outcome
}

async fn first_message(events: &mut ReceiverEvents) -> Result<TransportMessage, Failure> {
    while let Some(event) = events.recv().await {
        match event {
            ReceiverEvent::Opened => {}
            ReceiverEvent::Message(message) => return Ok(message),
            ReceiverEvent::Error(error) => {
                return Err((OperationStatus::ReceiverError, Error::Receiver(error)));
            }
            ReceiverEvent::Closed => break,
        }
    }

    Err((
        OperationStatus::ConnectionError,
        Error::Transport(TransportError::ConnectionClosed),
    ))
}
