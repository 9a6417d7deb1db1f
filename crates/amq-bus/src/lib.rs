//! Correlation-based request/reply over AMQ links.
//!
//! This crate layers request/reply messaging on top of a link-oriented
//! transport (see `proven_amq_transport`):
//! - [`Connector`] owns the single broker connection
//! - [`Producer`] sends requests and matches replies by correlation id
//! - [`Consumer`] hands inbound requests to a handler that can reply
//! - [`BackoutProducer`] moves unprocessable requests to a dead-letter address
//! - [`ProducerClient`] and [`ConsumerServer`] do request/reply with a link
//!   per request, leaving correlation to broker-side selectors
//!
//! Every wait (link attach, reply) is bounded by the [`Awaiter`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod awaiter;
mod backout;
mod client;
mod config;
mod connector;
mod consumer;
mod corresponder;
mod error;
mod log_adapter;
mod message;
mod producer;
mod result;
mod server;
mod transient;

pub use awaiter::{Awaiter, DEFAULT_POLL_INTERVAL, wait_for};
pub use backout::BackoutProducer;
pub use client::{ClientRequest, ProducerClient};
pub use config::{
    AmqBusConfig, ConnectorConfig, DEFAULT_OPEN_TIMEOUT, ReconnectConfig, ReconnectSetting,
    RouteOptions, Routes,
};
pub use connector::{ConnectionState, Connector};
pub use consumer::{Consumer, ConsumerHandler, ConsumerResult};
pub use corresponder::{Corresponder, CorresponderState, LinkHandler, Role};
pub use error::{Error, ErrorHandler, Result};
pub use log_adapter::{LogAdapter, TracingLogAdapter};
pub use message::{Headers, Message, RequestConfig, headers_to_string};
pub use producer::{Producer, ProducerResult, REPLY_CHECK_INTERVAL, REPLY_TIMEOUT};
pub use result::{OperationResult, OperationStatus};
pub use server::{ConsumerServer, ServerHandler, ServerResponse};
