//! meshrpc Transport Layer
//!
//! This module defines the pluggable network boundary and ships a TCP
//! implementation of it.
//!
//! # Architecture
//!
//! - **[`Dispatch`]**: the four communication-mode operations. Transport
//!   channels, the local dispatcher and the service call all implement it.
//! - **[`Channel`]**: an established connection; a `Dispatch` with a close
//!   signal.
//! - **[`ClientTransport`]** / **[`ServerTransport`]**: connect to an
//!   [`Address`], or bind one and hand inbound calls to an acceptor.
//!
//! # TCP Wire Format
//!
//! ```text
//! [4-byte length as u32 big-endian] [1-byte kind] [8-byte stream id] [body]
//! ```
//!
//! Calls are multiplexed over one socket by stream id. Streams use credit
//! based flow control (see [`frame::Frame::RequestN`]).
//!
//! # Example
//!
//! ```no_run
//! use meshrpc_common::codec::CodecRegistry;
//! use meshrpc_common::protocol::Message;
//! use meshrpc_common::transport::{Address, ClientTransport, TcpClientTransport, TcpConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = TcpClientTransport::new(TcpConfig::default(), Arc::new(CodecRegistry::with_json()));
//! let channel = transport.connect(&"127.0.0.1:4801".parse()?).await?;
//!
//! let response = channel
//!     .request_response(Message::new("Greeting/hello", json!("joe")))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod connection;
pub mod frame;
pub mod tcp;
pub mod tcp_server;

pub use frame::Frame;
pub use tcp::{TcpChannel, TcpClientTransport, TcpConfig};
pub use tcp_server::TcpServerTransport;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::protocol::error::{Result, ServiceError};
use crate::protocol::Message;

/// A stream of messages terminated by completion (end of stream) or by one
/// error item.
pub type MessageStream = BoxStream<'static, Result<Message>>;

/// A stream that yields one error and ends.
pub fn error_stream(error: ServiceError) -> MessageStream {
    stream::once(async move { Err(error) }).boxed()
}

/// Ends `items` right after its first error, so an error is always the
/// terminal signal.
pub fn terminate_on_error<T, S>(items: S) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
{
    items
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
}

/// Network location of a service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ServiceError::bad_request(format!("Invalid address '{}': missing port", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| ServiceError::bad_request(format!("Invalid address '{}': {}", s, e)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ServiceError::bad_request(format!("Invalid address '{}': missing host", s)));
        }
        Ok(Address::new(host, port))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::new(addr.ip().to_string(), addr.port())
    }
}

/// The four communication-mode operations.
///
/// Every operation reports failure on its own pipeline: futures resolve to
/// `Err`, streams yield one `Err` item and end.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Sends one message. Completion means the message was accepted for
    /// sending, not that the peer processed it.
    async fn fire_and_forget(&self, message: Message) -> Result<()>;

    /// Sends one message and resolves to exactly one response or error.
    async fn request_response(&self, message: Message) -> Result<Message>;

    /// Sends one message and yields zero or more responses in order.
    fn request_stream(&self, message: Message) -> MessageStream;

    /// Full duplex: the first message of `messages` selects the target.
    fn request_channel(&self, messages: MessageStream) -> MessageStream;
}

/// An established connection.
pub trait Channel: Dispatch {
    fn is_closed(&self) -> bool;

    /// Resolves once the connection is closed, by either side or by error.
    fn closed(&self) -> BoxFuture<'static, ()>;
}

/// Client half of a transport.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Establishes a new connection. Callers wanting reuse go through a
    /// connection cache rather than calling this per request.
    async fn connect(&self, address: &Address) -> Result<Arc<dyn Channel>>;
}

/// Server half of a transport.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Binds `address` and delivers every inbound call to `acceptor`.
    /// Returns the actually bound address (port 0 resolves to a real port).
    async fn bind(&self, address: &Address, acceptor: Arc<dyn Dispatch>) -> Result<Address>;

    /// Stops accepting and closes every open connection.
    async fn stop(&self) -> Result<()>;
}
