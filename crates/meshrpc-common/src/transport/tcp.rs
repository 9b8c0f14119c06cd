use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tracing::debug;

use super::connection::{Connection, Role};
use super::{Address, Channel, ClientTransport, Dispatch, MessageStream};
use crate::codec::{CodecRegistry, MessageCodec};
use crate::protocol::error::{Result, ServiceError};
use crate::protocol::Message;

/// TCP transport configuration.
///
/// # Default Configuration
///
/// - `max_frame_size`: 16 MiB
/// - `stream_window`: 32 frames
/// - `connect_timeout_ms`: 5000
/// - `nodelay`: true
///
/// # Example
///
/// ```rust
/// use meshrpc_common::transport::TcpConfig;
///
/// let config = TcpConfig {
///     stream_window: 8,
///     ..TcpConfig::default()
/// };
/// assert_eq!(config.connect_timeout_ms, 5000);
/// ```
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Largest accepted frame, prefix excluded
    pub max_frame_size: usize,
    /// Frames a stream receiver lets the sender run ahead
    pub stream_window: u32,
    /// Connect timeout per resolved address in milliseconds
    pub connect_timeout_ms: u64,
    /// Disable Nagle's algorithm on connected sockets
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            stream_window: 32,
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// Client half of the TCP transport.
///
/// Every [`connect`](ClientTransport::connect) opens a new socket; wrap the
/// transport in a connection cache to share connections.
pub struct TcpClientTransport {
    config: TcpConfig,
    codec: MessageCodec,
}

impl TcpClientTransport {
    pub fn new(config: TcpConfig, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            config,
            codec: MessageCodec::new(codecs),
        }
    }

    async fn open_socket(&self, address: &Address) -> Result<TcpStream> {
        let target = address.to_string();
        let socket_addrs = tokio::net::lookup_host(&target).await.map_err(|e| {
            ServiceError::unavailable(format!("Invalid address '{}': {}", target, e))
        })?;

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);

        // Try each resolved address until one succeeds
        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some(format!("timed out after {}ms", self.config.connect_timeout_ms)),
            }
        }

        Err(ServiceError::unavailable(format!(
            "Failed to connect to {}: {}",
            target,
            last_err.unwrap_or_else(|| "no address resolved".to_string())
        )))
    }
}

#[async_trait]
impl ClientTransport for TcpClientTransport {
    async fn connect(&self, address: &Address) -> Result<Arc<dyn Channel>> {
        let stream = self.open_socket(address).await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!(%address, "Connected");

        let conn = Connection::spawn(stream, Role::Client, self.codec.clone(), &self.config);
        Ok(Arc::new(TcpChannel { conn }))
    }
}

/// An established client connection.
///
/// Dropping the last handle closes the socket.
pub struct TcpChannel {
    conn: Arc<Connection>,
}

impl TcpChannel {
    pub fn peer(&self) -> &str {
        self.conn.peer()
    }

    /// Closes the connection; pending calls fail with a connection error.
    pub fn close(&self) {
        self.conn.close();
    }
}

#[async_trait]
impl Dispatch for TcpChannel {
    async fn fire_and_forget(&self, message: Message) -> Result<()> {
        self.conn.fire_and_forget(message).await
    }

    async fn request_response(&self, message: Message) -> Result<Message> {
        self.conn.request_response(message).await
    }

    fn request_stream(&self, message: Message) -> MessageStream {
        self.conn.request_stream(message)
    }

    fn request_channel(&self, messages: MessageStream) -> MessageStream {
        self.conn.request_channel(messages)
    }
}

impl Channel for TcpChannel {
    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        self.conn.closed()
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TcpConfig::default();
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.stream_window, 32);
        assert_eq!(config.connect_timeout_ms, 5000);
        assert!(config.nodelay);
    }

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Address::from(listener.local_addr().unwrap());
        drop(listener);

        let transport = TcpClientTransport::new(TcpConfig::default(), Arc::new(CodecRegistry::with_json()));
        let err = transport.connect(&addr).await.err().unwrap();
        assert_eq!(err.kind(), crate::protocol::ErrorKind::ServiceUnavailable);
    }
}
