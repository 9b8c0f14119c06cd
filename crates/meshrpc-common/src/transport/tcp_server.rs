use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{Connection, Role};
use super::tcp::TcpConfig;
use super::{Address, Dispatch, ServerTransport};
use crate::codec::{CodecRegistry, MessageCodec};
use crate::protocol::error::{Result, ServiceError};

/// Server half of the TCP transport.
///
/// Accepts connections in a loop and spawns a multiplexed connection for
/// each. Every inbound call is handed to the acceptor given to
/// [`bind`](ServerTransport::bind).
pub struct TcpServerTransport {
    config: TcpConfig,
    codec: MessageCodec,
    running: Mutex<Option<RunningServer>>,
}

struct RunningServer {
    address: Address,
    accept_task: JoinHandle<()>,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
}

impl TcpServerTransport {
    pub fn new(config: TcpConfig, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            config,
            codec: MessageCodec::new(codecs),
            running: Mutex::new(None),
        }
    }

    /// The bound address, if the server is running.
    pub async fn local_address(&self) -> Option<Address> {
        self.running.lock().await.as_ref().map(|r| r.address.clone())
    }

    /// Number of currently open inbound connections.
    pub async fn connection_count(&self) -> usize {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.connections.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    async fn bind(&self, address: &Address, acceptor: Arc<dyn Dispatch>) -> Result<Address> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            return Err(ServiceError::bad_request(format!(
                "Server transport already bound to {}",
                server.address
            )));
        }

        let listener = TcpListener::bind(address.to_string()).await.map_err(|e| {
            ServiceError::unavailable(format!("Failed to bind to {}: {}", address, e))
        })?;
        let bound = Address::from(listener.local_addr()?);
        info!(address = %bound, "Server transport listening");

        let connections: Arc<DashMap<u64, Arc<Connection>>> = Arc::new(DashMap::new());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            self.codec.clone(),
            self.config.clone(),
            connections.clone(),
        ));

        *running = Some(RunningServer {
            address: bound.clone(),
            accept_task,
            connections,
        });

        Ok(bound)
    }

    async fn stop(&self) -> Result<()> {
        let server = self.running.lock().await.take();
        if let Some(server) = server {
            server.accept_task.abort();
            let ids: Vec<u64> = server.connections.iter().map(|e| *e.key()).collect();
            for id in ids {
                if let Some((_, conn)) = server.connections.remove(&id) {
                    conn.close();
                }
            }
            info!(address = %server.address, "Server transport stopped");
        }
        Ok(())
    }
}

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Arc<dyn Dispatch>,
    codec: MessageCodec,
    config: TcpConfig,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
) {
    let next_id = AtomicU64::new(0);
    loop {
        let (stream, peer_addr) = accept_with_backoff(|| listener.accept()).await;

        debug!(%peer_addr, "Connection established");
        if config.nodelay {
            let _ = stream.set_nodelay(true);
        }

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::spawn(stream, Role::Server(acceptor.clone()), codec.clone(), &config);
        let closed = conn.closed();
        connections.insert(id, conn);

        let connections = connections.clone();
        tokio::spawn(async move {
            closed.await;
            connections.remove(&id);
        });
    }
}
