use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use meshrpc_common::protocol::Result;
use meshrpc_common::transport::{Address, Channel, ClientTransport};
use tracing::{debug, warn};

type Connecting = Shared<BoxFuture<'static, Result<Arc<dyn Channel>>>>;

struct CacheEntry {
    generation: u64,
    connecting: Connecting,
}

type Entries = Arc<DashMap<Address, CacheEntry>>;

/// Shared connections, one per remote address.
///
/// Each address maps to a single connect attempt that every caller awaits,
/// so concurrent first calls to an address open exactly one connection. An
/// entry is removed when its attempt fails or when the established
/// connection closes; the next call then connects again.
///
/// # Architecture
///
/// - Get-or-create is one atomic `DashMap` entry operation; no lock is held
///   while connecting
/// - Entries carry a generation so a finished attempt only ever removes
///   itself, never a newer attempt for the same address
///
/// # Example
///
/// ```rust,no_run
/// use meshrpc_client::ConnectionCache;
/// use meshrpc_common::codec::CodecRegistry;
/// use meshrpc_common::transport::{Address, TcpClientTransport, TcpConfig};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpClientTransport::new(TcpConfig::default(), Arc::new(CodecRegistry::with_json()));
/// let cache = ConnectionCache::new(Arc::new(transport));
///
/// let channel = cache.create(&Address::new("127.0.0.1", 4801)).await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionCache {
    transport: Arc<dyn ClientTransport>,
    entries: Entries,
    next_generation: AtomicU64,
}

impl ConnectionCache {
    pub fn new(transport: Arc<dyn ClientTransport>) -> Self {
        Self {
            transport,
            entries: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Returns the connection for `address`, connecting on first use.
    ///
    /// Callers arriving while a connect is in flight wait for that same
    /// attempt and observe its outcome.
    pub async fn create(&self, address: &Address) -> Result<Arc<dyn Channel>> {
        let connecting = self
            .entries
            .entry(address.clone())
            .or_insert_with(|| self.start_connect(address))
            .connecting
            .clone();
        connecting.await
    }

    fn start_connect(&self, address: &Address) -> CacheEntry {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let transport = self.transport.clone();
        let entries = self.entries.clone();
        let address = address.clone();

        let connecting = async move {
            match transport.connect(&address).await {
                Ok(channel) => {
                    debug!(%address, generation, "Connection established");
                    let closed = channel.closed();
                    tokio::spawn(async move {
                        closed.await;
                        if remove_generation(&entries, &address, generation) {
                            debug!(%address, generation, "Evicted closed connection");
                        }
                    });
                    Ok(channel)
                }
                Err(e) => {
                    warn!(%address, error = %e, "Connect failed");
                    remove_generation(&entries, &address, generation);
                    Err(e)
                }
            }
        }
        .boxed()
        .shared();

        CacheEntry {
            generation,
            connecting,
        }
    }

    /// Removes the entry for `address`. In-flight calls keep their handle;
    /// the connection closes once the last one is dropped.
    pub fn evict(&self, address: &Address) -> bool {
        let removed = self.entries.remove(address).is_some();
        if removed {
            debug!(%address, "Evicted connection");
        }
        removed
    }

    /// Removes the entry for `address` only if it still holds `channel`.
    pub fn evict_channel(&self, address: &Address, channel: &Arc<dyn Channel>) -> bool {
        let removed = self
            .entries
            .remove_if(address, |_, entry| match entry.connecting.peek() {
                Some(Ok(cached)) => Arc::ptr_eq(cached, channel),
                _ => false,
            })
            .is_some();
        if removed {
            debug!(%address, "Evicted failed connection");
        }
        removed
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn transport(&self) -> &Arc<dyn ClientTransport> {
        &self.transport
    }
}

fn remove_generation(entries: &Entries, address: &Address, generation: u64) -> bool {
    entries
        .remove_if(address, |_, entry| entry.generation == generation)
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::StreamExt;
    use meshrpc_common::protocol::{ErrorKind, Message, ServiceError};
    use meshrpc_common::transport::{error_stream, Dispatch, MessageStream};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::watch;

    struct MockChannel {
        closed: watch::Sender<bool>,
    }

    impl MockChannel {
        fn close(&self) {
            self.closed.send_replace(true);
        }
    }

    #[async_trait]
    impl Dispatch for MockChannel {
        async fn fire_and_forget(&self, _message: Message) -> Result<()> {
            Ok(())
        }

        async fn request_response(&self, message: Message) -> Result<Message> {
            Ok(message)
        }

        fn request_stream(&self, _message: Message) -> MessageStream {
            futures::stream::empty().boxed()
        }

        fn request_channel(&self, _messages: MessageStream) -> MessageStream {
            error_stream(ServiceError::internal("unsupported"))
        }
    }

    impl Channel for MockChannel {
        fn is_closed(&self) -> bool {
            *self.closed.borrow()
        }

        fn closed(&self) -> BoxFuture<'static, ()> {
            let mut rx = self.closed.subscribe();
            async move {
                let _ = rx.wait_for(|closed| *closed).await;
            }
            .boxed()
        }
    }

    /// Counts connects; fails the first `failures` attempts.
    struct MockTransport {
        connects: AtomicUsize,
        failures: usize,
        last: std::sync::Mutex<Option<Arc<MockChannel>>>,
    }

    impl MockTransport {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                failures,
                last: std::sync::Mutex::new(None),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn last(&self) -> Arc<MockChannel> {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl ClientTransport for MockTransport {
        async fn connect(&self, address: &Address) -> Result<Arc<dyn Channel>> {
            let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if attempt < self.failures {
                return Err(ServiceError::unavailable(format!("{} refused", address)));
            }
            let (closed, _) = watch::channel(false);
            let channel = Arc::new(MockChannel { closed });
            *self.last.lock().unwrap() = Some(channel.clone());
            Ok(channel)
        }
    }

    fn addr() -> Address {
        Address::new("10.0.0.1", 4801)
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_concurrent_creates_share_one_connect() {
        let transport = MockTransport::new(0);
        let cache = Arc::new(ConnectionCache::new(transport.clone()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.create(&addr()).await.unwrap() }));
        }
        let mut channels = Vec::new();
        for handle in handles {
            channels.push(handle.await.unwrap());
        }

        assert_eq!(transport.connects(), 1);
        assert!(channels.iter().all(|c| Arc::ptr_eq(c, &channels[0])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_reuses_ready_connection() {
        let transport = MockTransport::new(0);
        let cache = ConnectionCache::new(transport.clone());
        cache.create(&addr()).await.unwrap();
        cache.create(&addr()).await.unwrap();
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_failure_evicts_and_retries() {
        let transport = MockTransport::new(1);
        let cache = ConnectionCache::new(transport.clone());

        let err = cache.create(&addr()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert!(!cache.contains(&addr()));

        cache.create(&addr()).await.unwrap();
        assert_eq!(transport.connects(), 2);
        assert!(cache.contains(&addr()));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_all_see_failure() {
        let transport = MockTransport::new(1);
        let cache = Arc::new(ConnectionCache::new(transport.clone()));

        let a = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.create(&addr()).await.is_err() })
        };
        let b = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.create(&addr()).await.is_err() })
        };
        assert!(a.await.unwrap());
        assert!(b.await.unwrap());
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_close_evicts() {
        let transport = MockTransport::new(0);
        let cache = ConnectionCache::new(transport.clone());
        cache.create(&addr()).await.unwrap();

        transport.last().close();
        eventually(|| !cache.contains(&addr())).await;

        cache.create(&addr()).await.unwrap();
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test]
    async fn test_evict_channel_only_matching() {
        let transport = MockTransport::new(0);
        let cache = ConnectionCache::new(transport.clone());
        let first = cache.create(&addr()).await.unwrap();

        cache.evict(&addr());
        let second = cache.create(&addr()).await.unwrap();

        // A stale handle must not evict the newer connection
        assert!(!cache.evict_channel(&addr(), &first));
        assert!(cache.contains(&addr()));
        assert!(cache.evict_channel(&addr(), &second));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let transport = MockTransport::new(0);
        let cache = ConnectionCache::new(transport.clone());
        cache.create(&addr()).await.unwrap();
        cache.create(&Address::new("10.0.0.2", 4801)).await.unwrap();
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
