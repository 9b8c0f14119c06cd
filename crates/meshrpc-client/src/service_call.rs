//! Service call orchestration.
//!
//! A [`ServiceCall`] turns a message into a call: a qualifier served by the
//! local dispatcher is invoked in process; anything else is routed to a
//! registered instance and sent over a cached connection.
//!
//! ```text
//! message -> local? -> LocalDispatcher
//!                  \-> Router -> Address -> ConnectionCache -> Channel
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use meshrpc_common::codec::CodecRegistry;
use meshrpc_common::protocol::{ErrorKind, Message, Result, ServiceError};
use meshrpc_common::transport::{error_stream, Address, Channel, ClientTransport, Dispatch, MessageStream};
use meshrpc_router::{RoundRobinRouter, Router, ServiceRegistry};
use meshrpc_server::LocalDispatcher;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::cache::ConnectionCache;

/// Builder for [`ServiceCall`].
///
/// # Default Configuration
///
/// - no local dispatcher: every call is remote
/// - an empty [`ServiceRegistry`]
/// - [`RoundRobinRouter`]
/// - no transport: remote calls fail with `ServiceUnavailable`
/// - the local dispatcher's codecs, or JSON only
#[derive(Default)]
pub struct ServiceCallBuilder {
    local: Option<Arc<LocalDispatcher>>,
    registry: Option<ServiceRegistry>,
    router: Option<Arc<dyn Router>>,
    transport: Option<Arc<dyn ClientTransport>>,
    codecs: Option<Arc<CodecRegistry>>,
}

impl ServiceCallBuilder {
    pub fn local(mut self, dispatcher: Arc<LocalDispatcher>) -> Self {
        self.local = Some(dispatcher);
        self
    }

    pub fn registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// The transport for remote calls, wrapped in a connection cache.
    pub fn transport(mut self, transport: Arc<dyn ClientTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    pub fn build(self) -> ServiceCall {
        let codecs = self
            .codecs
            .or_else(|| self.local.as_ref().map(|l| l.codecs().clone()))
            .unwrap_or_else(|| Arc::new(CodecRegistry::with_json()));

        ServiceCall {
            local: self.local,
            registry: self.registry.unwrap_or_default(),
            router: self.router.unwrap_or_else(|| Arc::new(RoundRobinRouter::new())),
            cache: self.transport.map(|t| Arc::new(ConnectionCache::new(t))),
            codecs,
        }
    }
}

/// Client-side entry point for all four communication modes.
///
/// Cheap to clone; clones share the registry, the router and the connection
/// cache.
///
/// # Example
///
/// ```no_run
/// use meshrpc_client::ServiceCall;
/// use meshrpc_common::codec::CodecRegistry;
/// use meshrpc_common::protocol::Message;
/// use meshrpc_common::transport::{Dispatch, TcpClientTransport, TcpConfig};
/// use meshrpc_router::ServiceRegistry;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let codecs = Arc::new(CodecRegistry::with_json());
/// let call = ServiceCall::builder()
///     .registry(ServiceRegistry::new())
///     .transport(Arc::new(TcpClientTransport::new(TcpConfig::default(), codecs.clone())))
///     .codecs(codecs)
///     .build();
///
/// let response = call
///     .request_response(Message::new("Greeting/hello", json!("joe")))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServiceCall {
    local: Option<Arc<LocalDispatcher>>,
    registry: ServiceRegistry,
    router: Arc<dyn Router>,
    cache: Option<Arc<ConnectionCache>>,
    codecs: Arc<CodecRegistry>,
}

impl ServiceCall {
    pub fn builder() -> ServiceCallBuilder {
        ServiceCallBuilder::default()
    }

    /// A copy of this call that routes with `router`.
    pub fn with_router(&self, router: Arc<dyn Router>) -> Self {
        Self {
            router,
            ..self.clone()
        }
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn cache(&self) -> Option<&Arc<ConnectionCache>> {
        self.cache.as_ref()
    }

    /// The local dispatcher if it serves `message`.
    fn local_target(&self, message: &Message) -> Option<&Arc<LocalDispatcher>> {
        self.local
            .as_ref()
            .filter(|local| local.contains(message.qualifier()))
    }

    /// Routes a message and returns the connection to send it on.
    async fn connect(&self, message: &Message) -> Result<Remote> {
        let qualifier = message.qualifier();
        let snapshot = self.registry.snapshot();
        let reference = self.router.route(&snapshot, message).ok_or_else(|| {
            ServiceError::unavailable(format!(
                "No reachable member with such service definition [{}]",
                qualifier
            ))
        })?;

        let cache = self.cache.as_ref().ok_or_else(|| {
            ServiceError::unavailable(format!("No transport configured to reach '{}'", qualifier))
        })?;

        let address = reference.address().clone();
        debug!(qualifier, endpoint = reference.endpoint_id(), %address, "Routing call");
        let channel = cache.create(&address).await?;

        Ok(Remote {
            cache: cache.clone(),
            address,
            channel,
        })
    }
}

/// A routed connection and what is needed to evict it.
#[derive(Clone)]
struct Remote {
    cache: Arc<ConnectionCache>,
    address: Address,
    channel: Arc<dyn Channel>,
}

impl Remote {
    /// Evicts the connection if `error` says it is broken.
    fn observe(&self, error: &ServiceError) {
        if error.kind() == ErrorKind::Connection && !error.is_remote() {
            self.cache.evict_channel(&self.address, &self.channel);
        }
    }

    fn observe_stream(self, responses: MessageStream) -> MessageStream {
        responses
            .inspect(move |item| {
                if let Err(e) = item {
                    self.observe(e);
                }
            })
            .boxed()
    }
}

fn require_qualifier(message: &Message) -> Result<()> {
    if message.qualifier().is_empty() {
        return Err(ServiceError::bad_request("Missing required header 'q'"));
    }
    Ok(())
}

#[async_trait]
impl Dispatch for ServiceCall {
    async fn fire_and_forget(&self, message: Message) -> Result<()> {
        require_qualifier(&message)?;
        if let Some(local) = self.local_target(&message) {
            return local.fire_and_forget(message).await;
        }

        let remote = self.connect(&message).await?;
        let result = remote.channel.fire_and_forget(message).await;
        if let Err(e) = &result {
            remote.observe(e);
        }
        result
    }

    async fn request_response(&self, message: Message) -> Result<Message> {
        require_qualifier(&message)?;
        if let Some(local) = self.local_target(&message) {
            return local.request_response(message).await;
        }

        let remote = self.connect(&message).await?;
        let result = remote.channel.request_response(message).await;
        if let Err(e) = &result {
            remote.observe(e);
        }
        result
    }

    fn request_stream(&self, message: Message) -> MessageStream {
        if let Err(e) = require_qualifier(&message) {
            return error_stream(e);
        }
        if let Some(local) = self.local_target(&message) {
            return local.request_stream(message);
        }

        let call = self.clone();
        stream::once(async move {
            match call.connect(&message).await {
                Ok(remote) => {
                    let responses = remote.channel.request_stream(message);
                    remote.observe_stream(responses)
                }
                Err(e) => error_stream(e),
            }
        })
        .flatten()
        .boxed()
    }

    /// The first message selects the target. Its stream id, or a fresh one,
    /// is stamped on every outgoing message of the channel.
    fn request_channel(&self, messages: MessageStream) -> MessageStream {
        let call = self.clone();
        stream::once(async move {
            let mut messages = messages;
            let first = match messages.next().await {
                Some(Ok(first)) => first,
                Some(Err(e)) => return error_stream(e),
                None => {
                    return error_stream(ServiceError::bad_request(
                        "Request channel needs at least one message",
                    ))
                }
            };
            if let Err(e) = require_qualifier(&first) {
                return error_stream(e);
            }

            let stream_id = first
                .stream_id()
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            trace!(qualifier = first.qualifier(), %stream_id, "Opening channel");

            let first = first.with_stream_id(stream_id.as_str());
            let head = first.clone();
            let requests = stream::once(async move { Ok::<_, ServiceError>(head) })
                .chain(messages.map(move |item| item.map(|m| m.with_stream_id(stream_id.as_str()))))
                .boxed();

            if let Some(local) = call.local_target(&first) {
                return local.request_channel(requests);
            }
            match call.connect(&first).await {
                Ok(remote) => {
                    let responses = remote.channel.request_channel(requests);
                    remote.observe_stream(responses)
                }
                Err(e) => error_stream(e),
            }
        })
        .flatten()
        .boxed()
    }
}
