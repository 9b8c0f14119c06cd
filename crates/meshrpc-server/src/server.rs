use std::sync::{Arc, Mutex, PoisonError};

use meshrpc_common::protocol::Result;
use meshrpc_common::transport::{Address, Dispatch, ServerTransport, TcpConfig, TcpServerTransport};
use meshrpc_router::ServiceEndpoint;
use tracing::info;

use crate::dispatcher::LocalDispatcher;

/// Hosts a [`LocalDispatcher`] on a server transport.
///
/// # Example
///
/// ```no_run
/// use meshrpc_common::codec::CodecRegistry;
/// use meshrpc_common::transport::{Address, TcpConfig};
/// use meshrpc_server::{LocalDispatcher, ServiceDefinition, ServiceServer};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dispatcher = LocalDispatcher::builder(Arc::new(CodecRegistry::with_json()))
///     .service(ServiceDefinition::new("Greeting").request_response("hello", |name: String| async move {
///         Ok(format!("Hello, {}", name))
///     }))
///     .build()?;
///
/// let server = ServiceServer::tcp(Arc::new(dispatcher), TcpConfig::default());
/// let bound = server.start(&Address::new("127.0.0.1", 0)).await?;
/// println!("serving on {}", bound);
/// # Ok(())
/// # }
/// ```
pub struct ServiceServer {
    dispatcher: Arc<LocalDispatcher>,
    transport: Arc<dyn ServerTransport>,
    address: Mutex<Option<Address>>,
}

impl ServiceServer {
    pub fn new(dispatcher: Arc<LocalDispatcher>, transport: Arc<dyn ServerTransport>) -> Self {
        Self {
            dispatcher,
            transport,
            address: Mutex::new(None),
        }
    }

    /// A server on the TCP transport, sharing the dispatcher's codecs.
    pub fn tcp(dispatcher: Arc<LocalDispatcher>, config: TcpConfig) -> Self {
        let transport = TcpServerTransport::new(config, dispatcher.codecs().clone());
        Self::new(dispatcher, Arc::new(transport))
    }

    pub fn dispatcher(&self) -> &Arc<LocalDispatcher> {
        &self.dispatcher
    }

    /// Binds the transport. Returns the bound address.
    pub async fn start(&self, address: &Address) -> Result<Address> {
        let acceptor: Arc<dyn Dispatch> = self.dispatcher.clone();
        let bound = self.transport.bind(address, acceptor).await?;
        info!(address = %bound, services = self.dispatcher.registrations().len(), "Service server started");
        *self.address.lock().unwrap_or_else(PoisonError::into_inner) = Some(bound.clone());
        Ok(bound)
    }

    pub async fn stop(&self) -> Result<()> {
        self.transport.stop().await?;
        self.address.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    /// The bound address while running.
    pub fn address(&self) -> Option<Address> {
        self.address.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// What this server announces to discovery, once started.
    pub fn endpoint(&self, id: impl Into<String>) -> Option<ServiceEndpoint> {
        let address = self.address()?;
        Some(ServiceEndpoint::new(id, address).services(self.dispatcher.registrations().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceDefinition;
    use futures::stream::{self, BoxStream, StreamExt};
    use meshrpc_common::codec::CodecRegistry;
    use meshrpc_common::protocol::{ErrorKind, Message, ServiceError};
    use meshrpc_common::transport::{ClientTransport, TcpClientTransport};
    use serde_json::json;

    fn dispatcher() -> Arc<LocalDispatcher> {
        let dispatcher = LocalDispatcher::builder(Arc::new(CodecRegistry::with_json()))
            .service(
                ServiceDefinition::new("Greeting")
                    .request_response("hello", |name: String| async move { Ok(format!("Hello, {}", name)) })
                    .request_response("secret", |_: String| async move {
                        Err::<String, _>(ServiceError::unauthorized("no token"))
                    })
                    .request_stream("count", |n: u32| stream::iter((0..n).map(Ok)))
                    .request_channel("echo", |s: BoxStream<'static, Result<String>>| s),
            )
            .build()
            .unwrap();
        Arc::new(dispatcher)
    }

    async fn started() -> (ServiceServer, Address) {
        let server = ServiceServer::tcp(dispatcher(), TcpConfig::default());
        let bound = server.start(&Address::new("127.0.0.1", 0)).await.unwrap();
        (server, bound)
    }

    fn client() -> TcpClientTransport {
        TcpClientTransport::new(TcpConfig::default(), Arc::new(CodecRegistry::with_json()))
    }

    #[tokio::test]
    async fn test_start_and_endpoint() {
        let (server, bound) = started().await;
        assert_eq!(server.address(), Some(bound.clone()));

        let endpoint = server.endpoint("node-1").unwrap();
        assert_eq!(endpoint.address, bound);
        assert_eq!(endpoint.references().len(), 4);

        server.stop().await.unwrap();
        assert!(server.address().is_none());
        assert!(server.endpoint("node-1").is_none());
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let (server, bound) = started().await;
        let channel = client().connect(&bound).await.unwrap();

        let response = channel
            .request_response(Message::new("Greeting/hello", json!("joe")))
            .await
            .unwrap();
        assert_eq!(
            response.decode_data::<String>(&CodecRegistry::with_json()).unwrap(),
            "Hello, joe"
        );
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_kind_preserved() {
        let (server, bound) = started().await;
        let channel = client().connect(&bound).await.unwrap();

        let err = channel
            .request_response(Message::new("Greeting/secret", json!("x")))
            .await
            .unwrap_err();
        assert!(err.is_remote());
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.message(), "no token");
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_and_channel_over_tcp() {
        let (server, bound) = started().await;
        let channel = client().connect(&bound).await.unwrap();
        let codecs = CodecRegistry::with_json();

        let counted: Vec<u32> = channel
            .request_stream(Message::new("Greeting/count", json!(100)))
            .map(|m| m.unwrap().decode_data::<u32>(&codecs).unwrap())
            .collect()
            .await;
        assert_eq!(counted, (0..100).collect::<Vec<_>>());

        let input = stream::iter(vec![
            Ok(Message::new("Greeting/echo", json!("a"))),
            Ok(Message::new("Greeting/echo", json!("b"))),
            Ok(Message::new("Greeting/echo", json!("c"))),
        ])
        .boxed();
        let echoed: Vec<String> = channel
            .request_channel(input)
            .map(|m| m.unwrap().decode_data(&codecs).unwrap())
            .collect()
            .await;
        assert_eq!(echoed, vec!["a", "b", "c"]);
        server.stop().await.unwrap();
    }
}
