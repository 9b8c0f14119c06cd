//! meshrpc
//!
//! A transport-agnostic RPC runtime for a microservices mesh. Services
//! register typed handlers in a local dispatch table; callers reach them
//! through [`ServiceCall`], which dispatches in process when the service is
//! local and otherwise routes to a registered instance over a cached
//! connection.
//!
//! # Crates
//!
//! - [`common`]: message model, codecs, error taxonomy, transport SPI and the
//!   TCP transport
//! - [`router`]: service references, the registry and routing strategies
//! - [`server`]: service definitions, the local dispatcher and the server
//! - [`client`]: connection cache, service call and typed stubs
//!
//! # Example
//!
//! ```no_run
//! use meshrpc::{
//!     Address, CodecRegistry, LocalDispatcher, ServiceCall, ServiceDefinition, ServiceMethod,
//!     ServiceRegistry, ServiceServer, TcpClientTransport, TcpConfig,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let codecs = Arc::new(CodecRegistry::with_json());
//!
//! let dispatcher = LocalDispatcher::builder(codecs.clone())
//!     .service(ServiceDefinition::new("Greeting").request_response("hello", |name: String| async move {
//!         Ok(format!("Hello, {}", name))
//!     }))
//!     .build()?;
//! let server = ServiceServer::tcp(Arc::new(dispatcher), TcpConfig::default());
//! server.start(&Address::new("127.0.0.1", 4801)).await?;
//!
//! let registry = ServiceRegistry::new();
//! if let Some(endpoint) = server.endpoint("greeting-1") {
//!     registry.register_endpoint(endpoint);
//! }
//!
//! let call = ServiceCall::builder()
//!     .registry(registry)
//!     .transport(Arc::new(TcpClientTransport::new(TcpConfig::default(), codecs.clone())))
//!     .codecs(codecs)
//!     .build();
//!
//! let hello = ServiceMethod::<String, String>::request_response(call, "Greeting", "hello");
//! assert_eq!(hello.call("joe".to_string()).await?, "Hello, joe");
//! # Ok(())
//! # }
//! ```

pub use meshrpc_client as client;
pub use meshrpc_common as common;
pub use meshrpc_router as router;
pub use meshrpc_server as server;

pub use meshrpc_client::{ConnectionCache, MessageMethod, ServiceCall, ServiceCallBuilder, ServiceMethod};
pub use meshrpc_common::codec::{CodecRegistry, DataCodec, HeaderCodec, JsonCodec, MessageCodec, TextCodec};
pub use meshrpc_common::protocol::{
    CommunicationMode, ErrorKind, Message, MessageBuilder, MethodBinding, Payload, Result, ServiceError,
};
pub use meshrpc_common::transport::{
    Address, Channel, ClientTransport, Dispatch, MessageStream, ServerTransport, TcpClientTransport, TcpConfig,
    TcpServerTransport,
};
pub use meshrpc_router::{
    DiscoveryEvent, MethodInfo, RandomRouter, RegistrySnapshot, RoundRobinRouter, Router, ServiceEndpoint,
    ServiceReference, ServiceRegistration, ServiceRegistry, TagRouter, WeightedRouter,
};
pub use meshrpc_server::{DispatcherError, LocalDispatcher, LocalDispatcherBuilder, ServiceDefinition, ServiceServer};
