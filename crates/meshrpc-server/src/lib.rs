//! meshrpc Server
//!
//! Hosts services: typed handler registration, the local dispatch table and
//! binding it to a server transport.
//!
//! - [`ServiceDefinition`]: a namespace and its handlers, one registration
//!   method per communication mode
//! - [`LocalDispatcher`]: immutable qualifier to handler table implementing
//!   [`Dispatch`](meshrpc_common::transport::Dispatch)
//! - [`ServiceServer`]: serves a dispatcher on a
//!   [`ServerTransport`](meshrpc_common::transport::ServerTransport)

pub mod dispatcher;
pub mod server;
pub mod service;

pub use dispatcher::{DispatcherError, LocalDispatcher, LocalDispatcherBuilder};
pub use server::ServiceServer;
pub use service::ServiceDefinition;
