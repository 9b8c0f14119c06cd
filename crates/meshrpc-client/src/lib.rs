//! meshrpc Client
//!
//! Everything a caller needs to reach a service, wherever it runs:
//!
//! - [`ServiceCall`]: local bypass, routing, connection reuse and the four
//!   communication modes
//! - [`ConnectionCache`]: one shared connection per remote address
//! - [`ServiceMethod`] / [`MessageMethod`]: typed and raw per-method stubs

pub mod cache;
pub mod proxy;
pub mod service_call;

pub use cache::ConnectionCache;
pub use proxy::{MessageMethod, ServiceMethod};
pub use service_call::{ServiceCall, ServiceCallBuilder};
