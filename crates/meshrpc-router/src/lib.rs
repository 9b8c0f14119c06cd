//! meshrpc Service Registry and Routing
//!
//! Tracks which endpoints serve which qualifiers and picks one for each call.
//!
//! # Components
//!
//! - [`ServiceEndpoint`] / [`ServiceReference`]: what discovery announces, and
//!   the per-method routing targets it expands into
//! - [`ServiceRegistry`]: copy-on-write directory fed by [`DiscoveryEvent`]s
//! - [`Router`]: selection strategy over a [`RegistrySnapshot`]
//!   - [`RoundRobinRouter`]: deterministic rotation per qualifier
//!   - [`RandomRouter`] / [`WeightedRouter`]: random, optionally by `weight` tag
//!   - [`TagRouter`]: exact tag filtering in front of another router

pub mod random;
pub mod reference;
pub mod registry;
pub mod round_robin;
pub mod router;
pub mod tag;

pub use random::{RandomRouter, WeightedRouter, WEIGHT_TAG};
pub use reference::{MethodInfo, ServiceEndpoint, ServiceReference, ServiceRegistration};
pub use registry::{DiscoveryEvent, RegistrySnapshot, ServiceRegistry};
pub use round_robin::RoundRobinRouter;
pub use router::Router;
pub use tag::{TagRouter, TAG_HEADER_PREFIX};
