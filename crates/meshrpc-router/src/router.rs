use meshrpc_common::protocol::Message;

use crate::reference::ServiceReference;
use crate::registry::RegistrySnapshot;

/// Chooses which instance serves a message.
///
/// Routers are pure with respect to the registry: they read a snapshot and
/// never modify it. Strategies only implement [`select`](Router::select);
/// `route` and `routes` look the candidates up by the message qualifier.
pub trait Router: Send + Sync {
    /// Picks one of `candidates`, or `None` if none is acceptable.
    fn select(&self, message: &Message, candidates: &[ServiceReference]) -> Option<ServiceReference>;

    fn route(&self, snapshot: &RegistrySnapshot, message: &Message) -> Option<ServiceReference> {
        self.select(message, snapshot.lookup(message.qualifier()))
    }

    /// Every acceptable instance for the message.
    fn routes(&self, snapshot: &RegistrySnapshot, message: &Message) -> Vec<ServiceReference> {
        snapshot.lookup(message.qualifier()).to_vec()
    }
}
