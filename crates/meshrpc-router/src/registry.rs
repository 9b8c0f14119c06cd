use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::reference::{ServiceEndpoint, ServiceReference};

/// A change announced by service discovery.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A process became reachable. Re-announcing an id replaces the previous
    /// announcement.
    EndpointAdded(ServiceEndpoint),
    /// The endpoint with this id is gone.
    EndpointRemoved(String),
}

#[derive(Debug, Default)]
struct RegistryState {
    endpoints: Vec<ServiceEndpoint>,
    by_qualifier: HashMap<String, Vec<ServiceReference>>,
}

impl RegistryState {
    fn from_endpoints(endpoints: Vec<ServiceEndpoint>) -> Self {
        let mut by_qualifier: HashMap<String, Vec<ServiceReference>> = HashMap::new();
        for endpoint in &endpoints {
            for reference in endpoint.references() {
                by_qualifier
                    .entry(reference.qualifier().to_string())
                    .or_default()
                    .push(reference);
            }
        }
        Self {
            endpoints,
            by_qualifier,
        }
    }
}

/// An immutable view of the registry at one point in time.
///
/// Cheap to clone. Later registry updates never show through a snapshot.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    state: Arc<RegistryState>,
}

impl RegistrySnapshot {
    /// Builds a snapshot directly from endpoints, in the given order.
    pub fn from_endpoints(endpoints: Vec<ServiceEndpoint>) -> Self {
        Self {
            state: Arc::new(RegistryState::from_endpoints(endpoints)),
        }
    }

    /// Live references for a qualifier, in registration order.
    pub fn lookup(&self, qualifier: &str) -> &[ServiceReference] {
        self.state
            .by_qualifier
            .get(qualifier)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn endpoints(&self) -> &[ServiceEndpoint] {
        &self.state.endpoints
    }

    pub fn qualifiers(&self) -> impl Iterator<Item = &str> {
        self.state.by_qualifier.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.state.endpoints.is_empty()
    }
}

/// Directory of remote service instances, keyed by qualifier.
///
/// Writers rebuild the whole map and swap it in; readers take a
/// [`RegistrySnapshot`] and never see a half-applied update. Clones share
/// the same registry.
///
/// # Example
///
/// ```
/// use meshrpc_common::protocol::CommunicationMode;
/// use meshrpc_common::transport::Address;
/// use meshrpc_router::{MethodInfo, ServiceEndpoint, ServiceRegistration, ServiceRegistry};
///
/// let registry = ServiceRegistry::new();
/// registry.register_endpoint(
///     ServiceEndpoint::new("node-1", Address::new("127.0.0.1", 4801)).service(
///         ServiceRegistration::new("Greeting")
///             .method(MethodInfo::new("hello", CommunicationMode::RequestResponse)),
///     ),
/// );
///
/// assert_eq!(registry.lookup("Greeting/hello").len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    current: Arc<RwLock<RegistrySnapshot>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Adds an endpoint, replacing any endpoint with the same id in place.
    pub fn register_endpoint(&self, endpoint: ServiceEndpoint) {
        let id = endpoint.id.clone();
        let address = endpoint.address.clone();
        self.update(|endpoints| {
            match endpoints.iter_mut().find(|e| e.id == endpoint.id) {
                Some(existing) => *existing = endpoint,
                None => endpoints.push(endpoint),
            }
            true
        });
        info!(endpoint = %id, %address, "Endpoint registered");
    }

    /// Removes an endpoint. Returns whether it was present.
    pub fn unregister_endpoint(&self, id: &str) -> bool {
        let removed = self.update(|endpoints| {
            let before = endpoints.len();
            endpoints.retain(|e| e.id != id);
            endpoints.len() != before
        });
        if removed {
            info!(endpoint = %id, "Endpoint unregistered");
        }
        removed
    }

    pub fn apply(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::EndpointAdded(endpoint) => self.register_endpoint(endpoint),
            DiscoveryEvent::EndpointRemoved(id) => {
                self.unregister_endpoint(&id);
            }
        }
    }

    pub fn lookup(&self, qualifier: &str) -> Vec<ServiceReference> {
        self.snapshot().lookup(qualifier).to_vec()
    }

    pub fn endpoints(&self) -> Vec<ServiceEndpoint> {
        self.snapshot().endpoints().to_vec()
    }

    /// Applies discovery events from `events` until every sender is dropped.
    pub fn listen(&self, mut events: mpsc::Receiver<DiscoveryEvent>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                registry.apply(event);
            }
            debug!("Discovery event stream ended");
        })
    }

    /// Rebuilds the snapshot under the write lock if `change` reports a
    /// modification.
    fn update(&self, change: impl FnOnce(&mut Vec<ServiceEndpoint>) -> bool) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut endpoints = current.endpoints().to_vec();
        if !change(&mut endpoints) {
            return false;
        }
        *current = RegistrySnapshot::from_endpoints(endpoints);
        true
    }
}
