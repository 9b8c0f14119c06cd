use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use meshrpc_common::protocol::{qualifier, CommunicationMode};
use meshrpc_common::transport::Address;
use serde::{Deserialize, Serialize};

/// A resolved routing target: one method on one endpoint.
///
/// Tags are merged from the endpoint, the service and the method, the more
/// specific level winning. Two references are equal when they name the same
/// endpoint and qualifier.
#[derive(Debug, Clone)]
pub struct ServiceReference {
    endpoint_id: String,
    address: Address,
    namespace: String,
    action: String,
    qualifier: String,
    mode: CommunicationMode,
    tags: HashMap<String, String>,
}

impl ServiceReference {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn mode(&self) -> CommunicationMode {
        self.mode
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint_id == other.endpoint_id && self.qualifier == other.qualifier
    }
}

impl Eq for ServiceReference {}

impl Hash for ServiceReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint_id.hash(state);
        self.qualifier.hash(state);
    }
}

/// One method exposed by a registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub action: String,
    pub mode: CommunicationMode,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl MethodInfo {
    pub fn new(action: impl Into<String>, mode: CommunicationMode) -> Self {
        Self {
            action: action.into(),
            mode,
            tags: HashMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A service namespace and the methods it exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub namespace: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub methods: Vec<MethodInfo>,
}

impl ServiceRegistration {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tags: HashMap::new(),
            methods: Vec::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn method(mut self, method: MethodInfo) -> Self {
        self.methods.push(method);
        self
    }
}

/// What discovery announces about a reachable process.
///
/// # Example
///
/// ```
/// use meshrpc_common::protocol::CommunicationMode;
/// use meshrpc_common::transport::Address;
/// use meshrpc_router::{MethodInfo, ServiceEndpoint, ServiceRegistration};
///
/// let endpoint = ServiceEndpoint::new("node-1", Address::new("127.0.0.1", 4801))
///     .tag("region", "eu")
///     .service(
///         ServiceRegistration::new("Greeting")
///             .method(MethodInfo::new("hello", CommunicationMode::RequestResponse)),
///     );
///
/// let refs = endpoint.references();
/// assert_eq!(refs[0].qualifier(), "Greeting/hello");
/// assert_eq!(refs[0].tag("region"), Some("eu"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub id: String,
    pub address: Address,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub services: Vec<ServiceRegistration>,
}

impl ServiceEndpoint {
    pub fn new(id: impl Into<String>, address: Address) -> Self {
        Self {
            id: id.into(),
            address,
            tags: HashMap::new(),
            services: Vec::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn service(mut self, service: ServiceRegistration) -> Self {
        self.services.push(service);
        self
    }

    pub fn services(mut self, services: impl IntoIterator<Item = ServiceRegistration>) -> Self {
        self.services.extend(services);
        self
    }

    /// Expands the endpoint into one reference per exposed method, in
    /// declaration order.
    pub fn references(&self) -> Vec<ServiceReference> {
        let mut refs = Vec::new();
        for service in &self.services {
            for method in &service.methods {
                let mut tags = self.tags.clone();
                tags.extend(service.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
                tags.extend(method.tags.iter().map(|(k, v)| (k.clone(), v.clone())));

                refs.push(ServiceReference {
                    endpoint_id: self.id.clone(),
                    address: self.address.clone(),
                    namespace: service.namespace.clone(),
                    action: method.action.clone(),
                    qualifier: qualifier(&service.namespace, &method.action),
                    mode: method.mode,
                    tags,
                });
            }
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn endpoint() -> ServiceEndpoint {
        ServiceEndpoint::new("node-1", Address::new("10.0.0.1", 4801))
            .tag("region", "eu")
            .tag("zone", "a")
            .service(
                ServiceRegistration::new("Greeting")
                    .tag("zone", "b")
                    .method(MethodInfo::new("hello", CommunicationMode::RequestResponse))
                    .method(
                        MethodInfo::new("many", CommunicationMode::RequestStream).tag("zone", "c"),
                    ),
            )
    }

    #[test]
    fn test_references_per_method() {
        let refs = endpoint().references();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].qualifier(), "Greeting/hello");
        assert_eq!(refs[0].namespace(), "Greeting");
        assert_eq!(refs[0].action(), "hello");
        assert_eq!(refs[0].mode(), CommunicationMode::RequestResponse);
        assert_eq!(refs[1].qualifier(), "Greeting/many");
        assert_eq!(refs[1].address(), &Address::new("10.0.0.1", 4801));
    }

    #[test]
    fn test_tag_precedence() {
        let refs = endpoint().references();
        assert_eq!(refs[0].tag("region"), Some("eu"));
        // service overrides endpoint
        assert_eq!(refs[0].tag("zone"), Some("b"));
        // method overrides service
        assert_eq!(refs[1].tag("zone"), Some("c"));
    }

    #[test]
    fn test_equality_ignores_tags() {
        let a = endpoint().references().remove(0);
        let b = ServiceEndpoint::new("node-1", Address::new("10.0.0.9", 1))
            .service(
                ServiceRegistration::new("Greeting")
                    .method(MethodInfo::new("hello", CommunicationMode::RequestResponse)),
            )
            .references()
            .remove(0);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_endpoint_json() {
        let json = serde_json::json!({
            "id": "node-2",
            "address": {"host": "127.0.0.1", "port": 9000},
            "services": [{
                "namespace": "Echo",
                "methods": [{"action": "say", "mode": "request_response"}]
            }]
        });
        let endpoint: ServiceEndpoint = serde_json::from_value(json).unwrap();
        assert!(endpoint.tags.is_empty());
        assert_eq!(endpoint.references()[0].qualifier(), "Echo/say");
    }
}
