use std::collections::HashMap;
use std::sync::Arc;

use meshrpc_common::protocol::Message;

use crate::reference::ServiceReference;
use crate::registry::RegistrySnapshot;
use crate::round_robin::RoundRobinRouter;
use crate::router::Router;

/// Request headers with this prefix add a required tag for one call.
pub const TAG_HEADER_PREFIX: &str = "tag.";

/// Filters candidates by exact tag equality, then delegates to an inner
/// router.
///
/// Required tags come from the router's own configuration and from request
/// headers named `tag.<key>`; a header overrides a configured value.
///
/// # Example
///
/// ```
/// use meshrpc_router::{RandomRouter, TagRouter};
/// use std::sync::Arc;
///
/// let router = TagRouter::new()
///     .tag("region", "eu")
///     .with_inner(Arc::new(RandomRouter::new()));
/// ```
pub struct TagRouter {
    tags: HashMap<String, String>,
    inner: Arc<dyn Router>,
}

impl Default for TagRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TagRouter {
    pub fn new() -> Self {
        Self {
            tags: HashMap::new(),
            inner: Arc::new(RoundRobinRouter::new()),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_inner(mut self, inner: Arc<dyn Router>) -> Self {
        self.inner = inner;
        self
    }

    fn required_tags<'a>(&'a self, message: &'a Message) -> HashMap<&'a str, &'a str> {
        let mut required: HashMap<&str, &str> = self
            .tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for (key, value) in message.headers() {
            if let Some(tag) = key.strip_prefix(TAG_HEADER_PREFIX) {
                required.insert(tag, value.as_str());
            }
        }
        required
    }

    fn filter(&self, message: &Message, candidates: &[ServiceReference]) -> Vec<ServiceReference> {
        let required = self.required_tags(message);
        candidates
            .iter()
            .filter(|r| required.iter().all(|(k, v)| r.tag(k) == Some(*v)))
            .cloned()
            .collect()
    }
}

impl Router for TagRouter {
    fn select(&self, message: &Message, candidates: &[ServiceReference]) -> Option<ServiceReference> {
        let matching = self.filter(message, candidates);
        self.inner.select(message, &matching)
    }

    fn routes(&self, snapshot: &RegistrySnapshot, message: &Message) -> Vec<ServiceReference> {
        self.filter(message, snapshot.lookup(message.qualifier()))
    }
}
