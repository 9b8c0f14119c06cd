use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use meshrpc_common::protocol::Message;

use crate::reference::ServiceReference;
use crate::router::Router;

/// Round-robin router
///
/// Keeps one counter per qualifier and cycles over the candidates in
/// registration order.
#[derive(Debug, Default)]
pub struct RoundRobinRouter {
    counters: DashMap<String, AtomicUsize>,
}

impl RoundRobinRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_index(&self, qualifier: &str) -> usize {
        if let Some(counter) = self.counters.get(qualifier) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(qualifier.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl Router for RoundRobinRouter {
    fn select(&self, message: &Message, candidates: &[ServiceReference]) -> Option<ServiceReference> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next_index(message.qualifier()) % candidates.len();
        candidates.get(index).cloned()
    }
}
