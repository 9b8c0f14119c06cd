use std::sync::{Mutex, PoisonError};

use meshrpc_common::protocol::Message;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::reference::ServiceReference;
use crate::router::Router;

/// Tag holding an instance's relative weight.
pub const WEIGHT_TAG: &str = "weight";

/// Uniform random router.
#[derive(Debug, Default)]
pub struct RandomRouter;

impl RandomRouter {
    pub fn new() -> Self {
        Self
    }
}

impl Router for RandomRouter {
    fn select(&self, _message: &Message, candidates: &[ServiceReference]) -> Option<ServiceReference> {
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Weighted random router.
///
/// Reads each instance's weight from the [`WEIGHT_TAG`] tag. A missing or
/// unparsable weight counts as 1.0; zero or negative weights are never
/// chosen.
#[derive(Debug)]
pub struct WeightedRouter {
    rng: Mutex<StdRng>,
}

impl Default for WeightedRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedRouter {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic router for reproducible selection.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn weight(reference: &ServiceReference) -> f64 {
        match reference.tag(WEIGHT_TAG).map(str::parse::<f64>) {
            Some(Ok(w)) if w.is_finite() => w.max(0.0),
            Some(Ok(_)) => 0.0,
            Some(Err(_)) | None => 1.0,
        }
    }
}

impl Router for WeightedRouter {
    fn select(&self, _message: &Message, candidates: &[ServiceReference]) -> Option<ServiceReference> {
        let weights: Vec<f64> = candidates.iter().map(Self::weight).collect();
        let max = weights.iter().cloned().fold(0.0, f64::max);
        if max <= 0.0 {
            return None;
        }
        // Scale to the largest weight so the sum stays finite
        let weights: Vec<f64> = weights.into_iter().map(|w| w / max).collect();
        let total: f64 = weights.iter().sum();

        let mut point = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0.0..total);

        let mut last_eligible = None;
        for (reference, weight) in candidates.iter().zip(weights) {
            if weight <= 0.0 {
                continue;
            }
            if point < weight {
                return Some(reference.clone());
            }
            point -= weight;
            last_eligible = Some(reference);
        }

        // Rounding can leave a sliver past the last bucket
        last_eligible.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{MethodInfo, ServiceEndpoint, ServiceRegistration};
    use meshrpc_common::protocol::CommunicationMode;
    use meshrpc_common::transport::Address;
    use std::collections::HashMap;

    fn candidates(weights: &[(&str, Option<&str>)]) -> Vec<ServiceReference> {
        weights
            .iter()
            .flat_map(|(id, weight)| {
                let mut endpoint = ServiceEndpoint::new(*id, Address::new("127.0.0.1", 1));
                if let Some(w) = weight {
                    endpoint = endpoint.tag(WEIGHT_TAG, *w);
                }
                endpoint
                    .service(
                        ServiceRegistration::new("Greeting")
                            .method(MethodInfo::new("hello", CommunicationMode::RequestResponse)),
                    )
                    .references()
            })
            .collect()
    }

    fn hello() -> Message {
        Message::builder().qualifier("Greeting/hello").build()
    }

    #[test]
    fn test_random_empty() {
        assert!(RandomRouter::new().select(&hello(), &[]).is_none());
    }

    #[test]
    fn test_random_picks_candidate() {
        let refs = candidates(&[("a", None), ("b", None)]);
        let router = RandomRouter::new();
        for _ in 0..20 {
            let picked = router.select(&hello(), &refs).unwrap();
            assert!(refs.contains(&picked));
        }
    }

    #[test]
    fn test_weight_zero_never_chosen() {
        let refs = candidates(&[("a", Some("0")), ("b", Some("1")), ("c", Some("0.0"))]);
        let router = WeightedRouter::with_seed(7);
        for _ in 0..200 {
            assert_eq!(router.select(&hello(), &refs).unwrap().endpoint_id(), "b");
        }
    }

    #[test]
    fn test_all_zero_is_none() {
        let refs = candidates(&[("a", Some("0")), ("b", Some("-3"))]);
        assert!(WeightedRouter::with_seed(1).select(&hello(), &refs).is_none());
    }

    #[test]
    fn test_missing_or_bad_weight_defaults_to_one() {
        let refs = candidates(&[("a", None), ("b", Some("heavy"))]);
        assert_eq!(WeightedRouter::weight(&refs[0]), 1.0);
        assert_eq!(WeightedRouter::weight(&refs[1]), 1.0);
    }

    #[test]
    fn test_weights_bias_selection() {
        let refs = candidates(&[("light", Some("1")), ("heavy", Some("9"))]);
        let router = WeightedRouter::with_seed(42);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..1000 {
            let picked = router.select(&hello(), &refs).unwrap();
            *counts.entry(picked.endpoint_id().to_string()).or_default() += 1;
        }
        assert!(counts["heavy"] > counts["light"] * 3);
    }

    #[test]
    fn test_huge_weights_still_select() {
        let refs = candidates(&[("a", Some("1e308")), ("b", Some("1e308")), ("c", Some("0"))]);
        let router = WeightedRouter::with_seed(3);
        for _ in 0..50 {
            let picked = router.select(&hello(), &refs).unwrap();
            assert_ne!(picked.endpoint_id(), "c");
        }
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let refs = candidates(&[("a", Some("1")), ("b", Some("2")), ("c", Some("3"))]);
        let first = WeightedRouter::with_seed(99);
        let second = WeightedRouter::with_seed(99);
        for _ in 0..50 {
            assert_eq!(first.select(&hello(), &refs), second.select(&hello(), &refs));
        }
    }
}
