//! Selection policies (spec.md §4.6, component C6): pure functions from a
//! pre-filtered candidate subsequence to a chosen upstream.
//!
//! The "externally implemented policy addressed by name" extension point
//! from spec.md §9 — replacing the original's embedded-scripting callable
//! policies — is `PolicyRegistry`, a name table of boxed closures with the
//! four built-ins pre-registered.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::upstream::Upstream;

/// Per-query context a policy may read. Built-ins ignore it; it exists so
/// externally registered policies can make name/type-aware choices.
#[derive(Debug, Clone, Copy)]
pub struct QueryMetadata<'a> {
    pub qname: &'a [u8],
    pub qtype: u16,
}

pub fn first_available(candidates: &[Arc<Upstream>], _meta: &QueryMetadata) -> Option<Arc<Upstream>> {
    candidates.first().cloned()
}

/// Round-robin state is owned by the policy, not by any upstream.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn select(&self, candidates: &[Arc<Upstream>], _meta: &QueryMetadata) -> Option<Arc<Upstream>> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(idx).cloned()
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

pub fn weighted_random(candidates: &[Arc<Upstream>], _meta: &QueryMetadata) -> Option<Arc<Upstream>> {
    let total: u64 = candidates.iter().map(|u| u.weight()).sum();
    if total == 0 {
        return None;
    }
    let r: u64 = rand::thread_rng().gen_range(0..total);
    let mut cumulative = 0u64;
    for candidate in candidates {
        cumulative += candidate.weight();
        if cumulative > r {
            return Some(candidate.clone());
        }
    }
    candidates.last().cloned()
}

/// Minimizes `(outstanding, order, position)` lexicographically — position
/// is the candidate's index in the slice, which already reflects config
/// order followed by registration order since that's how the registry
/// publishes its snapshot.
pub fn least_outstanding(candidates: &[Arc<Upstream>], _meta: &QueryMetadata) -> Option<Arc<Upstream>> {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(pos, u)| (u.outstanding(), u.order(), *pos))
        .map(|(_, u)| u.clone())
}

type BoxedPolicy = Box<dyn Fn(&[Arc<Upstream>], &QueryMetadata) -> Option<Arc<Upstream>> + Send + Sync>;

/// Name table of selection policies. The four built-ins are pre-registered
/// under their spec.md names; callers may register additional ones.
pub struct PolicyRegistry {
    policies: HashMap<String, BoxedPolicy>,
}

impl PolicyRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = PolicyRegistry {
            policies: HashMap::new(),
        };
        registry.register("firstAvailable", Box::new(first_available));
        let round_robin = Arc::new(RoundRobin::new());
        registry.register(
            "roundRobin",
            Box::new(move |candidates, meta| round_robin.select(candidates, meta)),
        );
        registry.register("wrandom", Box::new(weighted_random));
        registry.register("leastOutstanding", Box::new(least_outstanding));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, policy: BoxedPolicy) {
        self.policies.insert(name.into(), policy);
    }

    pub fn select(&self, name: &str, candidates: &[Arc<Upstream>], meta: &QueryMetadata) -> Option<Arc<Upstream>> {
        self.policies.get(name).and_then(|policy| policy(candidates, meta))
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    fn meta() -> QueryMetadata<'static> {
        QueryMetadata {
            qname: b"\x07example\x03com\x00",
            qtype: 1,
        }
    }

    #[test]
    fn first_available_returns_first_candidate() {
        let candidates = vec![Arc::new(Upstream::new(addr(1), 0)), Arc::new(Upstream::new(addr(2), 0))];
        let chosen = first_available(&candidates, &meta()).unwrap();
        assert_eq!(chosen.addr, addr(1));
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let candidates = vec![Arc::new(Upstream::new(addr(1), 0)), Arc::new(Upstream::new(addr(2), 0))];
        let rr = RoundRobin::new();
        let first = rr.select(&candidates, &meta()).unwrap();
        let second = rr.select(&candidates, &meta()).unwrap();
        let third = rr.select(&candidates, &meta()).unwrap();
        assert_eq!(first.addr, addr(1));
        assert_eq!(second.addr, addr(2));
        assert_eq!(third.addr, addr(1));
    }

    #[test]
    fn weighted_random_is_biased_towards_heavier_upstream() {
        let light = Arc::new(Upstream::new(addr(1), 0));
        light.set_weight(1);
        let heavy = Arc::new(Upstream::new(addr(2), 0));
        heavy.set_weight(3);
        let candidates = vec![light.clone(), heavy.clone()];

        let mut heavy_hits = 0;
        for _ in 0..10_000 {
            if weighted_random(&candidates, &meta()).unwrap().addr == heavy.addr {
                heavy_hits += 1;
            }
        }
        let frequency = heavy_hits as f64 / 10_000.0;
        assert!((frequency - 0.75).abs() < 0.02, "frequency was {}", frequency);
    }

    #[test]
    fn least_outstanding_ties_break_on_order_then_position() {
        let a = Arc::new(Upstream::new(addr(1), 10));
        let b = Arc::new(Upstream::new(addr(2), 20));
        let c = Arc::new(Upstream::new(addr(3), 15));
        a.inc_outstanding();
        a.inc_outstanding();
        a.inc_outstanding();
        a.inc_outstanding();
        a.inc_outstanding();
        b.inc_outstanding();
        b.inc_outstanding();
        c.inc_outstanding();
        c.inc_outstanding();
        let candidates = vec![a, b, c];

        let chosen = least_outstanding(&candidates, &meta()).unwrap();
        assert_eq!(chosen.addr, addr(3));
    }

    #[test]
    fn registry_resolves_builtins_by_name() {
        let registry = PolicyRegistry::with_builtins();
        let candidates = vec![Arc::new(Upstream::new(addr(1), 0))];
        assert!(registry.select("firstAvailable", &candidates, &meta()).is_some());
        assert!(registry.select("unknownPolicy", &candidates, &meta()).is_none());
    }
}
