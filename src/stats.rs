//! Observability (spec.md §6): the upstream table, global counters, and a
//! bounded top-N ring of recent queries/response codes, exposed as plain
//! Rust APIs rather than wired to a console transport (the console itself
//! is out of scope — see spec.md §1).
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::CacheStats;
use crate::upstream::UpstreamRegistry;

/// Error-kind dispositions from spec.md §7, each a named counter.
#[derive(Default)]
pub struct GlobalCounters {
    pub dns_parse_error: AtomicU64,
    pub acl_drop: AtomicU64,
    pub rate_limited: AtomicU64,
    pub no_upstream: AtomicU64,
    pub spurious_responses: AtomicU64,
    pub rule_drop: AtomicU64,
}

impl GlobalCounters {
    pub fn snapshot(&self) -> GlobalCountersSnapshot {
        GlobalCountersSnapshot {
            dns_parse_error: self.dns_parse_error.load(Ordering::Relaxed),
            acl_drop: self.acl_drop.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            no_upstream: self.no_upstream.load(Ordering::Relaxed),
            spurious_responses: self.spurious_responses.load(Ordering::Relaxed),
            rule_drop: self.rule_drop.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GlobalCountersSnapshot {
    pub dns_parse_error: u64,
    pub acl_drop: u64,
    pub rate_limited: u64,
    pub no_upstream: u64,
    pub spurious_responses: u64,
    pub rule_drop: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRow {
    pub addr: String,
    pub status: &'static str,
    pub qps: u64,
    pub qlim: Option<f64>,
    pub order: i32,
    pub weight: u64,
    pub queries: u64,
    pub drops: u64,
    pub drop_rate: f64,
    pub latency_ms: f64,
    pub pools: Vec<String>,
}

/// Bounded ring of recent (qname, rcode) observations, trimmable to the
/// N most frequent labels on demand.
pub struct TopN {
    capacity: usize,
    queries: Mutex<Vec<String>>,
    rcodes: Mutex<Vec<u8>>,
}

impl TopN {
    pub fn new(capacity: usize) -> Self {
        TopN {
            capacity,
            queries: Mutex::new(Vec::with_capacity(capacity)),
            rcodes: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn record(&self, qname: String, rcode: u8) {
        push_bounded(&mut self.queries.lock(), qname, self.capacity);
        push_bounded(&mut self.rcodes.lock(), rcode, self.capacity);
    }

    /// The `n` most frequent entries among the retained queries.
    pub fn top_queries(&self, n: usize) -> Vec<(String, usize)> {
        top_n(&self.queries.lock(), n)
    }

    pub fn top_rcodes(&self, n: usize) -> Vec<(u8, usize)> {
        top_n(&self.rcodes.lock(), n)
    }
}

fn push_bounded<T>(ring: &mut Vec<T>, item: T, capacity: usize) {
    if ring.len() >= capacity {
        ring.remove(0);
    }
    ring.push(item);
}

fn top_n<T: Clone + Eq + std::hash::Hash>(items: &[T], n: usize) -> Vec<(T, usize)> {
    let mut counts: HashMap<T, usize> = HashMap::new();
    for item in items {
        *counts.entry(item.clone()).or_insert(0) += 1;
    }
    let mut ranked: Vec<(T, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.truncate(n);
    ranked
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub upstreams: Vec<UpstreamRow>,
    pub cache: CacheStats,
    pub counters: GlobalCountersSnapshot,
}

impl Serialize for CacheStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("CacheStats", 7)?;
        s.serialize_field("hits", &self.hits)?;
        s.serialize_field("misses", &self.misses)?;
        s.serialize_field("deferred_lookups", &self.deferred_lookups)?;
        s.serialize_field("deferred_inserts", &self.deferred_inserts)?;
        s.serialize_field("insert_collisions", &self.insert_collisions)?;
        s.serialize_field("lookup_collisions", &self.lookup_collisions)?;
        s.serialize_field("size", &self.size)?;
        s.end()
    }
}

pub struct Stats {
    pub counters: GlobalCounters,
    pub top_n: TopN,
}

impl Stats {
    pub fn new(top_n_capacity: usize) -> Self {
        Stats {
            counters: GlobalCounters::default(),
            top_n: TopN::new(top_n_capacity),
        }
    }

    pub fn snapshot(&self, registry: &Arc<UpstreamRegistry>, cache: &crate::cache::PacketCache) -> StatsSnapshot {
        let upstreams = registry
            .snapshot()
            .iter()
            .map(|u| {
                let (qps_passed, qps_blocked) = u.qps_counts();
                let drops = u.send_errors() + u.sessions.reuse();
                let queries = u.queries();
                UpstreamRow {
                    addr: u.addr.to_string(),
                    status: if u.is_up() { "up" } else { "down" },
                    qps: qps_passed + qps_blocked,
                    qlim: u.qps_limit(),
                    order: u.order(),
                    weight: u.weight(),
                    queries,
                    drops,
                    drop_rate: if queries == 0 { 0.0 } else { drops as f64 / queries as f64 },
                    latency_ms: u.latency_us() / 1000.0,
                    pools: u.pools(),
                }
            })
            .collect();

        StatsSnapshot {
            upstreams,
            cache: cache.stats(),
            counters: self.counters.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PacketCache;
    use crate::upstream::{Upstream, UpstreamRegistry};
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    #[test]
    fn snapshot_reports_qlim_and_drop_rate() {
        let registry = Arc::new(UpstreamRegistry::new());
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 53));
        let upstream = Upstream::new(addr, 0);
        upstream.set_qps(Some(Arc::new(crate::ratelimit::RateLimiter::new(100.0, 100.0))));
        upstream.inc_outstanding();
        upstream.inc_outstanding();
        upstream.inc_send_errors();
        registry.add(upstream);

        let stats = Stats::new(16);
        let cache = PacketCache::new(16, 0, 3600);
        let snapshot = stats.snapshot(&registry, &cache);

        let row = &snapshot.upstreams[0];
        assert_eq!(row.qlim, Some(100.0));
        assert_eq!(row.drops, 1);
        assert_eq!(row.queries, 2);
        assert!((row.drop_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn top_n_ranks_by_frequency() {
        let top = TopN::new(10);
        top.record("a.example.".into(), 0);
        top.record("a.example.".into(), 0);
        top.record("b.example.".into(), 3);

        let queries = top.top_queries(1);
        assert_eq!(queries[0], ("a.example.".to_string(), 2));
    }

    #[test]
    fn ring_is_bounded() {
        let top = TopN::new(2);
        top.record("a.".into(), 0);
        top.record("b.".into(), 0);
        top.record("c.".into(), 0);
        assert_eq!(top.queries.lock().len(), 2);
    }
}
