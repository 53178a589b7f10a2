//! Upstream registry (spec.md §4.5, component C5): the ordered sequence
//! of configured upstream resolvers, published copy-on-write behind
//! `arc-swap` so the hot path never blocks on a mutation.
pub mod prober;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::ratelimit::RateLimiter;
use crate::session::SessionTracker;

const DEFAULT_RING_SIZE: usize = 1024;
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 5;

/// Administrative state. Under `Auto`, `up_status` is the prober's last
/// observation; `Up`/`Down` pin the upstream regardless of probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Up,
    Down,
    Auto,
}

pub struct Upstream {
    pub addr: SocketAddr,
    order: AtomicI32,
    weight: AtomicU64,
    pools: Mutex<Vec<String>>,
    availability: Mutex<Availability>,
    up_status: AtomicBool,
    qps: Mutex<Option<Arc<RateLimiter>>>,
    outstanding: AtomicU64,
    queries: AtomicU64,
    reuse: AtomicU64,
    send_errors: AtomicU64,
    /// microseconds, exponentially smoothed
    latency_us: Mutex<f64>,
    /// Owned here rather than by the responder thread directly, since the
    /// thread only ever holds a shared reference to its `Arc<Upstream>`
    /// (spec.md §5: "the I/O thread obtains mutation access through a
    /// per-upstream lock").
    pub sessions: SessionTracker,
}

const LATENCY_EWMA_ALPHA: f64 = 0.2;

impl Upstream {
    pub fn new(addr: SocketAddr, order: i32) -> Self {
        Self::with_session_ring(addr, order, DEFAULT_RING_SIZE, DEFAULT_SESSION_TIMEOUT_SECS)
    }

    pub fn with_session_ring(addr: SocketAddr, order: i32, ring_size: usize, session_timeout: u64) -> Self {
        Upstream {
            addr,
            order: AtomicI32::new(order),
            weight: AtomicU64::new(1),
            pools: Mutex::new(Vec::new()),
            availability: Mutex::new(Availability::Auto),
            up_status: AtomicBool::new(true),
            qps: Mutex::new(None),
            outstanding: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            reuse: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            latency_us: Mutex::new(0.0),
            sessions: SessionTracker::new(ring_size, session_timeout),
        }
    }

    pub fn order(&self) -> i32 {
        self.order.load(Ordering::Relaxed)
    }

    pub fn set_order_in_place(&self, order: i32) {
        self.order.store(order, Ordering::Relaxed);
    }

    pub fn weight(&self) -> u64 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u64) {
        self.weight.store(weight.max(1), Ordering::Relaxed);
    }

    pub fn pools(&self) -> Vec<String> {
        self.pools.lock().clone()
    }

    pub fn in_pool(&self, pool: &str) -> bool {
        self.pools.lock().iter().any(|p| p == pool)
    }

    pub fn add_pool(&self, pool: impl Into<String>) {
        let pool = pool.into();
        let mut pools = self.pools.lock();
        if !pools.iter().any(|p| *p == pool) {
            pools.push(pool);
        }
    }

    pub fn rm_pool(&self, pool: &str) {
        self.pools.lock().retain(|p| p != pool);
    }

    pub fn availability(&self) -> Availability {
        *self.availability.lock()
    }

    pub fn set_availability(&self, availability: Availability) {
        *self.availability.lock() = availability;
    }

    pub fn set_qps(&self, limiter: Option<Arc<RateLimiter>>) {
        *self.qps.lock() = limiter;
    }

    pub fn check_qps(&self, now: f64) -> bool {
        match self.qps.lock().as_ref() {
            Some(limiter) => limiter.check(now),
            None => true,
        }
    }

    /// The configured QPS limit (`qlim` in spec.md §6's observability
    /// table), or `None` if this upstream has no limiter configured.
    pub fn qps_limit(&self) -> Option<f64> {
        self.qps.lock().as_ref().map(|l| l.rate())
    }

    /// `(passed, blocked)` admission counts from this upstream's QPS
    /// limiter, or `(0, 0)` if none is configured.
    pub fn qps_counts(&self) -> (u64, u64) {
        match self.qps.lock().as_ref() {
            Some(l) => (l.passed(), l.blocked()),
            None => (0, 0),
        }
    }

    /// Whether the pipeline may currently route to this upstream.
    pub fn is_up(&self) -> bool {
        match self.availability() {
            Availability::Up => true,
            Availability::Down => false,
            Availability::Auto => self.up_status.load(Ordering::Relaxed),
        }
    }

    pub fn set_up_status(&self, up: bool) {
        self.up_status.store(up, Ordering::Relaxed);
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn inc_outstanding(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_outstanding(&self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn inc_reuse(&self) {
        self.reuse.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reuse(&self) -> u64 {
        self.reuse.load(Ordering::Relaxed)
    }

    pub fn inc_send_errors(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    pub fn latency_us(&self) -> f64 {
        *self.latency_us.lock()
    }

    pub fn record_latency(&self, sample_us: f64) {
        let mut latency = self.latency_us.lock();
        if *latency == 0.0 {
            *latency = sample_us;
        } else {
            *latency = *latency * (1.0 - LATENCY_EWMA_ALPHA) + sample_us * LATENCY_EWMA_ALPHA;
        }
    }
}

/// Copy-on-write, atomically published, order-sorted sequence of
/// upstreams. Mutation methods build and publish an entirely new `Vec`;
/// the hot path only ever calls [`UpstreamRegistry::snapshot`].
pub struct UpstreamRegistry {
    upstreams: ArcSwap<Vec<Arc<Upstream>>>,
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        UpstreamRegistry {
            upstreams: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Upstream>>> {
        self.upstreams.load_full()
    }

    pub fn add(&self, upstream: Upstream) {
        let upstream = Arc::new(upstream);
        self.mutate(|list| list.push(upstream.clone()));
    }

    pub fn remove(&self, addr: SocketAddr) {
        self.mutate(|list| list.retain(|u| u.addr != addr));
    }

    /// Re-sorting after an order change still republishes a fresh `Vec`
    /// (so readers mid-iteration over the old snapshot are unaffected),
    /// but the `Arc<Upstream>` entries themselves are reused — only their
    /// `order` field changes in place, preserving outstanding counts and
    /// in-flight correlation state.
    pub fn set_order(&self, addr: SocketAddr, order: i32) {
        let current = self.snapshot();
        if let Some(u) = current.iter().find(|u| u.addr == addr) {
            u.set_order_in_place(order);
        }
        self.publish((*current).clone());
    }

    fn mutate(&self, f: impl FnOnce(&mut Vec<Arc<Upstream>>)) {
        let mut list = (**self.snapshot()).clone();
        f(&mut list);
        self.publish(list);
    }

    fn publish(&self, mut list: Vec<Arc<Upstream>>) {
        list.sort_by_key(|u| u.order());
        self.upstreams.store(Arc::new(list));
    }
}

impl Default for UpstreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
