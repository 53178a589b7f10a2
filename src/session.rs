//! Upstream session tracker (spec.md §4.7, component C7): a per-upstream
//! ring of outstanding correlations, binding an upstream-side DNS ID back
//! to its originating client.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::upstream::Upstream;

#[derive(Debug, Clone, Copy)]
struct Slot {
    client_addr: SocketAddr,
    original_id: u16,
    fingerprint: u32,
    inserted_at: u64,
}

/// What a response's matched slot yields back to the reply emitter.
#[derive(Debug, Clone, Copy)]
pub struct Correlation {
    pub client_addr: SocketAddr,
    pub original_id: u16,
    pub fingerprint: u32,
    pub latency: u64,
}

pub struct SessionTracker {
    ring: Mutex<Vec<Option<Slot>>>,
    head: AtomicUsize,
    timeout: u64,
    reuse: AtomicU64,
    spurious: AtomicU64,
}

impl SessionTracker {
    /// `size` must be a power of two (spec.md §4.7); `timeout` is in
    /// seconds.
    pub fn new(size: usize, timeout: u64) -> Self {
        assert!(size.is_power_of_two(), "session ring size must be a power of two");
        SessionTracker {
            ring: Mutex::new(vec![None; size]),
            head: AtomicUsize::new(0),
            timeout,
            reuse: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
        }
    }

    /// Allocates a slot for an outgoing query, returning the rewritten
    /// upstream-side DNS ID (the slot index). If the chosen slot is
    /// already occupied, the previous occupant's upstream outstanding
    /// count is decremented and, if it had not yet timed out, `reuse` is
    /// bumped — the ring is a bounded window, not a guaranteed queue.
    pub fn allocate(
        &self,
        client_addr: SocketAddr,
        original_id: u16,
        fingerprint: u32,
        now: u64,
        upstream: &Upstream,
    ) -> u16 {
        let mut ring = self.ring.lock();
        let n = ring.len();
        let idx = self.head.fetch_add(1, Ordering::Relaxed) % n;

        if let Some(prev) = ring[idx].take() {
            if prev.inserted_at + self.timeout > now {
                self.reuse.fetch_add(1, Ordering::Relaxed);
                upstream.inc_reuse();
            }
            upstream.dec_outstanding();
        }

        ring[idx] = Some(Slot {
            client_addr,
            original_id,
            fingerprint,
            inserted_at: now,
        });
        drop(ring);

        upstream.inc_outstanding();
        idx as u16
    }

    /// Resolves an incoming response's upstream-side ID back to its
    /// originating client. Returns `None` (and counts `spurious`) if the
    /// slot is empty or out of range — a late or post-wrap response.
    pub fn complete(&self, slot_idx: u16, now: u64, upstream: &Upstream) -> Option<Correlation> {
        let mut ring = self.ring.lock();
        let idx = slot_idx as usize;
        if idx >= ring.len() {
            self.spurious.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match ring[idx].take() {
            Some(slot) => {
                upstream.dec_outstanding();
                let latency = now.saturating_sub(slot.inserted_at);
                upstream.record_latency((latency * 1_000_000) as f64);
                Some(Correlation {
                    client_addr: slot.client_addr,
                    original_id: slot.original_id,
                    fingerprint: slot.fingerprint,
                    latency,
                })
            }
            None => {
                self.spurious.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn reuse(&self) -> u64 {
        self.reuse.load(Ordering::Relaxed)
    }

    pub fn spurious(&self) -> u64 {
        self.spurious.load(Ordering::Relaxed)
    }

    pub fn ring_size(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn client() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 5353))
    }

    fn upstream() -> Upstream {
        Upstream::new(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 53)), 0)
    }

    #[test]
    fn complete_restores_client_and_decrements_outstanding() {
        let tracker = SessionTracker::new(4, 30);
        let up = upstream();
        let idx = tracker.allocate(client(), 0x1234, 0xDEAD, 0, &up);
        assert_eq!(up.outstanding(), 1);

        let correlation = tracker.complete(idx, 1, &up).unwrap();
        assert_eq!(correlation.client_addr, client());
        assert_eq!(correlation.original_id, 0x1234);
        assert_eq!(correlation.fingerprint, 0xDEAD);
        assert_eq!(up.outstanding(), 0);
    }

    #[test]
    fn spurious_response_is_dropped() {
        let tracker = SessionTracker::new(4, 30);
        let up = upstream();
        assert!(tracker.complete(2, 0, &up).is_none());
        assert_eq!(tracker.spurious(), 1);
    }

    #[test]
    fn ring_wrap_reclaims_and_counts_reuse() {
        let tracker = SessionTracker::new(4, 30);
        let up = upstream();
        for _ in 0..4 {
            tracker.allocate(client(), 0, 0, 0, &up);
        }
        // the 5th allocation wraps back onto slot 0, still well within
        // the 30s timeout, so it must count as one reuse
        tracker.allocate(client(), 0, 0, 0, &up);
        assert_eq!(tracker.reuse(), 1);
        assert_eq!(up.reuse(), 1);
    }

    #[test]
    fn double_complete_on_same_slot_is_spurious() {
        let tracker = SessionTracker::new(4, 30);
        let up = upstream();
        let idx = tracker.allocate(client(), 0, 0, 0, &up);
        assert!(tracker.complete(idx, 1, &up).is_some());
        assert!(tracker.complete(idx, 2, &up).is_none());
        assert_eq!(tracker.spurious(), 1);
    }
}
