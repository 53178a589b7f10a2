//! Packet cache (spec.md §4.2, component C2): a fixed-capacity mapping
//! from query fingerprint to a previously observed, TTL-bounded response.
//!
//! Grounded directly on original_source/pdns/dnsdist-cache.cc's
//! `get`/`insert`/`purgeExpired`: the try-lock-and-degrade discipline
//! (readers miss rather than block, writers abandon an insert rather than
//! block a reader), the "reserve(maxEntries + 1)" pre-sizing, the "keep
//! existing unless expired or supplanted by a longer validity" collision
//! rule, translated from pthread try-rwlock to
//! `parking_lot::RwLock::try_read`/`try_write`.
pub mod entry;
pub mod fingerprint;

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{BigEndian, ByteOrder};
use parking_lot::RwLock;

use crate::error::CodecError;
use crate::wire::header::{self, HEADER_LEN};
use crate::wire::rr::{self, TYPE_OPT};

pub use entry::{CacheEntry, Identity};

/// Outcome of a `lookup` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupOutcome {
    pub hit: bool,
    pub fingerprint: u32,
    pub resp_len: usize,
}

impl LookupOutcome {
    fn miss(fingerprint: u32) -> Self {
        LookupOutcome {
            hit: false,
            fingerprint,
            resp_len: 0,
        }
    }
}

/// Outcome of an `insert` call, for callers that want to distinguish
/// deferred-due-to-contention from a genuine collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    KeptExisting,
    Deferred,
    Collision,
    Rejected,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    deferred_lookups: AtomicU64,
    deferred_inserts: AtomicU64,
    insert_collisions: AtomicU64,
    lookup_collisions: AtomicU64,
}

/// A snapshot of the global counters spec.md §6 says the console observes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub deferred_lookups: u64,
    pub deferred_inserts: u64,
    pub insert_collisions: u64,
    pub lookup_collisions: u64,
    pub size: usize,
}

pub struct PacketCache {
    entries: RwLock<HashMap<u32, CacheEntry>>,
    capacity: usize,
    min_ttl: u32,
    max_ttl: u32,
    counters: Counters,
}

impl PacketCache {
    pub fn new(capacity: usize, min_ttl: u32, max_ttl: u32) -> Self {
        PacketCache {
            entries: RwLock::new(HashMap::with_capacity(capacity + 1)),
            capacity,
            min_ttl,
            max_ttl,
            counters: Counters::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            deferred_lookups: self.counters.deferred_lookups.load(Ordering::Relaxed),
            deferred_inserts: self.counters.deferred_inserts.load(Ordering::Relaxed),
            insert_collisions: self.counters.insert_collisions.load(Ordering::Relaxed),
            lookup_collisions: self.counters.lookup_collisions.load(Ordering::Relaxed),
            size: self.len(),
        }
    }

    /// spec.md §4.2 `lookup`. `query_bytes` is the full incoming query
    /// (used to recover the masked header flags and the caller's original-
    /// case QNAME bytes); `qname` is the already-lowercased QNAME used as
    /// fingerprint/identity input.
    #[allow(clippy::too_many_arguments)]
    pub fn lookup(
        &self,
        query_bytes: &[u8],
        qname: &[u8],
        qtype: u16,
        qclass: u16,
        qname_wire_len: usize,
        client_id: u16,
        resp_buf: &mut Vec<u8>,
        skip_aging: bool,
        now: u64,
    ) -> Result<LookupOutcome, CodecError> {
        let masked_flags = header::fingerprint_flags(query_bytes)?;
        let fp = fingerprint::compute(masked_flags, qname, qtype, qclass, None);

        let map = match self.entries.try_read() {
            Some(guard) => guard,
            None => {
                self.counters.deferred_lookups.fetch_add(1, Ordering::Relaxed);
                return Ok(LookupOutcome::miss(fp));
            }
        };

        let found = match map.get(&fp) {
            Some(e) => e,
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(LookupOutcome::miss(fp));
            }
        };

        if !found.is_live(now) {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(LookupOutcome::miss(fp));
        }

        if !found.identity.matches(qname, qtype, qclass) {
            self.counters.lookup_collisions.fetch_add(1, Ordering::Relaxed);
            return Ok(LookupOutcome::miss(fp));
        }

        resp_buf.clear();
        resp_buf.extend_from_slice(&found.response);
        let inserted_at = found.inserted_at;
        drop(map);

        if resp_buf.len() >= 2 {
            BigEndian::write_u16(&mut resp_buf[0..2], client_id);
        }

        if query_bytes.len() >= HEADER_LEN + qname_wire_len && resp_buf.len() >= HEADER_LEN + qname_wire_len {
            resp_buf[HEADER_LEN..HEADER_LEN + qname_wire_len]
                .copy_from_slice(&query_bytes[HEADER_LEN..HEADER_LEN + qname_wire_len]);
        }

        if !skip_aging {
            let age = now.saturating_sub(inserted_at);
            if age > 0 {
                age_ttls(resp_buf, age as u32)?;
            }
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        let resp_len = resp_buf.len();
        Ok(LookupOutcome {
            hit: true,
            fingerprint: fp,
            resp_len,
        })
    }

    /// spec.md §4.2 `insert`.
    pub fn insert(
        &self,
        fp: u32,
        qname: &[u8],
        qtype: u16,
        qclass: u16,
        response_bytes: &[u8],
        now: u64,
    ) -> InsertOutcome {
        if response_bytes.is_empty() {
            return InsertOutcome::Rejected;
        }

        let min_ttl = match rr::min_ttl(response_bytes) {
            Ok(t) => t,
            Err(_) => return InsertOutcome::Rejected,
        };
        let effective_ttl = min_ttl.min(self.max_ttl);
        if effective_ttl < self.min_ttl {
            return InsertOutcome::Rejected;
        }

        {
            let map = match self.entries.try_read() {
                Some(g) => g,
                None => {
                    self.counters.deferred_inserts.fetch_add(1, Ordering::Relaxed);
                    return InsertOutcome::Deferred;
                }
            };
            if map.len() >= self.capacity && !map.contains_key(&fp) {
                self.counters.deferred_inserts.fetch_add(1, Ordering::Relaxed);
                return InsertOutcome::Deferred;
            }
        }

        let mut map = match self.entries.try_write() {
            Some(g) => g,
            None => {
                self.counters.deferred_inserts.fetch_add(1, Ordering::Relaxed);
                return InsertOutcome::Deferred;
            }
        };

        let new_entry = CacheEntry {
            identity: Identity {
                qname: qname.to_vec(),
                qtype,
                qclass,
            },
            response: response_bytes.to_vec(),
            inserted_at: now,
            valid_until: now + effective_ttl as u64,
        };

        match map.entry(fp) {
            MapEntry::Vacant(v) => {
                v.insert(new_entry);
                InsertOutcome::Inserted
            }
            MapEntry::Occupied(mut o) => {
                let existing = o.get();
                let unexpired = existing.is_live(now);
                let differs = !existing.identity.matches(qname, qtype, qclass);
                if unexpired && differs {
                    self.counters.insert_collisions.fetch_add(1, Ordering::Relaxed);
                    return InsertOutcome::Collision;
                }
                if new_entry.valid_until <= existing.valid_until {
                    return InsertOutcome::KeptExisting;
                }
                o.insert(new_entry);
                InsertOutcome::Inserted
            }
        }
    }

    /// spec.md §4.2 `purge`: evict expired entries first, down to
    /// `target_size`. Takes a blocking exclusive lease — this is a
    /// maintenance-cadence call, not a hot-path one.
    pub fn purge(&self, target_size: usize, now: u64) -> usize {
        let mut map = self.entries.write();
        if map.len() <= target_size {
            return 0;
        }

        let expired: Vec<u32> = map
            .iter()
            .filter(|(_, e)| !e.is_live(now))
            .map(|(k, _)| *k)
            .collect();

        let mut removed = 0;
        for key in expired {
            if map.len() <= target_size {
                break;
            }
            map.remove(&key);
            removed += 1;
        }
        removed
    }

    /// spec.md §4.2 `expunge`: removes all entries for `qname`, restricted
    /// to `qtype` unless `qtype` is `None` (ANY).
    pub fn expunge(&self, qname: &[u8], qtype: Option<u16>) -> usize {
        let mut map = self.entries.write();
        let before = map.len();
        map.retain(|_, e| {
            if e.identity.qname != qname {
                return true;
            }
            match qtype {
                None => false,
                Some(t) => e.identity.qtype != t,
            }
        });
        before - map.len()
    }
}

/// Decrements every RR's TTL field in place by `age` seconds, clamped at
/// zero, skipping the OPT pseudo-RR (spec.md §4.2 aging, §9 OPT notes).
fn age_ttls(resp_buf: &mut [u8], age: u32) -> Result<(), CodecError> {
    let mut ttl_offsets = Vec::new();
    rr::for_each_rr(resp_buf, |rr| {
        if rr.rtype != TYPE_OPT {
            ttl_offsets.push((rr.rdata_start - 6, rr.ttl));
        }
        Ok(())
    })?;

    for (offset, ttl) in ttl_offsets {
        let aged = ttl.saturating_sub(age);
        BigEndian::write_u32(&mut resp_buf[offset..offset + 4], aged);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::get_sample_slice;

    // a.example/A, TTL=60, no EDNS
    const QUERY: &str = r#"
0000   ab cd 01 00 00 01 00 00 00 00 00 00 01 61 07 65
0010   78 61 6d 70 6c 65 00 00 01 00 01
"#;

    const RESPONSE: &str = r#"
0000   ab cd 81 80 00 01 00 01 00 00 00 00 01 61 07 65
0010   78 61 6d 70 6c 65 00 00 01 00 01 c0 0c 00 01 00
0020   01 00 00 00 3c 00 04 7f 00 00 01
"#;

    fn question_parts() -> (Vec<u8>, u16, u16, usize) {
        let buf = get_sample_slice(QUERY);
        let q = crate::wire::parse_question(&buf).unwrap();
        (q.qname, q.qtype, q.qclass, q.qname_wire_len)
    }

    #[test]
    fn insert_then_lookup_ages_ttl() {
        let cache = PacketCache::new(16, 0, 3600);
        let query = get_sample_slice(QUERY);
        let response = get_sample_slice(RESPONSE);
        let (qname, qtype, qclass, qname_wire_len) = question_parts();

        let masked = header::fingerprint_flags(&query).unwrap();
        let fp = fingerprint::compute(masked, &qname, qtype, qclass, None);

        assert_eq!(
            cache.insert(fp, &qname, qtype, qclass, &response, 1_000),
            InsertOutcome::Inserted
        );

        let mut buf = Vec::new();
        let outcome = cache
            .lookup(&query, &qname, qtype, qclass, qname_wire_len, 0xab_cd, &mut buf, false, 1_030)
            .unwrap();
        assert!(outcome.hit);

        let ttl_offset = RESPONSE_TTL_OFFSET;
        let aged_ttl = BigEndian::read_u32(&buf[ttl_offset..ttl_offset + 4]);
        assert_eq!(aged_ttl, 30);
    }

    // offset of the single A RR's TTL field in RESPONSE, computed once for
    // the fixture above (header 12 + qname 11 + qtype/qclass 4 + name-ptr 2
    // + type/class 4 = 33)
    const RESPONSE_TTL_OFFSET: usize = 33;

    #[test]
    fn lookup_at_capacity_still_hits_existing() {
        let cache = PacketCache::new(1, 0, 3600);
        let query = get_sample_slice(QUERY);
        let response = get_sample_slice(RESPONSE);
        let (qname, qtype, qclass, qname_wire_len) = question_parts();
        let masked = header::fingerprint_flags(&query).unwrap();
        let fp = fingerprint::compute(masked, &qname, qtype, qclass, None);

        assert_eq!(
            cache.insert(fp, &qname, qtype, qclass, &response, 0),
            InsertOutcome::Inserted
        );

        // a second, distinct key at full capacity is deferred
        assert_eq!(
            cache.insert(fp.wrapping_add(1), &qname, qtype, qclass, &response, 0),
            InsertOutcome::Deferred
        );

        let mut buf = Vec::new();
        let outcome = cache
            .lookup(&query, &qname, qtype, qclass, qname_wire_len, 0xab_cd, &mut buf, true, 0)
            .unwrap();
        assert!(outcome.hit);
    }

    #[test]
    fn zero_ttl_response_is_rejected() {
        let cache = PacketCache::new(16, 1, 3600);
        let mut response = get_sample_slice(RESPONSE);
        BigEndian::write_u32(&mut response[33..37], 0);
        let (qname, qtype, qclass, _) = question_parts();
        assert_eq!(
            cache.insert(0x1234, &qname, qtype, qclass, &response, 0),
            InsertOutcome::Rejected
        );
    }

    #[test]
    fn collision_keeps_first_until_expiry_then_supplants() {
        let cache = PacketCache::new(16, 0, 3600);
        let response = get_sample_slice(RESPONSE);
        let other_identity = (b"other.example.".to_vec(), 1u16, 1u16);

        assert_eq!(
            cache.insert(0xAAAA, b"\x07example\x03com\x00", 1, 1, &response, 0),
            InsertOutcome::Inserted
        );
        // same fingerprint bucket, different identity, still live
        assert_eq!(
            cache.insert(0xAAAA, &other_identity.0, other_identity.1, other_identity.2, &response, 0),
            InsertOutcome::Collision
        );

        // after expiry, the second insert should supplant the first
        assert_eq!(
            cache.insert(0xAAAA, &other_identity.0, other_identity.1, other_identity.2, &response, 10_000),
            InsertOutcome::Inserted
        );
    }

    #[test]
    fn purge_removes_only_expired_entries() {
        let cache = PacketCache::new(16, 0, 3600);
        let response = get_sample_slice(RESPONSE);
        cache.insert(1, b"\x01a\x00", 1, 1, &response, 0);
        cache.insert(2, b"\x01b\x00", 1, 1, &response, 100);

        // at t=130, the TTL=60 entry inserted at t=0 has expired; the one
        // inserted at t=100 (valid until 160) has not
        let removed = cache.purge(0, 130);
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expunge_removes_matching_qname() {
        let cache = PacketCache::new(16, 0, 3600);
        let response = get_sample_slice(RESPONSE);
        cache.insert(1, b"\x07example\x03com\x00", 1, 1, &response, 0);
        cache.insert(2, b"\x07example\x03com\x00", 28, 1, &response, 0);
        cache.insert(3, b"\x03www\x00", 1, 1, &response, 0);

        let removed = cache.expunge(b"\x07example\x03com\x00", None);
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
    }
}
