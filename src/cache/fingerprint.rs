//! Query fingerprint (spec.md §3): a 32-bit hash combining the masked
//! header flags, the lowercased wire-form QNAME, QTYPE/QCLASS, and
//! (optionally) the ECS prefix when ECS-scoped caching is enabled.
use std::hash::Hasher;

use fnv::FnvHasher;

/// Fingerprints may collide (the identity triple is the true key); FNV is
/// chosen for speed on the hot path, not collision-resistance.
pub fn compute(masked_flags: u16, qname: &[u8], qtype: u16, qclass: u16, ecs: Option<&[u8]>) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write_u16(masked_flags);
    hasher.write(qname);
    hasher.write_u16(qtype);
    hasher.write_u16(qclass);
    if let Some(ecs) = ecs {
        hasher.write(ecs);
    }
    let full = hasher.finish();
    (full as u32) ^ ((full >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_input() {
        let a = compute(0x0100, b"\x07example\x03com\x00", 1, 1, None);
        let b = compute(0x0100, b"\x07example\x03com\x00", 1, 1, None);
        assert_eq!(a, b);
    }

    #[test]
    fn differs_on_qname() {
        let a = compute(0x0100, b"\x07example\x03com\x00", 1, 1, None);
        let b = compute(0x0100, b"\x03www\x07example\x03com\x00", 1, 1, None);
        assert_ne!(a, b);
    }

    #[test]
    fn differs_on_ecs_when_present() {
        let base = compute(0x0100, b"\x07example\x03com\x00", 1, 1, None);
        let scoped = compute(0x0100, b"\x07example\x03com\x00", 1, 1, Some(&[0, 1, 24, 0]));
        assert_ne!(base, scoped);
    }
}
