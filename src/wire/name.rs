//! Domain name parsing: label framing plus RFC1035 §4.1.4 pointer compression.
//!
//! Grounded on the teacher's `DomainName::from_position` pointer-chasing loop
//! in `rfc1035.rs`, generalized to return the canonical (uncompressed) wire
//! form plus the number of bytes the name occupies in place, which is what
//! the rest of the wire codec (question/RR walking, cache splicing) needs.
use crate::error::CodecError;
use crate::util::is_pointer;

/// Compression pointers may only ever point strictly backwards in the
/// message; this also bounds the number of jumps we will ever follow,
/// so a crafted pointer chain cannot loop forever.
const MAX_POINTER_JUMPS: usize = 128;

/// Parses the domain name starting at `start` in `msg`, following
/// compression pointers. Returns the canonical wire-form name (length-
/// prefixed labels terminated by the root octet, with all pointers
/// resolved) and the number of bytes the name occupies *at `start`*
/// (i.e. not counting bytes that live elsewhere in the message and were
/// only reached through a pointer).
pub fn parse_name(msg: &[u8], start: usize) -> Result<(Vec<u8>, usize), CodecError> {
    let mut expanded = Vec::new();
    let mut pos = start;
    let mut consumed = None;
    let mut jumps = 0usize;

    loop {
        let b = *msg.get(pos).ok_or(CodecError::Truncated)?;

        if b == 0 {
            expanded.push(0);
            pos += 1;
            if consumed.is_none() {
                consumed = Some(pos - start);
            }
            break;
        }

        if is_pointer(b) {
            let lo = *msg.get(pos + 1).ok_or(CodecError::Truncated)?;
            let pointer = (((b & 0x3f) as usize) << 8) | lo as usize;

            if consumed.is_none() {
                consumed = Some(pos + 2 - start);
            }

            jumps += 1;
            if jumps > MAX_POINTER_JUMPS || pointer >= pos {
                return Err(CodecError::BadCompression);
            }
            pos = pointer;
            continue;
        }

        let len = b as usize;
        if len > 63 {
            return Err(CodecError::BadName);
        }
        let label_start = pos + 1;
        let label_end = label_start + len;
        if label_end > msg.len() {
            return Err(CodecError::Truncated);
        }
        expanded.push(b);
        expanded.extend_from_slice(&msg[label_start..label_end]);
        pos = label_end;
    }

    Ok((expanded, consumed.unwrap()))
}

/// Like [`parse_name`] but only reports how many bytes the name occupies in
/// place, discarding the expanded form. Used when walking resource records
/// where we only need to skip over the NAME field.
pub fn skip_name(msg: &[u8], start: usize) -> Result<usize, CodecError> {
    parse_name(msg, start).map(|(_, consumed)| consumed)
}

/// Lower-cases a canonical wire-form name for use as fingerprint input or
/// identity-triple comparison, ASCII-only per spec.
pub fn lowercase_wire_name(name: &[u8]) -> Vec<u8> {
    crate::util::lowercase_ascii(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::get_sample_slice;

    const SAMPLE: &str = r#"
0000   76 86 81 a0 00 01 00 08 00 00 00 01 02 68 6b 00
0010   00 02 00 01 c0 0c 00 02 00 01 00 00 54 60 00 0e
0020   01 7a 05 68 6b 69 72 63 03 6e 65 74 c0 0c c0 0c
0030   00 02 00 01 00 00 54 60 00 04 01 64 c0 22 c0 0c
"#;

    #[test]
    fn plain_label_sequence() {
        let buf = get_sample_slice(SAMPLE);
        let (name, consumed) = parse_name(&buf, 12).unwrap();
        assert_eq!(consumed, 4); // 02 68 6b 00
        assert_eq!(name, vec![2, b'h', b'k', 0]);
    }

    #[test]
    fn pointer_only() {
        let buf = get_sample_slice(SAMPLE);
        // offset 20 is "c0 0c" -- a bare pointer back to offset 12
        let (name, consumed) = parse_name(&buf, 20).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(name, vec![2, b'h', b'k', 0]);
    }

    #[test]
    fn labels_then_pointer() {
        let buf = get_sample_slice(SAMPLE);
        // offset 32 is "01 7a 05 68 6b 69 72 63 03 6e 65 74 c0 0c" -> z.hkirc.net.hk.
        let (name, consumed) = parse_name(&buf, 32).unwrap();
        assert_eq!(consumed, 14);
        assert_eq!(
            name,
            vec![
                1, b'z', 5, b'h', b'k', b'i', b'r', b'c', 3, b'n', b'e', b't', 2, b'h', b'k', 0
            ]
        );
    }

    #[test]
    fn rejects_forward_pointer() {
        // a pointer pointing at or after itself must be rejected to block loops
        let buf = vec![0xC0, 0x00];
        assert_eq!(parse_name(&buf, 0).unwrap_err(), CodecError::BadCompression);
    }

    #[test]
    fn rejects_oversize_label() {
        let mut buf = vec![64u8];
        buf.extend(std::iter::repeat(b'a').take(64));
        assert_eq!(parse_name(&buf, 0).unwrap_err(), CodecError::BadName);
    }

    #[test]
    fn rejects_truncated_label() {
        let buf = vec![10u8, b'a', b'b'];
        assert_eq!(parse_name(&buf, 0).unwrap_err(), CodecError::Truncated);
    }
}
