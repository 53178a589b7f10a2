//! Resource record walking: used to compute the minimum TTL across a
//! response (spec.md §4.1 `min_ttl`) and as the shared building block for
//! the OPT-locating code in `wire::opt`.
use byteorder::{BigEndian, ByteOrder};

use crate::error::CodecError;
use crate::wire::header::{self, HEADER_LEN};
use crate::wire::name::skip_name;

pub const TYPE_OPT: u16 = 41;

/// One resource record's position within the message: its NAME starts at
/// `start`; `rdata_start` is where RDATA begins; `end` is one past RDATA.
#[derive(Debug, Clone, Copy)]
pub struct RrSpan {
    pub start: usize,
    pub rtype: u16,
    pub ttl: u32,
    pub rdata_start: usize,
    pub end: usize,
}

/// Skips the question section and returns the offset where the answer
/// section begins.
pub fn answer_section_start(bytes: &[u8]) -> Result<usize, CodecError> {
    let qdcount = header::qdcount(bytes)?;
    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        let name_len = skip_name(bytes, offset)?;
        offset += name_len + 4; // QTYPE + QCLASS
    }
    Ok(offset)
}

/// Parses one RR starting at `offset`, returning its span and the offset of
/// the next RR.
fn parse_rr(bytes: &[u8], offset: usize) -> Result<(RrSpan, usize), CodecError> {
    let name_len = skip_name(bytes, offset)?;
    let after_name = offset + name_len;
    if bytes.len() < after_name + 10 {
        return Err(CodecError::Truncated);
    }
    let rtype = BigEndian::read_u16(&bytes[after_name..after_name + 2]);
    let ttl = BigEndian::read_u32(&bytes[after_name + 4..after_name + 8]);
    let rdlength = BigEndian::read_u16(&bytes[after_name + 8..after_name + 10]) as usize;
    let rdata_start = after_name + 10;
    let end = rdata_start + rdlength;
    if bytes.len() < end {
        return Err(CodecError::Truncated);
    }

    Ok((
        RrSpan {
            start: offset,
            rtype,
            ttl,
            rdata_start,
            end,
        },
        end,
    ))
}

/// Invokes `visit` for every RR in the answer, authority and additional
/// sections, in wire order.
pub fn for_each_rr<F>(bytes: &[u8], mut visit: F) -> Result<(), CodecError>
where
    F: FnMut(RrSpan) -> Result<(), CodecError>,
{
    let total = header::ancount(bytes)? as u32
        + header::nscount(bytes)? as u32
        + header::arcount(bytes)? as u32;
    let mut offset = answer_section_start(bytes)?;
    for _ in 0..total {
        let (span, next) = parse_rr(bytes, offset)?;
        visit(span)?;
        offset = next;
    }
    Ok(())
}

/// Minimum TTL across all RRs in answer/authority/additional, ignoring the
/// OPT pseudo-RR (whose TTL field encodes extended RCODE/flags, not a TTL).
/// Returns `u32::MAX` if no RR is present (spec.md §4.1).
pub fn min_ttl(bytes: &[u8]) -> Result<u32, CodecError> {
    let mut min = u32::MAX;
    for_each_rr(bytes, |rr| {
        if rr.rtype != TYPE_OPT {
            min = min.min(rr.ttl);
        }
        Ok(())
    })?;
    Ok(min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::get_sample_slice;

    // a.example/A query answered by a single A RR with TTL=60, plus an OPT RR
    const RESPONSE: &str = r#"
0000   00 01 81 80 00 01 00 01 00 00 00 01 01 61 07 65
0010   78 61 6d 70 6c 65 00 00 01 00 01 c0 0c 00 01 00
0020   01 00 00 00 3c 00 04 7f 00 00 01 00 00 29 10 00
0030   00 00 00 00 00 00
"#;

    #[test]
    fn min_ttl_ignores_opt() {
        let buf = get_sample_slice(RESPONSE);
        assert_eq!(min_ttl(&buf).unwrap(), 60);
    }

    #[test]
    fn min_ttl_of_empty_response_is_max() {
        // header only, no RRs
        let buf = vec![
            0, 1, 0x81, 0x80, 0, 1, 0, 0, 0, 0, 0, 0, 1, b'a', 0, 0, 1, 0, 1,
        ];
        assert_eq!(min_ttl(&buf).unwrap(), u32::MAX);
    }

    #[test]
    fn answer_start_skips_question() {
        let buf = get_sample_slice(RESPONSE);
        // header(12) + name(1+'a'+1+7+'example'+1 = 11) + qtype/qclass(4) = 27
        assert_eq!(answer_section_start(&buf).unwrap(), 27);
    }
}
