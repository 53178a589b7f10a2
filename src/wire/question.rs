//! Question section: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.2
use byteorder::{BigEndian, ByteOrder};

use crate::error::CodecError;
use crate::wire::header::HEADER_LEN;
use crate::wire::name::parse_name;

/// A parsed question: the lowercased wire-form QNAME (used for fingerprinting
/// and identity comparison), QTYPE, QCLASS, and how many bytes the QNAME
/// occupies in the original buffer (needed to locate the byte immediately
/// following the question section, and to splice the caller's QNAME case
/// back in on a cache hit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub qname: Vec<u8>,
    pub qtype: u16,
    pub qclass: u16,
    pub qname_wire_len: usize,
}

/// Parses the first question in the message, starting right after the
/// 12-byte header (spec.md §4.1 `parse_question`).
pub fn parse_question(bytes: &[u8]) -> Result<Question, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated);
    }

    let (name, qname_wire_len) = parse_name(bytes, HEADER_LEN)?;
    let trailer_start = HEADER_LEN + qname_wire_len;
    if bytes.len() < trailer_start + 4 {
        return Err(CodecError::Truncated);
    }

    let qtype = BigEndian::read_u16(&bytes[trailer_start..trailer_start + 2]);
    let qclass = BigEndian::read_u16(&bytes[trailer_start + 2..trailer_start + 4]);

    Ok(Question {
        qname: crate::wire::name::lowercase_wire_name(&name),
        qtype,
        qclass,
        qname_wire_len,
    })
}

/// Offset of the byte immediately following the question section.
pub fn question_end(qname_wire_len: usize) -> usize {
    HEADER_LEN + qname_wire_len + 4
}
