//! DNS message header: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
//!
//! Unlike the teacher's `DNSPacketHeader`/`DNSPacketFlags` (a typed struct
//! tree deserialized field-by-field), the query path only ever needs to
//! read a few header fields and rewrite the ID in place, so this operates
//! directly on the 12-byte prefix of the wire buffer.
use byteorder::{BigEndian, ByteOrder};

use crate::error::CodecError;

pub const HEADER_LEN: usize = 12;

/// Bits retained when computing the fingerprint-input flags: OPCODE
/// (bits 14-11) and RD (bit 8). QR, TC, RA and Z (and AA/AD/CD/RCODE,
/// which spec.md does not name as retained) are masked to zero, since
/// they do not alter what response would be returned for the same
/// question (spec.md §3).
const FINGERPRINT_FLAGS_MASK: u16 = 0b0111_1001_0000_0000;

pub fn read_id(buf: &[u8]) -> Result<u16, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Truncated);
    }
    Ok(BigEndian::read_u16(&buf[0..2]))
}

pub fn write_id(buf: &mut [u8], id: u16) {
    BigEndian::write_u16(&mut buf[0..2], id);
}

pub fn read_flags(buf: &[u8]) -> Result<u16, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Truncated);
    }
    Ok(BigEndian::read_u16(&buf[2..4]))
}

pub fn is_response(buf: &[u8]) -> Result<bool, CodecError> {
    Ok(read_flags(buf)? & 0x8000 != 0)
}

/// The masked flags used as fingerprint input (spec.md §3).
pub fn fingerprint_flags(buf: &[u8]) -> Result<u16, CodecError> {
    Ok(read_flags(buf)? & FINGERPRINT_FLAGS_MASK)
}

pub fn qdcount(buf: &[u8]) -> Result<u16, CodecError> {
    read_u16_at(buf, 4)
}

pub fn ancount(buf: &[u8]) -> Result<u16, CodecError> {
    read_u16_at(buf, 6)
}

pub fn nscount(buf: &[u8]) -> Result<u16, CodecError> {
    read_u16_at(buf, 8)
}

pub fn arcount(buf: &[u8]) -> Result<u16, CodecError> {
    read_u16_at(buf, 10)
}

pub fn set_arcount(buf: &mut [u8], value: u16) {
    BigEndian::write_u16(&mut buf[10..12], value);
}

pub fn write_flags(buf: &mut [u8], value: u16) {
    BigEndian::write_u16(&mut buf[2..4], value);
}

fn read_u16_at(buf: &[u8], offset: usize) -> Result<u16, CodecError> {
    if buf.len() < offset + 2 {
        return Err(CodecError::Truncated);
    }
    Ok(BigEndian::read_u16(&buf[offset..offset + 2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::get_sample_slice;

    const PACKET: &str = r#"
0000   76 86 81 a0 00 01 00 08 00 00 00 01
"#;

    #[test]
    fn reads_header_fields() {
        let buf = get_sample_slice(PACKET);
        assert_eq!(read_id(&buf).unwrap(), 0x7686);
        assert!(is_response(&buf).unwrap());
        assert_eq!(qdcount(&buf).unwrap(), 1);
        assert_eq!(ancount(&buf).unwrap(), 8);
        assert_eq!(nscount(&buf).unwrap(), 0);
        assert_eq!(arcount(&buf).unwrap(), 1);
    }

    #[test]
    fn rewrites_id_in_place() {
        let mut buf = get_sample_slice(PACKET);
        write_id(&mut buf, 0x1234);
        assert_eq!(read_id(&buf).unwrap(), 0x1234);
        // untouched beyond the ID
        assert_eq!(ancount(&buf).unwrap(), 8);
    }

    #[test]
    fn fingerprint_flags_mask_keeps_only_opcode_and_rd() {
        let buf = get_sample_slice(PACKET);
        // 0x81a0 = 1000_0001_1010_0000: QR=1 Opcode=0000 AA=0 TC=0 RD=1 RA=1 Z=0 RCODE=0
        assert_eq!(fingerprint_flags(&buf).unwrap(), 0x0100);
    }

    #[test]
    fn truncated_header_is_an_error() {
        let buf = vec![0u8; 4];
        assert!(matches!(read_id(&buf), Err(CodecError::Truncated)));
        assert!(matches!(arcount(&buf), Err(CodecError::Truncated)));
    }
}
