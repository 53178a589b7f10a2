//! OPT pseudo-RR (EDNS0, RFC6891) location and manipulation, plus EDNS
//! Client Subnet (RFC7871, option code 8) insertion/stripping.
//!
//! Grounded on the teacher's `OPT`/`OptTTL`/`OptData` structs in
//! `rfc1035.rs` (NAME=root, TYPE=41, CLASS=UDP payload size, TTL=extended
//! RCODE/version/flags, RDATA={option,length,value}* list), generalized to
//! raw-byte splicing since the query path must rewrite a captured response
//! rather than rebuild one from a typed tree. ECS option framing is
//! supplemented from original_source/pdns/dnsdist-ecs.hh.
use std::net::IpAddr;

use byteorder::{BigEndian, ByteOrder};

use crate::error::CodecError;
use crate::wire::header::{self, HEADER_LEN};
use crate::wire::name::skip_name;
use crate::wire::rr::TYPE_OPT;

pub const ECS_OPTION_CODE: u16 = 8;

/// Location of the single OPT RR in the additional section, if present.
/// `offset` is where the RR's NAME field starts; `length` is the RR's
/// total wire length (NAME..end of RDATA); `is_last` is true when no other
/// RR follows it in the message.
#[derive(Debug, Clone, Copy)]
pub struct OptLocation {
    pub offset: usize,
    pub length: usize,
    pub rdata_start: usize,
    pub rdata_len: usize,
    pub is_last: bool,
}

/// Finds the OPT RR in the additional section (spec.md §4.1 `locate_opt`).
pub fn locate_opt(bytes: &[u8]) -> Result<Option<OptLocation>, CodecError> {
    let qdcount = header::qdcount(bytes)?;
    let mut offset = HEADER_LEN;
    for _ in 0..qdcount {
        offset += skip_name(bytes, offset)? + 4;
    }

    let rr_total = header::ancount(bytes)? as u32 + header::nscount(bytes)? as u32;
    for _ in 0..rr_total {
        offset = skip_rr(bytes, offset)?;
    }

    let arcount = header::arcount(bytes)?;
    for _ in 0..arcount {
        let rr_start = offset;
        let name_len = skip_name(bytes, offset)?;
        let after_name = offset + name_len;
        if bytes.len() < after_name + 10 {
            return Err(CodecError::Truncated);
        }
        let rtype = BigEndian::read_u16(&bytes[after_name..after_name + 2]);
        let rdlength = BigEndian::read_u16(&bytes[after_name + 8..after_name + 10]) as usize;
        let rdata_start = after_name + 10;
        let end = rdata_start + rdlength;
        if bytes.len() < end {
            return Err(CodecError::Truncated);
        }

        if rtype == TYPE_OPT {
            return Ok(Some(OptLocation {
                offset: rr_start,
                length: end - rr_start,
                rdata_start,
                rdata_len: rdlength,
                is_last: end == bytes.len(),
            }));
        }
        offset = end;
    }

    Ok(None)
}

fn skip_rr(bytes: &[u8], offset: usize) -> Result<usize, CodecError> {
    let name_len = skip_name(bytes, offset)?;
    let after_name = offset + name_len;
    if bytes.len() < after_name + 10 {
        return Err(CodecError::Truncated);
    }
    let rdlength = BigEndian::read_u16(&bytes[after_name + 8..after_name + 10]) as usize;
    let end = after_name + 10 + rdlength;
    if bytes.len() < end {
        return Err(CodecError::Truncated);
    }
    Ok(end)
}

/// Removes the OPT RR (if any) and decrements ARCOUNT (spec.md §4.1
/// `rewrite_without_edns`). Returns a copy unchanged if there is no OPT RR.
pub fn rewrite_without_edns(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    match locate_opt(bytes)? {
        None => Ok(bytes.to_vec()),
        Some(opt) => {
            let mut out = Vec::with_capacity(bytes.len() - opt.length);
            out.extend_from_slice(&bytes[..opt.offset]);
            out.extend_from_slice(&bytes[opt.offset + opt.length..]);
            let arcount = header::arcount(&out)?;
            header::set_arcount(&mut out, arcount - 1);
            Ok(out)
        }
    }
}

/// Strips a single EDNS option from the OPT RData (spec.md §4.1
/// `rewrite_without_option`). Leaves `bytes` unchanged (by value) if no OPT
/// RR is present, or if the option is not present in it.
pub fn rewrite_without_option(bytes: &[u8], option_code: u16) -> Result<Vec<u8>, CodecError> {
    let opt = match locate_opt(bytes)? {
        Some(opt) => opt,
        None => return Ok(bytes.to_vec()),
    };

    let rdata = &bytes[opt.rdata_start..opt.rdata_start + opt.rdata_len];
    let options = parse_options(rdata)?;
    if !options.iter().any(|(code, _)| *code == option_code) {
        return Ok(bytes.to_vec());
    }

    let mut new_rdata = Vec::with_capacity(rdata.len());
    for (code, data) in &options {
        if *code == option_code {
            continue;
        }
        let mut buf = [0u8; 4];
        BigEndian::write_u16(&mut buf[0..2], *code);
        BigEndian::write_u16(&mut buf[2..4], data.len() as u16);
        new_rdata.extend_from_slice(&buf);
        new_rdata.extend_from_slice(data);
    }

    splice_opt_rdata(bytes, &opt, &new_rdata)
}

/// Option-code 2 + option-length 2 + value pairs, per RFC6891 §6.1.2.
fn parse_options(rdata: &[u8]) -> Result<Vec<(u16, Vec<u8>)>, CodecError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < rdata.len() {
        if rdata.len() < pos + 4 {
            return Err(CodecError::Truncated);
        }
        let code = BigEndian::read_u16(&rdata[pos..pos + 2]);
        let len = BigEndian::read_u16(&rdata[pos + 2..pos + 4]) as usize;
        let val_start = pos + 4;
        let val_end = val_start + len;
        if rdata.len() < val_end {
            return Err(CodecError::Truncated);
        }
        out.push((code, rdata[val_start..val_end].to_vec()));
        pos = val_end;
    }
    Ok(out)
}

fn splice_opt_rdata(bytes: &[u8], opt: &OptLocation, new_rdata: &[u8]) -> Result<Vec<u8>, CodecError> {
    let rdlength_offset = opt.rdata_start - 2;
    let mut out = Vec::with_capacity(bytes.len() + new_rdata.len());
    out.extend_from_slice(&bytes[..rdlength_offset]);
    let mut rdlen_buf = [0u8; 2];
    BigEndian::write_u16(&mut rdlen_buf, new_rdata.len() as u16);
    out.extend_from_slice(&rdlen_buf);
    out.extend_from_slice(new_rdata);
    out.extend_from_slice(&bytes[opt.rdata_start + opt.rdata_len..]);
    Ok(out)
}

/// Encodes an ECS option value: FAMILY (1=IPv4, 2=IPv6), SOURCE PREFIX-LEN,
/// SCOPE PREFIX-LEN (always 0 on the query path), ADDRESS truncated to
/// whole octets at the prefix boundary (RFC7871 §6).
fn encode_ecs_value(client_addr: IpAddr, prefix_len: u8) -> Vec<u8> {
    let (family, addr_bytes): (u16, Vec<u8>) = match client_addr {
        IpAddr::V4(v4) => (1, v4.octets().to_vec()),
        IpAddr::V6(v6) => (2, v6.octets().to_vec()),
    };
    let octets = ((prefix_len as usize) + 7) / 8;
    let mut value = Vec::with_capacity(4 + octets);
    let mut fam_buf = [0u8; 2];
    BigEndian::write_u16(&mut fam_buf, family);
    value.extend_from_slice(&fam_buf);
    value.push(prefix_len);
    value.push(0); // scope prefix-len, set by the resolver in its reply, never by us
    value.extend_from_slice(&addr_bytes[..octets.min(addr_bytes.len())]);
    value
}

/// Inserts or replaces the EDNS Client Subnet option (spec.md §4.1
/// `add_ecs`). If no OPT RR is present, synthesizes one with the given
/// `udp_payload_size` and `dnssec_ok` flag. If `override_existing` is
/// false and an ECS option is already present, the message is returned
/// unchanged.
pub fn add_ecs(
    bytes: &[u8],
    client_addr: IpAddr,
    prefix_len: u8,
    udp_payload_size: u16,
    dnssec_ok: bool,
    override_existing: bool,
) -> Result<Vec<u8>, CodecError> {
    let ecs_value = encode_ecs_value(client_addr, prefix_len);
    let mut ecs_option = Vec::with_capacity(4 + ecs_value.len());
    let mut code_buf = [0u8; 2];
    BigEndian::write_u16(&mut code_buf, ECS_OPTION_CODE);
    ecs_option.extend_from_slice(&code_buf);
    let mut len_buf = [0u8; 2];
    BigEndian::write_u16(&mut len_buf, ecs_value.len() as u16);
    ecs_option.extend_from_slice(&len_buf);
    ecs_option.extend_from_slice(&ecs_value);

    match locate_opt(bytes)? {
        None => Ok(append_opt_with_ecs(bytes, udp_payload_size, dnssec_ok, &ecs_option)),
        Some(opt) => {
            let rdata = &bytes[opt.rdata_start..opt.rdata_start + opt.rdata_len];
            let mut options = parse_options(rdata)?;
            let already_present = options.iter().any(|(code, _)| *code == ECS_OPTION_CODE);
            if already_present && !override_existing {
                return Ok(bytes.to_vec());
            }
            options.retain(|(code, _)| *code != ECS_OPTION_CODE);

            let mut new_rdata = Vec::with_capacity(rdata.len() + ecs_option.len());
            for (code, data) in &options {
                let mut cbuf = [0u8; 2];
                BigEndian::write_u16(&mut cbuf, *code);
                new_rdata.extend_from_slice(&cbuf);
                let mut lbuf = [0u8; 2];
                BigEndian::write_u16(&mut lbuf, data.len() as u16);
                new_rdata.extend_from_slice(&lbuf);
                new_rdata.extend_from_slice(data);
            }
            new_rdata.extend_from_slice(&ecs_option);

            splice_opt_rdata(bytes, &opt, &new_rdata)
        }
    }
}

fn append_opt_with_ecs(bytes: &[u8], udp_payload_size: u16, dnssec_ok: bool, ecs_option: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.push(0); // NAME = root
    let mut type_buf = [0u8; 2];
    BigEndian::write_u16(&mut type_buf, TYPE_OPT);
    out.extend_from_slice(&type_buf);
    let mut class_buf = [0u8; 2];
    BigEndian::write_u16(&mut class_buf, udp_payload_size);
    out.extend_from_slice(&class_buf);
    // TTL: extended-rcode(0) version(0) DO-bit + Z
    let ttl: u32 = if dnssec_ok { 0x0000_8000 } else { 0 };
    let mut ttl_buf = [0u8; 4];
    BigEndian::write_u32(&mut ttl_buf, ttl);
    out.extend_from_slice(&ttl_buf);
    let mut rdlen_buf = [0u8; 2];
    BigEndian::write_u16(&mut rdlen_buf, ecs_option.len() as u16);
    out.extend_from_slice(&rdlen_buf);
    out.extend_from_slice(ecs_option);

    let arcount = header::arcount(&out).unwrap_or(0);
    header::set_arcount(&mut out, arcount + 1);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::get_sample_slice;
    use std::net::Ipv4Addr;

    // same response fixture as wire::rr, with a bare OPT RR (no options)
    const RESPONSE_WITH_OPT: &str = r#"
0000   00 01 81 80 00 01 00 01 00 00 00 01 01 61 07 65
0010   78 61 6d 70 6c 65 00 00 01 00 01 c0 0c 00 01 00
0020   01 00 00 00 3c 00 04 7f 00 00 01 00 00 29 10 00
0030   00 00 00 00 00 00
"#;

    const RESPONSE_NO_OPT: &str = r#"
0000   00 01 81 80 00 01 00 01 00 00 00 00 01 61 07 65
0010   78 61 6d 70 6c 65 00 00 01 00 01 c0 0c 00 01 00
0020   01 00 00 00 3c 00 04 7f 00 00 01
"#;

    #[test]
    fn locates_opt() {
        let buf = get_sample_slice(RESPONSE_WITH_OPT);
        let opt = locate_opt(&buf).unwrap().unwrap();
        assert_eq!(opt.offset, 43);
        assert_eq!(opt.length, 11);
        assert!(opt.is_last);
    }

    #[test]
    fn no_opt_present() {
        let buf = get_sample_slice(RESPONSE_NO_OPT);
        assert!(locate_opt(&buf).unwrap().is_none());
    }

    #[test]
    fn rewrite_without_edns_removes_opt_and_decrements_arcount() {
        let buf = get_sample_slice(RESPONSE_WITH_OPT);
        let rewritten = rewrite_without_edns(&buf).unwrap();
        assert!(locate_opt(&rewritten).unwrap().is_none());
        assert_eq!(header::arcount(&rewritten).unwrap(), 0);
        assert_eq!(rewritten.len(), buf.len() - 11);
    }

    #[test]
    fn rewrite_without_edns_is_noop_without_opt() {
        let buf = get_sample_slice(RESPONSE_NO_OPT);
        assert_eq!(rewrite_without_edns(&buf).unwrap(), buf);
    }

    #[test]
    fn add_ecs_synthesizes_opt_when_absent() {
        let buf = get_sample_slice(RESPONSE_NO_OPT);
        let client = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let out = add_ecs(&buf, client, 24, 4096, true, false).unwrap();
        let opt = locate_opt(&out).unwrap().unwrap();
        assert_eq!(header::arcount(&out).unwrap(), 1);
        let rdata = &out[opt.rdata_start..opt.rdata_start + opt.rdata_len];
        let options = parse_options(rdata).unwrap();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].0, ECS_OPTION_CODE);
        // family=1, prefix=24, scope=0, 3 address octets
        assert_eq!(options[0].1, vec![0, 1, 24, 0, 203, 0, 113]);
    }

    #[test]
    fn add_ecs_replaces_existing_when_override() {
        let buf = get_sample_slice(RESPONSE_NO_OPT);
        let client = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let first = add_ecs(&buf, client, 24, 4096, true, false).unwrap();

        let other_client = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9));
        let second = add_ecs(&first, other_client, 16, 4096, true, true).unwrap();
        let opt = locate_opt(&second).unwrap().unwrap();
        let rdata = &second[opt.rdata_start..opt.rdata_start + opt.rdata_len];
        let options = parse_options(rdata).unwrap();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].1, vec![0, 1, 16, 0, 198, 51]);
    }

    #[test]
    fn add_ecs_keeps_existing_without_override() {
        let buf = get_sample_slice(RESPONSE_NO_OPT);
        let client = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let first = add_ecs(&buf, client, 24, 4096, true, false).unwrap();

        let other_client = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9));
        let second = add_ecs(&first, other_client, 16, 4096, true, false).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn rewrite_without_option_noop_when_absent() {
        let buf = get_sample_slice(RESPONSE_WITH_OPT);
        let out = rewrite_without_option(&buf, ECS_OPTION_CODE).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn rewrite_without_option_strips_matching_option() {
        let buf = get_sample_slice(RESPONSE_NO_OPT);
        let client = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let with_ecs = add_ecs(&buf, client, 24, 4096, true, false).unwrap();
        let stripped = rewrite_without_option(&with_ecs, ECS_OPTION_CODE).unwrap();
        let opt = locate_opt(&stripped).unwrap().unwrap();
        assert_eq!(opt.rdata_len, 0);
    }
}
