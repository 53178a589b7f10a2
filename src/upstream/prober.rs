//! Health probe query construction and the single-probe up/down check.
//!
//! Supplemented from original_source/pdns/toysdig.cc and
//! pdns/lua-recursor4.cc, which the distillation collapsed into "issues a
//! known probe query": a minimal A query for a fixed well-known name, sent
//! over a short-lived UDP socket with a bounded timeout. Any syntactically
//! valid response with a matching ID and QR=1 counts as success — this is
//! not a DNS resolver, so a SERVFAIL or NXDOMAIN still proves the upstream
//! is alive and answering (spec.md §9 Open Question, single-probe-success).
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};

use crate::wire::header;

const PROBE_NAME: &str = "a.root-servers.net";
const PROBE_QTYPE: u16 = 1; // A
const PROBE_QCLASS: u16 = 1; // IN

fn build_probe_query(id: u16) -> Vec<u8> {
    let mut buf = vec![0u8; header::HEADER_LEN];
    header::write_id(&mut buf, id);
    BigEndian::write_u16(&mut buf[2..4], 0x0100); // RD=1
    BigEndian::write_u16(&mut buf[4..6], 1); // QDCOUNT=1

    for label in PROBE_NAME.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);

    let mut trailer = [0u8; 4];
    BigEndian::write_u16(&mut trailer[0..2], PROBE_QTYPE);
    BigEndian::write_u16(&mut trailer[2..4], PROBE_QCLASS);
    buf.extend_from_slice(&trailer);
    buf
}

/// Sends one probe query to `target` and waits up to `timeout` for a
/// syntactically valid reply. Returns `(up, latency)`.
pub fn probe_once(target: SocketAddr, timeout: Duration) -> (bool, Duration) {
    let started = Instant::now();

    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };

    let socket = match UdpSocket::bind(bind_addr) {
        Ok(s) => s,
        Err(_) => return (false, started.elapsed()),
    };
    if socket.set_read_timeout(Some(timeout)).is_err() {
        return (false, started.elapsed());
    }

    let probe_id: u16 = 0xC0DE;
    let query = build_probe_query(probe_id);
    if socket.send_to(&query, target).is_err() {
        return (false, started.elapsed());
    }

    let mut resp_buf = [0u8; 512];
    match socket.recv(&mut resp_buf) {
        Ok(len) if len >= header::HEADER_LEN => {
            let resp = &resp_buf[..len];
            let valid = header::read_id(resp).ok() == Some(probe_id) && header::is_response(resp).unwrap_or(false);
            (valid, started.elapsed())
        }
        _ => (false, started.elapsed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_query_has_expected_shape() {
        let query = build_probe_query(0xC0DE);
        assert_eq!(header::read_id(&query).unwrap(), 0xC0DE);
        assert_eq!(header::qdcount(&query).unwrap(), 1);
        let q = crate::wire::parse_question(&query).unwrap();
        assert_eq!(q.qtype, PROBE_QTYPE);
        assert_eq!(q.qclass, PROBE_QCLASS);
    }

    #[test]
    fn probe_times_out_against_unresponsive_target() {
        // port 0 bound-and-dropped target: nothing is listening, so the
        // recv should time out quickly rather than hang.
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (up, _) = probe_once(target, Duration::from_millis(50));
        assert!(!up);
    }
}
