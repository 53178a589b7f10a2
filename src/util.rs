//! Small helpers shared across the query path.

/// True if this byte starts a compression pointer rather than a label length
/// (RFC1035 §4.1.4: the two top bits of a pointer octet are both set).
pub fn is_pointer(b: u8) -> bool {
    b & 0b1100_0000 == 0b1100_0000
}

/// ASCII lower-case comparison of two wire-form labels, used both when
/// computing the fingerprint and when comparing an incoming query's identity
/// triple against a stored entry (spec.md's Open Question on lower-casing is
/// resolved by using this single helper everywhere an identity comparison or
/// fingerprint input is needed).
pub fn labels_eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

pub fn lowercase_ascii(s: &[u8]) -> Vec<u8> {
    s.iter().map(|b| b.to_ascii_lowercase()).collect()
}

/// Parses a wireshark-style hex dump literal (offset, hex bytes, trailing
/// ASCII column ignored) into a plain byte vector. Used by wire-codec unit
/// tests to keep fixtures readable instead of inlining raw `Vec<u8>` literals.
#[cfg(test)]
pub fn get_sample_slice(dump: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for line in dump.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // skip the leading offset column (e.g. "0000")
        let rest = match line.split_once(char::is_whitespace) {
            Some((_, rest)) => rest,
            None => continue,
        };
        for tok in rest.split_whitespace() {
            if tok.len() != 2 || !tok.chars().all(|c| c.is_ascii_hexdigit()) {
                break;
            }
            out.push(u8::from_str_radix(tok, 16).unwrap());
        }
    }
    out
}
