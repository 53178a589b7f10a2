//! Rule set (spec.md §4.4, component C4): an ordered list of
//! `(matcher, action)` pairs driving ACL gating, pool assignment, and
//! per-query actions.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;

use crate::ratelimit::RateLimiter;

/// A trie keyed by labels in reverse (TLD first), so `check` can
/// short-circuit as soon as a registered suffix is reached.
#[derive(Default)]
pub struct SuffixTrie {
    root: TrieNode,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<Vec<u8>, TrieNode>,
    terminal: bool,
}

impl SuffixTrie {
    pub fn new() -> Self {
        SuffixTrie::default()
    }

    /// Registers `suffix` (a presentation-format name like `example.com`).
    pub fn insert(&mut self, suffix: &str) {
        let mut node = &mut self.root;
        for label in suffix.split('.').filter(|l| !l.is_empty()).rev() {
            let key = label.as_bytes().to_ascii_lowercase();
            node = node.children.entry(key).or_default();
        }
        node.terminal = true;
    }

    /// `check(name) = true ⇔ name == s or name ends with ".s"` for some
    /// registered suffix `s`, case-insensitively (spec.md §8).
    pub fn check(&self, wire_qname: &[u8]) -> bool {
        let mut node = &self.root;
        for label in split_wire_labels(wire_qname).iter().rev() {
            let key = label.to_ascii_lowercase();
            match node.children.get(&key) {
                Some(next) => {
                    node = next;
                    if node.terminal {
                        return true;
                    }
                }
                None => return false,
            }
        }
        false
    }
}

fn split_wire_labels(wire_name: &[u8]) -> Vec<&[u8]> {
    let mut labels = Vec::new();
    let mut pos = 0;
    while pos < wire_name.len() {
        let len = wire_name[pos] as usize;
        if len == 0 {
            break;
        }
        let start = pos + 1;
        let end = start + len;
        if end > wire_name.len() {
            break;
        }
        labels.push(&wire_name[start..end]);
        pos = end;
    }
    labels
}

pub enum Matcher {
    Netmask(Vec<IpNetwork>),
    Suffix(SuffixTrie),
    QType(u16),
}

impl Matcher {
    fn matches(&self, client_addr: IpAddr, wire_qname: &[u8], qtype: u16) -> bool {
        match self {
            Matcher::Netmask(nets) => nets.iter().any(|n| n.contains(client_addr)),
            Matcher::Suffix(trie) => trie.check(wire_qname),
            Matcher::QType(want) => *want == qtype,
        }
    }
}

#[derive(Clone)]
pub enum Action {
    Allow,
    Drop,
    Pool(String),
    SetRCode(u8),
    SetTruncated,
    RateLimit(Arc<RateLimiter>),
}

pub struct Rule {
    pub matcher: Matcher,
    pub action: Action,
}

/// What a query should do next after the rule set has run: a terminal
/// decision, or `None` if nothing matched (falls through to the default
/// pool/policy selection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Drop,
    Pool(String),
    None,
}

/// Side effects accumulated from non-terminal actions (`SetRCode`,
/// `SetTruncated`) plus the terminal verdict reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub set_rcode: Option<u8>,
    pub set_truncated: bool,
}

pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        RuleSet { rules }
    }

    /// Evaluates the ordered rule list against one query. `now` is the
    /// fractional-seconds clock passed through to any `RateLimit` action.
    pub fn evaluate(&self, client_addr: IpAddr, wire_qname: &[u8], qtype: u16, now: f64) -> Evaluation {
        let mut set_rcode = None;
        let mut set_truncated = false;

        for rule in &self.rules {
            if !rule.matcher.matches(client_addr, wire_qname, qtype) {
                continue;
            }
            match &rule.action {
                Action::Allow => {
                    return Evaluation {
                        verdict: Verdict::Allow,
                        set_rcode,
                        set_truncated,
                    }
                }
                Action::Drop => {
                    return Evaluation {
                        verdict: Verdict::Drop,
                        set_rcode,
                        set_truncated,
                    }
                }
                Action::Pool(name) => {
                    return Evaluation {
                        verdict: Verdict::Pool(name.clone()),
                        set_rcode,
                        set_truncated,
                    }
                }
                Action::SetRCode(code) => set_rcode = Some(*code),
                Action::SetTruncated => set_truncated = true,
                Action::RateLimit(limiter) => {
                    if !limiter.check(now) {
                        return Evaluation {
                            verdict: Verdict::Drop,
                            set_rcode,
                            set_truncated,
                        };
                    }
                }
            }
        }

        Evaluation {
            verdict: Verdict::None,
            set_rcode,
            set_truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn wire(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for label in name.split('.').filter(|l| !l.is_empty()) {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }

    #[test]
    fn suffix_matches_exact_and_subdomain_case_insensitively() {
        let mut trie = SuffixTrie::new();
        trie.insert("Example.com");

        assert!(trie.check(&wire("example.com")));
        assert!(trie.check(&wire("WWW.example.COM")));
        assert!(!trie.check(&wire("notexample.com")));
        assert!(!trie.check(&wire("com")));
    }

    #[test]
    fn acl_gate_drops_unlisted_clients() {
        let net: IpNetwork = "10.0.0.0/8".parse().unwrap();
        let rules = RuleSet::new(vec![Rule {
            matcher: Matcher::Netmask(vec![net]),
            action: Action::Allow,
        }]);

        let allowed = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
        let stranger = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

        assert_eq!(
            rules.evaluate(allowed, &wire("example.com"), 1, 0.0).verdict,
            Verdict::Allow
        );
        assert_eq!(
            rules.evaluate(stranger, &wire("example.com"), 1, 0.0).verdict,
            Verdict::None
        );
    }

    #[test]
    fn rate_limit_short_circuits_to_drop_on_exhaustion() {
        let limiter = Arc::new(RateLimiter::new(0.0, 1.0));
        let rules = RuleSet::new(vec![Rule {
            matcher: Matcher::QType(1),
            action: Action::RateLimit(limiter),
        }]);

        let client = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(
            rules.evaluate(client, &wire("example.com"), 1, 0.0).verdict,
            Verdict::None
        );
        assert_eq!(
            rules.evaluate(client, &wire("example.com"), 1, 0.0).verdict,
            Verdict::Drop
        );
    }

    #[test]
    fn non_terminal_actions_accumulate_and_continue() {
        let client = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let rules = RuleSet::new(vec![
            Rule {
                matcher: Matcher::QType(1),
                action: Action::SetTruncated,
            },
            Rule {
                matcher: Matcher::QType(1),
                action: Action::Pool("restricted".into()),
            },
        ]);

        let eval = rules.evaluate(client, &wire("example.com"), 1, 0.0);
        assert!(eval.set_truncated);
        assert_eq!(eval.verdict, Verdict::Pool("restricted".into()));
    }
}
