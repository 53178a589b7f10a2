//! Query pipeline (spec.md §4.8, component C8): the hot-path state machine
//! that drives every datagram from `Received` through to `EmitToClient` (or
//! a silent drop), wiring together the wire codec (C1), rule set (C4), rate
//! limiter (C3), packet cache (C2), upstream registry and selection policy
//! (C5/C6) and session tracker (C7).
//!
//! Grounded on the data flow diagram in spec.md §2: the listener thread
//! calls [`Pipeline::handle_query`] for an inbound client datagram, and each
//! upstream's responder thread calls [`Pipeline::handle_response`] for an
//! inbound upstream datagram. Neither function blocks on anything but the
//! packet cache's try-lock (§4.2) and the session ring's per-upstream mutex
//! (§5) — both bounded, both already accounted for by the components they
//! delegate to.
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use byteorder::{BigEndian, ByteOrder};

use crate::cache::PacketCache;
use crate::config::ConfigSnapshot;
use crate::error::CodecError;
use crate::policy::{PolicyRegistry, QueryMetadata};
use crate::rules::{Action, RuleSet, Verdict};
use crate::session::Correlation;
use crate::stats::Stats;
use crate::upstream::{Upstream, UpstreamRegistry};
use crate::wire;
use crate::wire::header::HEADER_LEN;

/// Why a query never produced a reply. Each variant corresponds to a row
/// in spec.md §7's error table and bumps the matching global counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Parse,
    AclReject,
    RateLimited,
    NoUpstream,
    RuleDrop,
}

/// What the listener thread should do with a query once `handle_query`
/// returns.
pub enum QueryOutcome {
    /// A reply is ready immediately; `bytes` already has the client's
    /// original ID spliced back in.
    Reply(Vec<u8>),
    /// The query was classified, a candidate upstream chosen, and a
    /// correlation slot allocated; `bytes` is the query ready to send to
    /// `upstream.addr`, with its DNS ID rewritten to the slot index.
    Forward { upstream: Arc<Upstream>, bytes: Vec<u8> },
    Drop(DropReason),
}

/// What the responder thread should send back to the client once
/// `handle_response` returns, or `None` if the response was spurious or
/// malformed.
pub struct ClientReply {
    pub client_addr: SocketAddr,
    pub bytes: Vec<u8>,
}

/// The portion of a [`ConfigSnapshot`] that governs classification and
/// selection — everything the console would atomically republish on a
/// live reload (spec.md §3/§5). Held behind an [`ArcSwap`] inside
/// [`Pipeline`] so [`Pipeline::reload`] can install a new one without
/// disturbing in-flight queries: each call to `handle_query` loads one
/// consistent snapshot at the start and uses it throughout.
struct ClassifierRules {
    acl: Vec<ipnetwork::IpNetwork>,
    rate_rules: RuleSet,
    pool_rules: RuleSet,
    action_rules: RuleSet,
    policy_name: String,
    ecs: Option<EcsSettings>,
}

struct EcsSettings {
    prefix_v4: u8,
    prefix_v6: u8,
    udp_payload_size: u16,
    override_existing: bool,
}

impl ClassifierRules {
    fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        let acl = snapshot
            .acl
            .iter()
            .filter_map(|cidr| cidr.parse::<ipnetwork::IpNetwork>().ok())
            .collect();

        let rate_rules = RuleSet::new(snapshot.rate_limits.iter().map(build_rule).collect());
        let pool_rules = RuleSet::new(snapshot.pool_rules.iter().map(build_rule).collect());
        let action_rules = RuleSet::new(snapshot.action_rules.iter().map(build_rule).collect());

        let ecs = snapshot.ecs.as_ref().map(|e| EcsSettings {
            prefix_v4: e.prefix_v4,
            prefix_v6: e.prefix_v6,
            udp_payload_size: e.udp_payload_size,
            override_existing: e.override_existing,
        });

        ClassifierRules {
            acl,
            rate_rules,
            pool_rules,
            action_rules,
            policy_name: snapshot.policy.clone(),
            ecs,
        }
    }

    /// An empty ACL list means no restriction is configured; otherwise the
    /// client must fall within at least one listed subnet (spec.md §3/§6).
    fn acl_allows(&self, client: IpAddr) -> bool {
        self.acl.is_empty() || self.acl.iter().any(|net| net.contains(client))
    }
}

/// Everything the query path needs, built once from a [`ConfigSnapshot`]
/// and shared (read-only after construction, aside from the interior
/// mutability its components already provide) across listener and
/// responder threads. Classification rules may be hot-reloaded via
/// [`Pipeline::reload`]; the cache, upstream registry and stats are
/// stable for the pipeline's lifetime.
pub struct Pipeline {
    rules: ArcSwap<ClassifierRules>,
    policies: PolicyRegistry,
    pub cache: Arc<PacketCache>,
    pub registry: Arc<UpstreamRegistry>,
    pub stats: Arc<Stats>,
}

impl Pipeline {
    pub fn from_snapshot(snapshot: &ConfigSnapshot, registry: Arc<UpstreamRegistry>) -> Self {
        Pipeline {
            rules: ArcSwap::from_pointee(ClassifierRules::from_snapshot(snapshot)),
            policies: PolicyRegistry::with_builtins(),
            cache: Arc::new(PacketCache::new(
                snapshot.cache.capacity,
                snapshot.cache.min_ttl,
                snapshot.cache.max_ttl,
            )),
            registry,
            stats: Arc::new(Stats::new(256)),
        }
    }

    /// Installs a newly loaded configuration's classification rules
    /// (ACL, rate limits, pool/action rules, policy name, ECS settings)
    /// via atomic pointer swap (spec.md §3: "Installed by atomic pointer
    /// swap; the pipeline reads a snapshot at the start of each query").
    /// The packet cache and upstream registry are untouched — they are
    /// not part of the reloadable classification surface.
    pub fn reload(&self, snapshot: &ConfigSnapshot) {
        self.rules.store(Arc::new(ClassifierRules::from_snapshot(snapshot)));
    }

    /// Drives one inbound client datagram through `Received → … →
    /// {Forwarded | Drop | Reply}` (spec.md §4.8).
    pub fn handle_query(&self, client_addr: SocketAddr, buf: &[u8], now: u64) -> QueryOutcome {
        let rules = self.rules.load();

        let question = match wire::parse_question(buf) {
            Ok(q) => q,
            Err(_) => {
                self.stats.counters.dns_parse_error.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return QueryOutcome::Drop(DropReason::Parse);
            }
        };

        if !rules.acl_allows(client_addr.ip()) {
            self.stats.counters.acl_drop.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return QueryOutcome::Drop(DropReason::AclReject);
        }

        let now_f = now as f64;
        let rate_eval = rules
            .rate_rules
            .evaluate(client_addr.ip(), &question.qname, question.qtype, now_f);
        if rate_eval.verdict == Verdict::Drop {
            self.stats.counters.rate_limited.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return QueryOutcome::Drop(DropReason::RateLimited);
        }

        let client_id = match wire::header::read_id(buf) {
            Ok(id) => id,
            Err(_) => return QueryOutcome::Drop(DropReason::Parse),
        };

        let mut resp_buf = Vec::new();
        let lookup = self.cache.lookup(
            buf,
            &question.qname,
            question.qtype,
            question.qclass,
            question.qname_wire_len,
            client_id,
            &mut resp_buf,
            false,
            now,
        );
        if let Ok(outcome) = lookup {
            if outcome.hit {
                return QueryOutcome::Reply(resp_buf);
            }
        }

        let pool_eval = rules
            .pool_rules
            .evaluate(client_addr.ip(), &question.qname, question.qtype, now_f);
        if pool_eval.verdict == Verdict::Drop {
            self.stats.counters.rule_drop.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return QueryOutcome::Drop(DropReason::RuleDrop);
        }
        let pool = match &pool_eval.verdict {
            Verdict::Pool(name) => Some(name.clone()),
            _ => None,
        };

        let action_eval = rules
            .action_rules
            .evaluate(client_addr.ip(), &question.qname, question.qtype, now_f);
        if action_eval.verdict == Verdict::Drop {
            self.stats.counters.rule_drop.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return QueryOutcome::Drop(DropReason::RuleDrop);
        }
        let pool = match &action_eval.verdict {
            Verdict::Pool(name) => Some(name.clone()),
            _ => pool,
        };

        // SetRCode/SetTruncated are non-terminal: neither rule set reaches
        // a verdict on its own, but either can still stamp the eventual
        // reply (spec.md §7: "a synthesized SetRCode / SetTruncated action
        // result"). Action rules run after pool rules, so they win ties.
        let set_rcode = action_eval.set_rcode.or(pool_eval.set_rcode);
        let set_truncated = action_eval.set_truncated || pool_eval.set_truncated;
        if set_rcode.is_some() || set_truncated {
            let mut reply = buf.to_vec();
            if reply.len() >= wire::HEADER_LEN {
                let mut flags = wire::header::read_flags(buf).unwrap_or(0);
                flags |= 0x8000; // QR
                if set_truncated {
                    flags |= 0x0200; // TC
                }
                if let Some(rcode) = set_rcode {
                    flags = (flags & 0xfff0) | (rcode as u16 & 0x000f);
                }
                wire::header::write_flags(&mut reply, flags);
            }
            return QueryOutcome::Reply(reply);
        }

        let snapshot = self.registry.snapshot();
        let candidates: Vec<Arc<Upstream>> = snapshot
            .iter()
            .filter(|u| pool.as_deref().map_or(true, |p| u.in_pool(p)))
            .filter(|u| u.is_up())
            .filter(|u| u.check_qps(now_f))
            .cloned()
            .collect();

        let meta = QueryMetadata {
            qname: &question.qname,
            qtype: question.qtype,
        };
        let chosen = match self.policies.select(&rules.policy_name, &candidates, &meta) {
            Some(u) => u,
            None => {
                self.stats.counters.no_upstream.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return QueryOutcome::Drop(DropReason::NoUpstream);
            }
        };

        let masked_flags = wire::header::fingerprint_flags(buf).unwrap_or(0);
        let fp = crate::cache::fingerprint::compute(masked_flags, &question.qname, question.qtype, question.qclass, None);

        let slot_idx = chosen
            .sessions
            .allocate(client_addr, client_id, fp, now, &chosen);

        let outgoing = match rewrite_for_upstream(&rules, buf, client_addr.ip(), slot_idx) {
            Ok(bytes) => bytes,
            Err(_) => return QueryOutcome::Drop(DropReason::Parse),
        };

        QueryOutcome::Forward {
            upstream: chosen,
            bytes: outgoing,
        }
    }

    /// Drives one inbound upstream datagram through `Response → Correlated
    /// → Cached → EmitToClient` (spec.md §4.8). Returns `None` for a
    /// malformed or spurious response; the caller drops it.
    pub fn handle_response(&self, upstream: &Upstream, buf: &[u8], now: u64) -> Option<ClientReply> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let slot_idx = BigEndian::read_u16(&buf[0..2]);
        let correlation = upstream.sessions.complete(slot_idx, now, upstream);
        let Correlation {
            client_addr,
            original_id,
            fingerprint,
            ..
        } = match correlation {
            Some(c) => c,
            None => {
                self.stats.counters.spurious_responses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return None;
            }
        };

        let question = wire::parse_question(buf).ok();

        let mut reply = buf.to_vec();
        wire::header::write_id(&mut reply, original_id);

        if let Some(q) = question {
            let rcode = wire::header::read_flags(buf).map(|f| (f & 0x000f) as u8).unwrap_or(0);
            self.stats.top_n.record(q.qname.clone(), rcode);

            // the stored entry keeps the upstream-rewritten ID; harmless,
            // since `lookup` always overwrites the first two bytes with
            // the caller's own ID before returning a hit.
            self.cache.insert(fingerprint, &q.qname, q.qtype, q.qclass, buf, now);
        }

        Some(ClientReply {
            client_addr,
            bytes: reply,
        })
    }
}

fn rewrite_for_upstream(
    rules: &ClassifierRules,
    buf: &[u8],
    client_ip: IpAddr,
    slot_idx: u16,
) -> Result<Vec<u8>, CodecError> {
    let mut out = buf.to_vec();
    wire::header::write_id(&mut out, slot_idx);

    if let Some(ecs) = &rules.ecs {
        let prefix_len = match client_ip {
            IpAddr::V4(_) => ecs.prefix_v4,
            IpAddr::V6(_) => ecs.prefix_v6,
        };
        out = wire::opt::add_ecs(&out, client_ip, prefix_len, ecs.udp_payload_size, false, ecs.override_existing)?;
    }
    Ok(out)
}

fn build_rule(cfg: &crate::config::RuleConfig) -> crate::rules::Rule {
    crate::rules::Rule {
        matcher: build_matcher(&cfg.matcher),
        action: build_action(&cfg.action),
    }
}

fn build_matcher(cfg: &crate::config::MatcherConfig) -> crate::rules::Matcher {
    use crate::config::MatcherConfig;
    use crate::rules::Matcher;
    match cfg {
        MatcherConfig::Netmask(nets) => {
            Matcher::Netmask(nets.iter().filter_map(|n| n.parse().ok()).collect())
        }
        MatcherConfig::Suffix(suffixes) => {
            let mut trie = crate::rules::SuffixTrie::new();
            for s in suffixes {
                trie.insert(s);
            }
            Matcher::Suffix(trie)
        }
        MatcherConfig::QType(t) => Matcher::QType(*t),
    }
}

fn build_action(cfg: &crate::config::ActionConfig) -> Action {
    use crate::config::ActionConfig;
    match cfg {
        ActionConfig::Allow => Action::Allow,
        ActionConfig::Drop => Action::Drop,
        ActionConfig::Pool { name } => Action::Pool(name.clone()),
        ActionConfig::SetRCode { code } => Action::SetRCode(*code),
        ActionConfig::SetTruncated => Action::SetTruncated,
        ActionConfig::RateLimit { rate, burst } => {
            Action::RateLimit(Arc::new(crate::ratelimit::RateLimiter::new(*rate, *burst)))
        }
    }
}
