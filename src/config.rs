//! Configuration snapshot (spec.md §3/§6): the immutable, reference-
//! counted bundle the pipeline reads once per query. Because the
//! console/control-plane collaborator that would normally produce and
//! install this snapshot live is out of scope, the daemon instead loads
//! the same shape from a TOML file at startup — the `serde` + `toml`
//! pairing `ktheindifferent-AtlasDNS` and `RoeeJ-heimdall` use in the
//! retrieval pack — and republishes it the same way a live console would
//! (atomic swap, via `arc-swap`).
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{DNSError, DNSResult};

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub addr: SocketAddr,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u64,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub qps: Option<f64>,
}

fn default_weight() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherConfig {
    Netmask(Vec<String>),
    Suffix(Vec<String>),
    QType(u16),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionConfig {
    Allow,
    Drop,
    Pool { name: String },
    SetRCode { code: u8 },
    SetTruncated,
    RateLimit { rate: f64, burst: f64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub matcher: MatcherConfig,
    pub action: ActionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    pub min_ttl: u32,
    pub max_ttl: u32,
}

/// EDNS Client Subnet scoping for outgoing upstream queries (spec.md §4.1
/// `add_ecs`, §6). Absent by default: most deployments forward queries
/// unmodified.
#[derive(Debug, Clone, Deserialize)]
pub struct EcsConfig {
    #[serde(default = "default_ecs_prefix_v4")]
    pub prefix_v4: u8,
    #[serde(default = "default_ecs_prefix_v6")]
    pub prefix_v6: u8,
    #[serde(default = "default_udp_payload_size")]
    pub udp_payload_size: u16,
    #[serde(default)]
    pub override_existing: bool,
}

fn default_ecs_prefix_v4() -> u8 {
    24
}

fn default_ecs_prefix_v6() -> u8 {
    56
}

fn default_udp_payload_size() -> u16 {
    4096
}

/// The fields named verbatim in spec.md §6.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSnapshot {
    pub listen_addrs: Vec<SocketAddr>,
    #[serde(default)]
    pub acl: Vec<String>,
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub pool_rules: Vec<RuleConfig>,
    #[serde(default)]
    pub rate_limits: Vec<RuleConfig>,
    #[serde(default)]
    pub action_rules: Vec<RuleConfig>,
    #[serde(default = "default_policy")]
    pub policy: String,
    pub cache: CacheConfig,
    #[serde(default = "default_ring_size")]
    pub ring_size: usize,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub ecs: Option<EcsConfig>,
}

fn default_policy() -> String {
    "firstAvailable".to_string()
}

fn default_ring_size() -> usize {
    1024
}

fn default_health_check_interval() -> u64 {
    10
}

impl ConfigSnapshot {
    pub fn from_file(path: impl AsRef<Path>) -> DNSResult<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| DNSError::config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_text = r#"
            listen_addrs = ["0.0.0.0:53"]
            acl = ["127.0.0.0/8"]

            [[upstreams]]
            addr = "192.0.2.1:53"

            [cache]
            capacity = 1000
            min_ttl = 0
            max_ttl = 86400
        "#;
        let snapshot: ConfigSnapshot = toml::from_str(toml_text).unwrap();
        assert_eq!(snapshot.listen_addrs.len(), 1);
        assert_eq!(snapshot.upstreams.len(), 1);
        assert_eq!(snapshot.upstreams[0].weight, 1);
        assert_eq!(snapshot.policy, "firstAvailable");
        assert_eq!(snapshot.ring_size, 1024);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = ConfigSnapshot::from_file("/nonexistent/dnsbalance.toml");
        assert!(result.is_err());
    }
}
