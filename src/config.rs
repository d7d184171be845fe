//! Application configuration (spec §6 "Configuration surface").
//!
//! A single TOML document read from disk with `#[serde(default)]` filling
//! in the documented defaults for every optional knob.

use serde::Deserialize;
use std::net::Ipv4Addr;

use crate::errors::KProxyError;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub dns: DnsConfig,
    pub tls: TlsConfig,
    pub policy: PolicyConfig,
    pub usage: UsageConfig,
    pub proxy: ProxyConfig,
}

impl AppConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| KProxyError::configuration(format!("reading {path}: {e}")))?;
        let cfg: Self = toml::from_str(&s)
            .map_err(|e| KProxyError::configuration(format!("parsing {path}: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.dns.upstream_servers.is_empty() {
            return Err(
                KProxyError::configuration("dns.upstream_servers must not be empty").into(),
            );
        }
        match &self.policy.source {
            PolicySource::Filesystem => {
                if self.policy.policy_dir.is_none() {
                    return Err(KProxyError::configuration(
                        "policy.policy_dir is required when policy.source = \"filesystem\"",
                    )
                    .into());
                }
            }
            PolicySource::Remote => {
                if self.policy.policy_urls.is_empty() {
                    return Err(KProxyError::configuration(
                        "policy.policy_urls is required when policy.source = \"remote\"",
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}

fn d_listen_addr() -> String {
    "0.0.0.0:53".to_string()
}
fn d_intercept_ttl() -> u32 {
    60
}
fn d_bypass_ttl_cap() -> u32 {
    300
}
fn d_block_ttl() -> u32 {
    10
}
fn d_dns_timeout_ms() -> u64 {
    3000
}
fn d_true() -> bool {
    true
}
fn d_answer_cache_size() -> u64 {
    20_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "d_listen_addr")]
    pub listen_addr: String,
    pub upstream_servers: Vec<String>,
    #[serde(default = "d_intercept_ttl")]
    pub intercept_ttl: u32,
    #[serde(default = "d_bypass_ttl_cap")]
    pub bypass_ttl_cap: u32,
    #[serde(default = "d_block_ttl")]
    pub block_ttl: u32,
    pub proxy_ip: Ipv4Addr,
    #[serde(default = "d_dns_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "d_true")]
    pub enable_tcp: bool,
    #[serde(default = "d_true")]
    pub enable_udp: bool,
    /// When every upstream fails on BYPASS, fall back to INTERCEPT so
    /// enforcement continues (spec §4.5). Disabling surfaces SERVFAIL.
    #[serde(default = "d_true")]
    pub intercept_fallback: bool,
    #[serde(default = "d_answer_cache_size")]
    pub answer_cache_size: u64,
}

fn d_leaf_validity_secs() -> i64 {
    24 * 3600
}
fn d_leaf_skew_secs() -> i64 {
    5 * 60
}
fn d_cache_size() -> u64 {
    1000
}
fn d_safety_margin_secs() -> i64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub root_cert_path: String,
    pub root_key_path: String,
    pub intermediate_cert_path: String,
    pub intermediate_key_path: String,
    #[serde(default = "d_leaf_validity_secs")]
    pub leaf_validity_secs: i64,
    #[serde(default = "d_leaf_skew_secs")]
    pub leaf_skew_secs: i64,
    #[serde(default = "d_safety_margin_secs")]
    pub safety_margin_secs: i64,
    #[serde(default = "d_cache_size")]
    pub cache_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySource {
    Filesystem,
    Remote,
}

fn d_http_timeout_ms() -> u64 {
    5000
}
fn d_http_retries() -> u32 {
    4
}
fn d_bypass_domains() -> Vec<String> {
    Vec::new()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub source: PolicySource,
    #[serde(default)]
    pub policy_dir: Option<String>,
    #[serde(default)]
    pub policy_urls: Vec<String>,
    #[serde(default = "d_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "d_http_retries")]
    pub http_retries: u32,
    #[serde(default = "d_bypass_domains")]
    pub bypass_domains: Vec<String>,
}

fn d_inactivity_timeout_secs() -> i64 {
    120
}
fn d_min_session_duration_secs() -> i64 {
    10
}
fn d_daily_reset_local_time() -> String {
    "00:00".to_string()
}
fn d_retention_days() -> i64 {
    30
}
fn d_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "d_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: i64,
    #[serde(default = "d_min_session_duration_secs")]
    pub min_session_duration_secs: i64,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default = "d_daily_reset_local_time")]
    pub daily_reset_local_time: String,
    #[serde(default = "d_retention_days")]
    pub retention_days: i64,
    #[serde(default = "d_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn d_http_listen() -> String {
    "0.0.0.0:80".to_string()
}
fn d_https_listen() -> String {
    "0.0.0.0:443".to_string()
}
fn d_dial_timeout_ms() -> u64 {
    10_000
}
fn d_idle_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "d_http_listen")]
    pub http_listen: String,
    #[serde(default = "d_https_listen")]
    pub https_listen: String,
    #[serde(default = "d_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "d_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}
