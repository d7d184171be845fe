//! Declarative rule schema and compilation (spec §4.2, §9 "Dynamic
//! dispatch"). The core's evaluator interface leaves the rule language
//! unspecified; this module supplies one conformant TOML-based language,
//! not the only possible one.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::Deserialize;

use crate::clock::WallClockTime;
use crate::domain_match::{compile_cidrs, DomainPatternSet, PathPatternSet};

/// The raw, serde-deserialized shape of a rule document before compilation.
/// Filesystem sources merge one document per file; remote sources merge one
/// document per URL.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRuleDocument {
    #[serde(default)]
    pub bypass_domains: Vec<String>,
    #[serde(default)]
    pub devices: Vec<RawDevice>,
    #[serde(default)]
    pub profiles: Vec<RawProfile>,
}

impl RawRuleDocument {
    pub fn merge(mut self, other: RawRuleDocument) -> Self {
        self.bypass_domains.extend(other.bypass_domains);
        self.devices.extend(other.devices);
        self.profiles.extend(other.profiles);
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDevice {
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub cidr: Option<String>,
    pub profile: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawProfile {
    pub name: String,
    pub default_action: DefaultAction,
    #[serde(default)]
    pub rules: Vec<RawRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRule {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    pub action: RuleAction,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub usage_limit_minutes: Option<i64>,
    #[serde(default)]
    pub time_windows: Vec<RawTimeWindow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTimeWindow {
    pub days: Vec<u8>,
    pub start_hour: u8,
    pub end_hour: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    Allow,
    Bypass,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Bypass,
    Block,
}

/// A compiled time restriction window (spec §4.2 step 3).
#[derive(Debug, Clone)]
pub struct TimeWindow {
    pub days: Vec<u8>,
    pub start_hour: u8,
    pub end_hour: u8,
}

impl TimeWindow {
    pub fn contains(&self, time: WallClockTime) -> bool {
        self.days.contains(&time.day_of_week) && time.hour >= self.start_hour && time.hour < self.end_hour
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub priority: i32,
    pub domain_patterns: DomainPatternSet,
    pub path_patterns: PathPatternSet,
    pub action: RuleAction,
    pub category: Option<String>,
    pub usage_limit_minutes: Option<i64>,
    pub time_windows: Vec<TimeWindow>,
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub default_action: DefaultAction,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
pub struct DeviceRule {
    pub mac: Option<String>,
    pub ip: Option<IpAddr>,
    pub cidrs: Vec<IpNet>,
    pub profile: String,
}

/// The atomically-swappable compiled snapshot the evaluator reads from.
pub struct CompiledRules {
    pub bypass_domains: DomainPatternSet,
    pub device_rules: Vec<DeviceRule>,
    pub profiles: HashMap<String, Profile>,
}

impl CompiledRules {
    pub fn compile(raw: RawRuleDocument) -> anyhow::Result<Self> {
        let bypass_domains = DomainPatternSet::compile(&raw.bypass_domains);

        let mut device_rules = Vec::with_capacity(raw.devices.len());
        for d in raw.devices {
            let ip = d.ip.as_deref().and_then(|s| s.parse().ok());
            let cidrs = d.cidr.as_deref().map(|s| compile_cidrs(&[s.to_string()])).unwrap_or_default();
            device_rules.push(DeviceRule {
                mac: d.mac.map(|m| m.to_ascii_lowercase()),
                ip,
                cidrs,
                profile: d.profile,
            });
        }

        let mut profiles = HashMap::with_capacity(raw.profiles.len());
        for p in raw.profiles {
            let mut rules = Vec::with_capacity(p.rules.len());
            for r in p.rules {
                let time_windows = r
                    .time_windows
                    .into_iter()
                    .map(|w| TimeWindow {
                        days: w.days,
                        start_hour: w.start_hour,
                        end_hour: w.end_hour,
                    })
                    .collect();
                rules.push(Rule {
                    id: r.id,
                    priority: r.priority,
                    domain_patterns: DomainPatternSet::compile(&r.domains),
                    path_patterns: PathPatternSet::compile(&r.paths),
                    action: r.action,
                    category: r.category,
                    usage_limit_minutes: r.usage_limit_minutes,
                    time_windows,
                });
            }
            profiles.insert(
                p.name,
                Profile {
                    default_action: p.default_action,
                    rules,
                },
            );
        }

        Ok(Self {
            bypass_domains,
            device_rules,
            profiles,
        })
    }

    pub fn profile_for(&self, mac: Option<&str>, ip: IpAddr) -> Option<&Profile> {
        let device = crate::policy::resolve_device(self, mac, ip)?;
        self.profiles.get(&device.profile)
    }
}
