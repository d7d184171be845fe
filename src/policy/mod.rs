//! Policy Evaluator (spec §4.2): a pure function from facts to a decision,
//! backed by an externally-sourced declarative rule set.

pub mod rules;
pub mod source;

use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use tracing::{error, warn};

use crate::facts::{DnsFact, ProxyFact};
use rules::CompiledRules;
use source::ReloadSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsAction {
    Intercept,
    Bypass,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsDecision {
    pub action: DnsAction,
    pub reason: String,
}

impl DnsDecision {
    fn intercept(reason: impl Into<String>) -> Self {
        Self {
            action: DnsAction::Intercept,
            reason: reason.into(),
        }
    }
    fn bypass(reason: impl Into<String>) -> Self {
        Self {
            action: DnsAction::Bypass,
            reason: reason.into(),
        }
    }
    fn block(reason: impl Into<String>) -> Self {
        Self {
            action: DnsAction::Block,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAction {
    Allow,
    Block,
    Bypass,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyDecision {
    pub action_block: bool,
    pub action: Option<ProxyAction>,
    pub reason: String,
    pub matched_rule_id: String,
    pub category: Option<String>,
    pub inject_timer: bool,
    pub time_remaining_minutes: i64,
    pub usage_limit_id: String,
}

impl ProxyDecision {
    fn new(action: ProxyAction, reason: impl Into<String>) -> Self {
        Self {
            action_block: false,
            action: Some(action),
            reason: reason.into(),
            matched_rule_id: String::new(),
            category: None,
            inject_timer: false,
            time_remaining_minutes: 0,
            usage_limit_id: String::new(),
        }
    }

    pub fn action(&self) -> ProxyAction {
        self.action.unwrap_or(ProxyAction::Block)
    }
}

/// Atomically-swappable compiled rule set plus the two evaluation entry
/// points and reload. Readers never block a reload past snapshot
/// acquisition (spec §5).
pub struct PolicyEvaluator {
    snapshot: RwLock<Arc<CompiledRules>>,
    source: Box<dyn ReloadSource>,
    /// Global bypass domains from `policy.bypass_domains` in `AppConfig`,
    /// merged into every fetched rule document ahead of compilation so they
    /// stay in effect across reloads regardless of what the reload source
    /// itself supplies (spec §6 configuration surface).
    static_bypass_domains: Vec<String>,
}

impl PolicyEvaluator {
    pub async fn load(source: Box<dyn ReloadSource>, static_bypass_domains: Vec<String>) -> anyhow::Result<Self> {
        let mut raw = source.fetch().await?;
        raw.bypass_domains.extend(static_bypass_domains.iter().cloned());
        let compiled = CompiledRules::compile(raw)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(compiled)),
            source,
            static_bypass_domains,
        })
    }

    fn current(&self) -> Arc<CompiledRules> {
        self.snapshot.read().unwrap().clone()
    }

    /// Reload semantics (spec §4.2): either the new set fully compiles and
    /// becomes active, or the previous set is retained and an error is
    /// returned.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let mut raw = self.source.fetch().await?;
        raw.bypass_domains.extend(self.static_bypass_domains.iter().cloned());
        let compiled = CompiledRules::compile(raw)?;
        *self.snapshot.write().unwrap() = Arc::new(compiled);
        Ok(())
    }

    pub fn evaluate_dns(&self, fact: &DnsFact) -> DnsDecision {
        match self.try_evaluate_dns(fact) {
            Ok(decision) => decision,
            Err(e) => {
                error!(error = %e, domain = %fact.qname, "dns evaluation error, falling back to intercept");
                DnsDecision::intercept("evaluator error, safe intercept fallback")
            }
        }
    }

    fn try_evaluate_dns(&self, fact: &DnsFact) -> anyhow::Result<DnsDecision> {
        let rules = self.current();

        if rules.bypass_domains.is_match(&fact.qname) {
            return Ok(DnsDecision::bypass("global bypass domain"));
        }

        let profile = match rules.profile_for(fact.client_mac.as_deref(), fact.client_ip) {
            Some(p) => p,
            None => return Ok(DnsDecision::intercept("no device profile, default intercept")),
        };

        let matching_rule = profile.rules.iter().find(|r| r.domain_patterns.is_match(&fact.qname));

        match (&profile.default_action, matching_rule) {
            (rules::DefaultAction::Bypass, None) => Ok(DnsDecision::bypass("profile default action is bypass")),
            (rules::DefaultAction::Bypass, Some(_)) => Ok(DnsDecision::intercept(
                "profile has matching rule requiring proxy evaluation",
            )),
            (rules::DefaultAction::Block, Some(rule)) if rule.action == rules::RuleAction::Bypass => {
                Ok(DnsDecision::bypass("matching rule action is bypass"))
            }
            (_, Some(rule)) if rule.action == rules::RuleAction::Bypass => {
                Ok(DnsDecision::bypass("matching rule action is bypass"))
            }
            _ => Ok(DnsDecision::intercept("default intercept")),
        }
    }

    pub fn evaluate_proxy(&self, fact: &ProxyFact) -> ProxyDecision {
        match self.try_evaluate_proxy(fact) {
            Ok(decision) => decision,
            Err(e) => {
                error!(error = %e, host = %fact.host, "proxy evaluation error, fail-closed block");
                ProxyDecision::new(ProxyAction::Block, "evaluator error, fail-closed block")
            }
        }
    }

    fn try_evaluate_proxy(&self, fact: &ProxyFact) -> anyhow::Result<ProxyDecision> {
        let rules = self.current();

        let profile = match rules.profile_for(fact.client_mac.as_deref(), fact.client_ip) {
            Some(p) => p,
            None => return Ok(ProxyDecision::new(ProxyAction::Block, "no device")),
        };

        let mut candidates: Vec<&rules::Rule> = profile
            .rules
            .iter()
            .filter(|r| r.domain_patterns.is_match(&fact.host) && r.path_patterns.is_match(&fact.path))
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        let matched = match candidates.first() {
            Some(rule) => *rule,
            None => return Ok(self.apply_default(&profile.default_action)),
        };

        if !matched.time_windows.is_empty() && !matched.time_windows.iter().any(|w| w.contains(fact.time)) {
            return Ok(ProxyDecision::new(ProxyAction::Block, "outside allowed hours"));
        }

        match matched.action {
            rules::RuleAction::Block => {
                let mut decision = ProxyDecision::new(ProxyAction::Block, "matched rule action is block");
                decision.matched_rule_id = matched.id.clone();
                Ok(decision)
            }
            rules::RuleAction::Bypass => {
                let mut decision = ProxyDecision::new(ProxyAction::Bypass, "matched rule action is bypass");
                decision.matched_rule_id = matched.id.clone();
                Ok(decision)
            }
            rules::RuleAction::Allow => {
                let mut decision = ProxyDecision::new(ProxyAction::Allow, "matched rule action is allow");
                decision.matched_rule_id = matched.id.clone();
                decision.category = matched.category.clone();
                decision.inject_timer = matched.category.is_some() && matched.usage_limit_minutes.is_some();

                if let (Some(category), Some(limit)) = (&matched.category, matched.usage_limit_minutes) {
                    let today = fact
                        .today_minutes_by_category
                        .iter()
                        .find(|(c, _)| c == category)
                        .map(|(_, m)| *m)
                        .unwrap_or(0);
                    decision.usage_limit_id = format!("{category}:{limit}");
                    if today >= *limit {
                        return Ok(ProxyDecision {
                            action_block: false,
                            action: Some(ProxyAction::Block),
                            reason: "usage limit exceeded".to_string(),
                            matched_rule_id: matched.id.clone(),
                            category: Some(category.clone()),
                            inject_timer: false,
                            time_remaining_minutes: 0,
                            usage_limit_id: format!("{category}:{limit}"),
                        });
                    }
                    decision.time_remaining_minutes = (limit - today).max(0);
                }

                Ok(decision)
            }
        }
    }

    fn apply_default(&self, default_action: &rules::DefaultAction) -> ProxyDecision {
        match default_action {
            rules::DefaultAction::Allow => ProxyDecision::new(ProxyAction::Allow, "profile default action"),
            rules::DefaultAction::Bypass => ProxyDecision::new(ProxyAction::Bypass, "profile default action"),
            rules::DefaultAction::Block => ProxyDecision::new(ProxyAction::Block, "profile default action"),
        }
    }
}

/// Device identity resolution used by both evaluation paths: MAC preferred,
/// else exact IP, else CIDR containment (spec §4.2 step 1).
pub(crate) fn resolve_device<'a>(
    rules: &'a CompiledRules,
    mac: Option<&str>,
    ip: IpAddr,
) -> Option<&'a rules::DeviceRule> {
    if let Some(mac) = mac {
        if let Some(d) = rules.device_rules.iter().find(|d| d.mac.as_deref() == Some(mac)) {
            return Some(d);
        }
    }
    if let Some(d) = rules.device_rules.iter().find(|d| d.ip == Some(ip)) {
        return Some(d);
    }
    rules
        .device_rules
        .iter()
        .find(|d| d.cidrs.iter().any(|net| crate::domain_match::cidr_contains(net, ip)))
}

pub(crate) fn warn_storage_fallback(context: &str, err: &anyhow::Error) {
    warn!(error = %err, context, "storage read failed, treating as default");
}
