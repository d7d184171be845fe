// End-to-end policy evaluator scenarios, exercised through the crate's
// public API.

use std::net::{IpAddr, Ipv4Addr};

use kproxy::clock::WallClockTime;
use kproxy::facts::{DnsFact, ProxyFact};
use kproxy::policy::rules::RawRuleDocument;
use kproxy::policy::source::ReloadSource;
use kproxy::policy::{DnsAction, PolicyEvaluator, ProxyAction};

struct StaticSource(String);

#[async_trait::async_trait]
impl ReloadSource for StaticSource {
    async fn fetch(&self) -> anyhow::Result<RawRuleDocument> {
        toml::from_str(&self.0).map_err(Into::into)
    }
}

async fn evaluator(doc: &str) -> PolicyEvaluator {
    PolicyEvaluator::load(Box::new(StaticSource(doc.to_string())), Vec::new()).await.unwrap()
}

fn dns_fact(ip: &str, domain: &str) -> DnsFact {
    DnsFact {
        qname: domain.to_string(),
        client_ip: ip.parse().unwrap(),
        client_mac: None,
        time: WallClockTime {
            day_of_week: 2,
            hour: 10,
            minute: 0,
        },
    }
}

fn proxy_fact(mac: &str, host: &str, hour: u8) -> ProxyFact {
    ProxyFact {
        host: host.to_string(),
        path: "/".to_string(),
        client_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 50, 1)),
        client_mac: Some(mac.to_string()),
        device_id: mac.to_string(),
        time: WallClockTime {
            day_of_week: 2,
            hour,
            minute: 0,
        },
        today_minutes_by_category: vec![("entertainment".to_string(), 45)],
    }
}

#[tokio::test]
async fn global_bypass_domains_require_wildcard_label_prefix() {
    let doc = r#"
bypass_domains = ["ocsp.apple.com", "*.ocsp.digicert.com", ".crl.example.com"]
"#;
    let eval = evaluator(doc).await;

    let d1 = eval.evaluate_dns(&dns_fact("192.168.1.100", "ocsp.apple.com"));
    assert_eq!(d1.action, DnsAction::Bypass);
    assert_eq!(d1.reason, "global bypass domain");

    let d2 = eval.evaluate_dns(&dns_fact("192.168.1.100", "api.ocsp.digicert.com"));
    assert_eq!(d2.action, DnsAction::Bypass);

    // The wildcard pattern requires a label prefix; the bare apex doesn't
    // match it and there's no device profile either, so default intercept.
    let d3 = eval.evaluate_dns(&dns_fact("192.168.1.100", "ocsp.digicert.com"));
    assert_eq!(d3.action, DnsAction::Intercept);
}

#[tokio::test]
async fn bypass_profile_with_matching_rule_still_intercepts() {
    let doc = r#"
[[devices]]
cidr = "192.168.1.0/24"
profile = "open"

[[profiles]]
name = "open"
default_action = "bypass"

[[profiles.rules]]
id = "block-github"
action = "block"
domains = ["github.com", "*.github.com"]
"#;
    let eval = evaluator(doc).await;

    let intercepted = eval.evaluate_dns(&dns_fact("192.168.1.50", "github.com"));
    assert_eq!(intercepted.action, DnsAction::Intercept);
    assert_eq!(intercepted.reason, "profile has matching rule requiring proxy evaluation");

    let bypassed = eval.evaluate_dns(&dns_fact("192.168.1.50", "other.com"));
    assert_eq!(bypassed.action, DnsAction::Bypass);
    assert_eq!(bypassed.reason, "profile default action is bypass");
}

#[tokio::test]
async fn higher_priority_rule_wins_over_broader_wildcard() {
    let doc = r#"
[[devices]]
mac = "aa:bb:cc:dd:ee:ff"
profile = "family"

[[profiles]]
name = "family"
default_action = "block"

[[profiles.rules]]
id = "block-specific"
priority = 200
action = "block"
domains = ["blocked.example.com"]

[[profiles.rules]]
id = "allow-wildcard"
priority = 100
action = "allow"
domains = ["*.example.com"]
"#;
    let eval = evaluator(doc).await;

    let blocked = eval.evaluate_proxy(&proxy_fact("aa:bb:cc:dd:ee:ff", "blocked.example.com", 10));
    assert_eq!(blocked.action(), ProxyAction::Block);

    let allowed = eval.evaluate_proxy(&proxy_fact("aa:bb:cc:dd:ee:ff", "www.example.com", 10));
    assert_eq!(allowed.action(), ProxyAction::Allow);

    // Bare apex matches neither rule, falls through to the profile default.
    let fallback = eval.evaluate_proxy(&proxy_fact("aa:bb:cc:dd:ee:ff", "example.com", 10));
    assert_eq!(fallback.action(), ProxyAction::Block);
}

#[tokio::test]
async fn time_window_gates_the_matching_rule_only() {
    let doc = r#"
[[devices]]
mac = "aa:bb:cc:dd:ee:ff"
profile = "family"

[[profiles]]
name = "family"
default_action = "block"

[[profiles.rules]]
id = "daytime-allow"
action = "allow"
domains = [".example.com"]

[[profiles.rules.time_windows]]
days = [0, 1, 2, 3, 4, 5, 6]
start_hour = 6
end_hour = 23
"#;
    let eval = evaluator(doc).await;

    let daytime = eval.evaluate_proxy(&proxy_fact("aa:bb:cc:dd:ee:ff", "www.example.com", 10));
    assert_eq!(daytime.action(), ProxyAction::Allow);

    let early = eval.evaluate_proxy(&proxy_fact("aa:bb:cc:dd:ee:ff", "www.example.com", 5));
    assert_eq!(early.action(), ProxyAction::Block);
    assert_eq!(early.reason, "outside allowed hours");

    // A host with no matching rule at all reports the profile default
    // reason, not the time-window reason.
    let other = eval.evaluate_proxy(&proxy_fact("aa:bb:cc:dd:ee:ff", "other.com", 5));
    assert_eq!(other.action(), ProxyAction::Block);
    assert_eq!(other.reason, "profile default action");
}

#[tokio::test]
async fn usage_limit_exactly_at_the_cap_counts_as_exceeded() {
    let doc = r#"
[[devices]]
mac = "aa:bb:cc:dd:ee:ff"
profile = "family"

[[profiles]]
name = "family"
default_action = "block"

[[profiles.rules]]
id = "games"
action = "allow"
domains = [".games.example"]
category = "entertainment"
usage_limit_minutes = 45
"#;
    let eval = evaluator(doc).await;
    let at_cap = eval.evaluate_proxy(&proxy_fact("aa:bb:cc:dd:ee:ff", "www.games.example", 10));
    assert_eq!(at_cap.action(), ProxyAction::Block);
    assert_eq!(at_cap.reason, "usage limit exceeded");
}
