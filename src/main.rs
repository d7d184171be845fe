use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use kproxy::ca::{CertificateAuthority, CertificateAuthorityConfig};
use kproxy::clock::{Clock, SystemClock};
use kproxy::config::{AppConfig, PolicySource};
use kproxy::dns::cache::BypassCache;
use kproxy::dns::upstream::build_upstream_resolver;
use kproxy::dns::{DnsServer, DnsServerConfig};
use kproxy::facts::FactGatherer;
use kproxy::policy::source::{FilesystemSource, ReloadSource, RemoteSource};
use kproxy::policy::PolicyEvaluator;
use kproxy::proxy::{ProxyServer, ProxyServerConfig};
use kproxy::store::{InMemoryStore, OperationalStore};
use kproxy::usage::{UsageTracker, UsageTrackerConfig};

#[derive(Parser, Debug)]
#[command(name = "kproxy", about = "Transparent HTTP/HTTPS interception proxy with an embedded DNS server")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/example.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli.config).with_context(|| format!("failed to read config: {}", cli.config))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn OperationalStore> = Arc::new(InMemoryStore::new());

    let usage_tracker = Arc::new(UsageTracker::new(
        clock.clone(),
        store.clone(),
        UsageTrackerConfig {
            inactivity_timeout_secs: cfg.usage.inactivity_timeout_secs,
            min_session_duration_secs: cfg.usage.min_session_duration_secs,
            retention_days: cfg.usage.retention_days,
        },
    ));

    let facts = Arc::new(FactGatherer::new(clock.clone(), store.clone(), cfg.usage.categories.clone()));

    let policy_source: Box<dyn ReloadSource> = match cfg.policy.source {
        PolicySource::Filesystem => Box::new(FilesystemSource::new(
            cfg.policy
                .policy_dir
                .clone()
                .expect("validated present by AppConfig::validate"),
        )),
        PolicySource::Remote => Box::new(RemoteSource::new(
            cfg.policy.policy_urls.clone(),
            Duration::from_millis(cfg.policy.http_timeout_ms),
            cfg.policy.http_retries,
        )?),
    };
    let evaluator = Arc::new(
        PolicyEvaluator::load(policy_source, cfg.policy.bypass_domains.clone())
            .await
            .context("loading initial policy rules")?,
    );

    spawn_reload_on_sighup(evaluator.clone());
    spawn_usage_sweepers(
        usage_tracker.clone(),
        cfg.usage.sweep_interval_secs,
        clock.clone(),
        cfg.usage.daily_reset_local_time.clone(),
    );

    let ca = Arc::new(
        CertificateAuthority::load(
            CertificateAuthorityConfig {
                root_cert_path: cfg.tls.root_cert_path.clone(),
                root_key_path: cfg.tls.root_key_path.clone(),
                intermediate_cert_path: cfg.tls.intermediate_cert_path.clone(),
                intermediate_key_path: cfg.tls.intermediate_key_path.clone(),
                leaf_validity_secs: cfg.tls.leaf_validity_secs,
                leaf_skew_secs: cfg.tls.leaf_skew_secs,
                safety_margin_secs: cfg.tls.safety_margin_secs,
                cache_size: cfg.tls.cache_size,
            },
            clock.clone(),
        )
        .await
        .context("loading certificate authority")?,
    );

    let upstream = build_upstream_resolver(&cfg.dns.upstream_servers, Duration::from_millis(cfg.dns.timeout_ms))
        .await
        .context("building upstream DNS resolver")?;
    let bypass_cache = BypassCache::new(cfg.dns.answer_cache_size, cfg.dns.bypass_ttl_cap);

    let proxy_ip: Ipv4Addr = cfg.dns.proxy_ip;
    let dns_server = DnsServer::new(
        facts.clone(),
        evaluator.clone(),
        upstream,
        bypass_cache,
        DnsServerConfig {
            proxy_ip,
            intercept_ttl: cfg.dns.intercept_ttl,
            bypass_ttl_cap: cfg.dns.bypass_ttl_cap,
            block_ttl: cfg.dns.block_ttl,
            intercept_fallback: cfg.dns.intercept_fallback,
            enable_udp: cfg.dns.enable_udp,
            enable_tcp: cfg.dns.enable_tcp,
        },
    );

    let proxy_server = Arc::new(ProxyServer::new(
        facts.clone(),
        evaluator.clone(),
        usage_tracker.clone(),
        ca,
        clock.clone(),
        ProxyServerConfig {
            http_listen: cfg.proxy.http_listen.parse()?,
            https_listen: cfg.proxy.https_listen.parse()?,
            dial_timeout: Duration::from_millis(cfg.proxy.dial_timeout_ms),
        },
    )?);

    let udp = cfg.dns.listen_addr.parse()?;
    let tcp = cfg.dns.listen_addr.parse()?;
    tracing::info!(%udp, %tcp, "starting dns server");
    let dns_task = tokio::spawn(async move { dns_server.serve(udp, tcp).await });

    tracing::info!(http = %cfg.proxy.http_listen, https = %cfg.proxy.https_listen, "starting proxy server");
    let proxy_task = tokio::spawn(async move { proxy_server.serve().await });

    tokio::select! {
        res = dns_task => {
            tracing::error!("dns server exited");
            res??;
        }
        res = proxy_task => {
            tracing::error!("proxy server exited");
            res??;
        }
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received, finalizing usage sessions");
            usage_tracker.shutdown().await;
        }
    }

    Ok(())
}

/// Reloads the policy rule set on SIGHUP (spec §6 "Process lifecycle
/// signals"). Failed reloads keep the previous rule set active.
fn spawn_reload_on_sighup(evaluator: Arc<PolicyEvaluator>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGHUP handler, policy reload on signal disabled");
                return;
            }
        };
        loop {
            sighup.recv().await;
            tracing::info!("SIGHUP received, reloading policy rules");
            if let Err(e) = evaluator.reload().await {
                tracing::error!(error = %e, "policy reload failed, previous rule set retained");
            }
        }
    });
}

/// Spawns the inactivity sweep (fixed cadence) and the retention sweep,
/// the latter anchored to `usage.daily_reset_local_time` (spec §4.3/§6:
/// retention runs "at a configurable daily time", not from process start).
fn spawn_usage_sweepers(tracker: Arc<UsageTracker>, interval_secs: u64, clock: Arc<dyn Clock>, daily_reset_local_time: String) {
    let inactive_tracker = tracker.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            inactive_tracker.sweep_inactive().await;
        }
    });

    tokio::spawn(async move {
        let (reset_hour, reset_minute) = parse_daily_reset_time(&daily_reset_local_time).unwrap_or_else(|| {
            tracing::warn!(
                value = daily_reset_local_time,
                "invalid usage.daily_reset_local_time, defaulting to 00:00"
            );
            (0, 0)
        });

        tokio::time::sleep(delay_until_next_occurrence(clock.as_ref(), reset_hour, reset_minute)).await;
        let mut ticker = tokio::time::interval(Duration::from_secs(24 * 3600));
        loop {
            ticker.tick().await;
            tracker.sweep_retention().await;
        }
    });
}

/// Parses an `"HH:MM"` 24-hour time-of-day string.
fn parse_daily_reset_time(value: &str) -> Option<(u32, u32)> {
    let (h, m) = value.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// Duration from `clock.now()` until the next local occurrence of
/// `hour:minute`, today if it hasn't passed yet, tomorrow otherwise.
fn delay_until_next_occurrence(clock: &dyn Clock, hour: u32, minute: u32) -> Duration {
    use chrono::{Duration as ChronoDuration, NaiveTime};

    let now = clock.now();
    let target_time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    let mut target = now.date_naive().and_time(target_time);
    if target <= now.naive_local() {
        target += ChronoDuration::days(1);
    }
    let delta = target - now.naive_local();
    Duration::from_secs(delta.num_seconds().max(0) as u64)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
