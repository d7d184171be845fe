//! Fact Gatherer (spec §4.1).
//!
//! Assembles the immutable input facts the Policy Evaluator reasons over.
//! Time is read from an injectable `Clock` so policy decisions stay
//! deterministic under test.

use std::net::IpAddr;
use std::sync::Arc;

use crate::clock::{Clock, WallClockTime};
use crate::store::OperationalStore;

/// Facts gathered for a single DNS question.
#[derive(Debug, Clone)]
pub struct DnsFact {
    pub qname: String,
    pub client_ip: IpAddr,
    pub client_mac: Option<String>,
    pub time: WallClockTime,
}

/// Facts gathered for a single proxied HTTP(S) request.
#[derive(Debug, Clone)]
pub struct ProxyFact {
    pub host: String,
    pub path: String,
    pub client_ip: IpAddr,
    pub client_mac: Option<String>,
    /// Device identity for usage accounting: MAC when known, else the
    /// client IP (spec §3 Data Model: "derived from MAC (preferred) else
    /// client IP"). The Usage Tracker and daily-usage lookups key on this,
    /// not on `client_mac` directly, so IP-only devices still accrue usage.
    pub device_id: String,
    pub time: WallClockTime,
    /// Minutes already used today per configured category, used by the
    /// Policy Evaluator to enforce daily usage limits (spec §4.3).
    pub today_minutes_by_category: Vec<(String, i64)>,
}

pub struct FactGatherer {
    clock: Arc<dyn Clock>,
    store: Arc<dyn OperationalStore>,
    categories: Vec<String>,
}

impl FactGatherer {
    pub fn new(clock: Arc<dyn Clock>, store: Arc<dyn OperationalStore>, categories: Vec<String>) -> Self {
        Self {
            clock,
            store,
            categories,
        }
    }

    pub async fn build_dns_fact(&self, qname: &str, client_ip: IpAddr) -> DnsFact {
        let client_mac = self.store.lookup_mac_by_ip(client_ip).await.ok().flatten();
        DnsFact {
            qname: qname.to_string(),
            client_ip,
            client_mac,
            time: self.clock.wall_clock_time(),
        }
    }

    pub async fn build_proxy_fact(&self, host: &str, path: &str, client_ip: IpAddr) -> ProxyFact {
        let client_mac = self.store.lookup_mac_by_ip(client_ip).await.ok().flatten();
        let device_id = client_mac.clone().unwrap_or_else(|| client_ip.to_string());

        let today = self.clock.now().date_naive();
        let mut today_minutes_by_category = Vec::with_capacity(self.categories.len());
        for category in &self.categories {
            let minutes = self
                .store
                .get_daily_usage(&device_id, category, today)
                .await
                .ok()
                .flatten()
                .map(|d| d.minutes)
                .unwrap_or(0);
            today_minutes_by_category.push((category.clone(), minutes));
        }

        ProxyFact {
            host: host.to_string(),
            path: path.to_string(),
            client_ip,
            client_mac,
            device_id,
            time: self.clock.wall_clock_time(),
            today_minutes_by_category,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::InMemoryStore;
    use chrono::{Local, TimeZone};

    #[tokio::test]
    async fn dns_fact_carries_wall_clock_and_mac_lookup() {
        let dt = Local.with_ymd_and_hms(2024, 1, 7, 14, 0, 0).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(dt));
        let store: Arc<dyn OperationalStore> = Arc::new(InMemoryStore::new());
        let ip: IpAddr = "192.168.1.50".parse().unwrap();
        store
            .record_mac_for_ip(ip, "aa:bb:cc:dd:ee:ff".to_string())
            .await
            .unwrap();

        let gatherer = FactGatherer::new(clock, store, vec!["entertainment".to_string()]);
        let fact = gatherer.build_dns_fact("example.com", ip).await;

        assert_eq!(fact.qname, "example.com");
        assert_eq!(fact.client_mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(fact.time.day_of_week, 0);
        assert_eq!(fact.time.hour, 14);
    }

    #[tokio::test]
    async fn proxy_fact_reports_zero_minutes_when_mac_unknown() {
        let dt = Local.now();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(dt));
        let store: Arc<dyn OperationalStore> = Arc::new(InMemoryStore::new());
        let ip: IpAddr = "10.0.0.7".parse().unwrap();

        let gatherer = FactGatherer::new(clock, store, vec!["entertainment".to_string()]);
        let fact = gatherer.build_proxy_fact("example.com", "/", ip).await;

        assert_eq!(fact.device_id, "10.0.0.7");
        assert_eq!(fact.today_minutes_by_category, vec![("entertainment".to_string(), 0)]);
    }

    #[tokio::test]
    async fn device_id_falls_back_to_client_ip_and_reads_its_own_usage() {
        let dt = Local.now();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(dt));
        let store: Arc<dyn OperationalStore> = Arc::new(InMemoryStore::new());
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        let today = dt.date_naive();
        store
            .increment_daily_usage(&ip.to_string(), "entertainment", today, 7)
            .await
            .unwrap();

        let gatherer = FactGatherer::new(clock, store, vec!["entertainment".to_string()]);
        let fact = gatherer.build_proxy_fact("example.com", "/", ip).await;

        assert_eq!(fact.client_mac, None);
        assert_eq!(fact.device_id, "10.0.0.9");
        assert_eq!(fact.today_minutes_by_category, vec![("entertainment".to_string(), 7)]);
    }
}
