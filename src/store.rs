//! Operational Store (spec §4.7): an abstract key/value/index interface the
//! rest of the core depends on. `InMemoryStore` is one conformant reference
//! implementation so the system is runnable and testable standalone; any
//! other store can be substituted behind the trait.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::errors::KProxyError;

/// An active or recently-closed usage session for a (device, category) pair
/// (spec §4.3's `UsageSession`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u128,
    pub device_id: String,
    pub category: String,
    pub started_at_unix: i64,
    pub last_activity_unix: i64,
    pub accumulated_seconds: i64,
    pub active: bool,
}

/// Aggregated minutes used by a device in a category on a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyUsage {
    pub minutes: i64,
}

#[async_trait]
pub trait OperationalStore: Send + Sync {
    async fn upsert_session(&self, session: Session) -> Result<(), KProxyError>;

    /// Looks up a session row by its opaque id (spec §4.7 `GetSession(id)`).
    async fn get_session(&self, id: u128) -> Result<Option<Session>, KProxyError>;

    async fn list_active_sessions(&self) -> Result<Vec<Session>, KProxyError>;

    /// Removes a session row by its opaque id (spec §4.7 `DeleteSession(id)`).
    async fn delete_session(&self, id: u128) -> Result<(), KProxyError>;

    async fn get_daily_usage(
        &self,
        device_mac: &str,
        category: &str,
        day: NaiveDate,
    ) -> Result<Option<DailyUsage>, KProxyError>;

    async fn increment_daily_usage(
        &self,
        device_mac: &str,
        category: &str,
        day: NaiveDate,
        delta_minutes: i64,
    ) -> Result<(), KProxyError>;

    async fn delete_daily_usage_before(&self, day: NaiveDate) -> Result<u64, KProxyError>;

    async fn lookup_mac_by_ip(&self, ip: IpAddr) -> Result<Option<String>, KProxyError>;

    /// Not part of the core's required surface, but every reference store
    /// needs a way to populate the IP→MAC index for the Fact Gatherer.
    async fn record_mac_for_ip(&self, ip: IpAddr, mac: String) -> Result<(), KProxyError>;
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<u128, Session>,
    daily_usage: HashMap<(String, String, NaiveDate), i64>,
    ip_to_mac: HashMap<IpAddr, String>,
}

/// Mutex-guarded in-memory reference implementation of `OperationalStore`.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperationalStore for InMemoryStore {
    async fn upsert_session(&self, session: Session) -> Result<(), KProxyError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(session.id, session);
        Ok(())
    }

    async fn get_session(&self, id: u128) -> Result<Option<Session>, KProxyError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sessions.get(&id).cloned())
    }

    async fn list_active_sessions(&self) -> Result<Vec<Session>, KProxyError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sessions.values().cloned().collect())
    }

    async fn delete_session(&self, id: u128) -> Result<(), KProxyError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(&id);
        Ok(())
    }

    async fn get_daily_usage(
        &self,
        device_mac: &str,
        category: &str,
        day: NaiveDate,
    ) -> Result<Option<DailyUsage>, KProxyError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .daily_usage
            .get(&(device_mac.to_string(), category.to_string(), day))
            .map(|&minutes| DailyUsage { minutes }))
    }

    async fn increment_daily_usage(
        &self,
        device_mac: &str,
        category: &str,
        day: NaiveDate,
        delta_minutes: i64,
    ) -> Result<(), KProxyError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .daily_usage
            .entry((device_mac.to_string(), category.to_string(), day))
            .or_insert(0);
        *entry += delta_minutes;
        Ok(())
    }

    async fn delete_daily_usage_before(&self, day: NaiveDate) -> Result<u64, KProxyError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.daily_usage.len();
        inner.daily_usage.retain(|(_, _, d), _| *d >= day);
        Ok((before - inner.daily_usage.len()) as u64)
    }

    async fn lookup_mac_by_ip(&self, ip: IpAddr) -> Result<Option<String>, KProxyError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.ip_to_mac.get(&ip).cloned())
    }

    async fn record_mac_for_ip(&self, ip: IpAddr, mac: String) -> Result<(), KProxyError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ip_to_mac.insert(ip, mac);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_round_trips() {
        let store = InMemoryStore::new();
        let session = Session {
            id: 42,
            device_id: "aa:bb".to_string(),
            category: "entertainment".to_string(),
            started_at_unix: 1000,
            last_activity_unix: 1010,
            accumulated_seconds: 10,
            active: true,
        };
        store.upsert_session(session.clone()).await.unwrap();
        let fetched = store.get_session(session.id).await.unwrap();
        assert_eq!(fetched, Some(session.clone()));

        store.delete_session(session.id).await.unwrap();
        assert_eq!(store.get_session(session.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn daily_usage_accumulates_and_purges() {
        let store = InMemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        store.increment_daily_usage("aa:bb", "entertainment", day, 10).await.unwrap();
        store.increment_daily_usage("aa:bb", "entertainment", day, 5).await.unwrap();

        let usage = store.get_daily_usage("aa:bb", "entertainment", day).await.unwrap();
        assert_eq!(usage, Some(DailyUsage { minutes: 15 }));

        let cutoff = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let deleted = store.delete_daily_usage_before(cutoff).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.get_daily_usage("aa:bb", "entertainment", day).await.unwrap(), None);
    }

    #[tokio::test]
    async fn ip_to_mac_lookup() {
        let store = InMemoryStore::new();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(store.lookup_mac_by_ip(ip).await.unwrap(), None);
        store.record_mac_for_ip(ip, "11:22:33".to_string()).await.unwrap();
        assert_eq!(store.lookup_mac_by_ip(ip).await.unwrap(), Some("11:22:33".to_string()));
    }
}
