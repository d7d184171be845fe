//! Answer cache for BYPASS-path DNS responses (spec §4.5), backed by
//! `moka::future::Cache`. INTERCEPT and BLOCK answers are cheap to
//! synthesize and are never cached.

use std::time::Duration;

use hickory_proto::rr::{Record, RecordType};
use moka::future::Cache;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct BypassCacheKey {
    pub qname_lc: String,
    pub qtype: u16,
}

impl BypassCacheKey {
    pub fn new(qname_lc: &str, qtype: RecordType) -> Self {
        Self {
            qname_lc: qname_lc.trim_end_matches('.').to_ascii_lowercase(),
            qtype: qtype.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BypassAnswer {
    pub records: Vec<Record>,
}

pub struct BypassCache {
    answers: Cache<BypassCacheKey, BypassAnswer>,
    ttl_cap: u32,
}

impl BypassCache {
    pub fn new(max_capacity: u64, ttl_cap: u32) -> Self {
        Self {
            answers: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(Duration::from_secs(ttl_cap as u64))
                .build(),
            ttl_cap,
        }
    }

    pub async fn get(&self, key: &BypassCacheKey) -> Option<BypassAnswer> {
        self.answers.get(key).await
    }

    /// Caps every record's TTL to `bypass_ttl_cap` in place (spec §4.5:
    /// "cap each answer's TTL to bypass_ttl_cap"). Callers must apply this
    /// to the records they return to the client, not just the copy handed
    /// to `insert` — the cache only caps what's stored, not what's served.
    pub fn cap_ttl(&self, records: &mut [Record]) {
        for record in records {
            if record.ttl() > self.ttl_cap {
                record.set_ttl(self.ttl_cap);
            }
        }
    }

    pub async fn insert(&self, key: BypassCacheKey, records: Vec<Record>) {
        self.answers.insert(key, BypassAnswer { records }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn a_record(ttl: u32) -> Record {
        Record::from_rdata(Name::from_str("example.com.").unwrap(), ttl, RData::A(A(Ipv4Addr::new(1, 2, 3, 4))))
    }

    #[test]
    fn cap_ttl_lowers_records_above_the_cap() {
        let cache = BypassCache::new(100, 60);
        let mut records = vec![a_record(3600), a_record(10)];
        cache.cap_ttl(&mut records);
        assert_eq!(records[0].ttl(), 60);
        assert_eq!(records[1].ttl(), 10);
    }

    #[tokio::test]
    async fn insert_does_not_mutate_caller_records_independently() {
        // `insert` stores whatever it's handed; capping is the caller's
        // responsibility, applied before both insert and response-building.
        let cache = BypassCache::new(100, 60);
        let mut records = vec![a_record(3600)];
        cache.cap_ttl(&mut records);
        let key = BypassCacheKey::new("example.com", RecordType::A);
        cache.insert(key.clone(), records.clone()).await;

        let cached = cache.get(&key).await.unwrap();
        assert_eq!(cached.records[0].ttl(), 60);
        assert_eq!(records[0].ttl(), 60);
    }
}
