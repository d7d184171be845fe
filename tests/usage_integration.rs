// Cross-module scenario: a finalized Usage Tracker session is visible to
// the Fact Gatherer's `today_minutes_by_category`, which is what the
// Policy Evaluator reads to enforce daily usage limits end to end.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone};

use kproxy::clock::Clock;
use kproxy::facts::FactGatherer;
use kproxy::store::{InMemoryStore, OperationalStore};
use kproxy::usage::{UsageTracker, UsageTrackerConfig};

struct SteppingClock {
    base: DateTime<Local>,
    offset_secs: AtomicI64,
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Local> {
        self.base + ChronoDuration::seconds(self.offset_secs.load(Ordering::SeqCst))
    }
}

#[tokio::test]
async fn finalized_session_surfaces_in_the_next_fact_gathering_pass() {
    let clock = Arc::new(SteppingClock {
        base: Local.with_ymd_and_hms(2024, 1, 7, 10, 0, 0).unwrap(),
        offset_secs: AtomicI64::new(0),
    });
    let store: Arc<dyn OperationalStore> = Arc::new(InMemoryStore::new());
    let ip = "192.168.1.77".parse().unwrap();
    store.record_mac_for_ip(ip, "aa:bb:cc:dd:ee:ff".to_string()).await.unwrap();

    let tracker = UsageTracker::new(
        clock.clone(),
        store.clone(),
        UsageTrackerConfig {
            inactivity_timeout_secs: 120,
            min_session_duration_secs: 10,
            retention_days: 30,
        },
    );
    let gatherer = FactGatherer::new(clock.clone(), store.clone(), vec!["entertainment".to_string()]);

    let before = gatherer.build_proxy_fact("games.example", "/", ip).await;
    assert_eq!(before.today_minutes_by_category, vec![("entertainment".to_string(), 0)]);

    // Three activity bumps 100s apart accumulate 300s of session time
    // (each gap stays within the 120s inactivity timeout).
    tracker.record_activity("aa:bb:cc:dd:ee:ff", "entertainment").await;
    for offset in [100, 200, 300] {
        clock.offset_secs.store(offset, Ordering::SeqCst);
        tracker.record_activity("aa:bb:cc:dd:ee:ff", "entertainment").await;
    }
    tracker.shutdown().await;

    let after = gatherer.build_proxy_fact("games.example", "/", ip).await;
    assert_eq!(after.today_minutes_by_category, vec![("entertainment".to_string(), 5)]);
}
