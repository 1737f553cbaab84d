//! Shared fixtures for tracker integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use footfall_crypto::FingerprintKeys;
use footfall_store::{MemoryStore, Store};
use footfall_tracker::{HitOptions, HitRequest, ManualClock, Tracker, TrackerConfig};

pub const BROWSER: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0";

pub const CLIENT: u64 = 1;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap()
}

/// Two workers, fixed keys and a flush timeout long enough that only
/// explicit flushes and stops write.
pub fn config() -> TrackerConfig {
    TrackerConfig {
        workers: 2,
        flush_timeout: Duration::from_secs(60),
        salt: "integration".to_string(),
        keys: Some(FingerprintKeys::new(7, 11)),
        ..TrackerConfig::default()
    }
}

/// A page request from visitor number `visitor` (one IP per visitor).
pub fn request(visitor: u32, path: &str) -> HitRequest {
    HitRequest::new(path, format!("198.51.{}.{}:40000", visitor / 250, visitor % 250 + 1))
        .with_header("User-Agent", BROWSER)
        .with_header("Host", "footfall.example")
}

pub fn options() -> HitOptions {
    HitOptions::for_client(CLIENT)
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
    pub tracker: Tracker,
}

impl Harness {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_start(config, start_time())
    }

    pub fn with_start(config: TrackerConfig, start: DateTime<Utc>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(start);
        let tracker = Tracker::builder(Arc::clone(&store) as Arc<dyn Store>)
            .config(config)
            .clock(Arc::new(clock.clone()))
            .build()
            .expect("tracker starts");

        Self {
            store,
            clock,
            tracker,
        }
    }

    pub fn visit(&self, visitor: u32, path: &str) {
        self.tracker.page_view(&request(visitor, path), &options());
    }

    pub fn advance(&self, delta: TimeDelta) {
        self.clock.advance(delta);
    }

    /// Asserts that every written session collapses to exactly one row.
    pub fn assert_consistent(&self) {
        assert_eq!(self.store.unmatched_cancellations(), 0);
        for (key, sum) in self.store.sign_sums() {
            assert_eq!(sum, 1, "sign sum of {key:?}");
        }
    }
}
