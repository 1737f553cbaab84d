//! # footfall-tracker: Session-aware ingestion for `Footfall`
//!
//! Turns HTTP requests into rows for an append-only analytics store:
//!
//! ```text
//! request -> filter -> fingerprint -> SessionCache -> SessionWriter -> channel -> workers -> Store
//! ```
//!
//! - [`Tracker`] runs the pipeline. Tracking calls are synchronous up to the
//!   channel; workers batch rows and write them in the background.
//! - [`SessionCache`] keeps the latest state of every live session in two
//!   generations and falls back to the store on a miss.
//! - [`SessionWriter`] versions sessions with signed rows: every change is a
//!   retraction of the previous row plus a replacement.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use footfall_store::{MemoryStore, Store};
//! use footfall_tracker::{HitOptions, HitRequest, Tracker, TrackerConfig};
//!
//! let store = Arc::new(MemoryStore::new());
//! let tracker = Tracker::new(store.clone() as Arc<dyn Store>, TrackerConfig::default()).unwrap();
//!
//! let request = HitRequest::new("/pricing", "203.0.113.7:51234")
//!     .with_header("User-Agent", "Mozilla/5.0 (X11; Linux x86_64) Firefox/125.0");
//! tracker.page_view(&request, &HitOptions::for_client(1u64));
//! tracker.stop();
//!
//! assert_eq!(store.page_views().len(), 1);
//! ```

mod cache;
mod classify;
mod clock;
mod config;
mod error;
mod filter;
mod ip;
mod request;
mod tracker;
mod worker;
mod writer;

pub use cache::{KeyLock, SessionCache, SessionState};
pub use classify::{
    GeoLookup, HostReferrerClassifier, QueryUtmExtractor, Referrer, ReferrerClassifier,
    UnknownUserAgent, UserAgentInfo, UserAgentParser, UtmExtractor, language, screen_class,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DEFAULT_BOT_MIN_DELAY, DEFAULT_BOT_THRESHOLD, DEFAULT_FLUSH_TIMEOUT, DEFAULT_SESSION_MAX_AGE,
    DEFAULT_WORKER_BUFFER_SIZE, MAX_FLUSH_TIMEOUT, MAX_SESSION_MAX_AGE, MIN_SESSION_MAX_AGE,
    TrackerConfig,
};
pub use error::{Result, TrackerError};
pub use filter::{IgnoreReason, ignore_request};
pub use ip::client_ip;
pub use request::{EventOptions, HitOptions, HitRequest};
pub use tracker::{MAX_PATH_LEN, MAX_TITLE_LEN, Tracker, TrackerBuilder};
pub use writer::{Hit, HitKind, Outcome, SessionUpdate, SessionWriter};
