//! Runtime configuration for a [`Tracker`](crate::Tracker).

use std::thread;
use std::time::Duration;

use footfall_config::FootfallConfig;
use footfall_crypto::FingerprintKeys;

/// Default rows a worker collects before writing.
pub const DEFAULT_WORKER_BUFFER_SIZE: usize = 500;
/// Default time after which a worker writes whatever it has collected.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound of the flush timeout.
pub const MAX_FLUSH_TIMEOUT: Duration = Duration::from_secs(60);
/// Default maximum gap between two hits of one session.
pub const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(15 * 60);
pub const MIN_SESSION_MAX_AGE: Duration = Duration::from_secs(60);
pub const MAX_SESSION_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Headroom above the minimum cleanup interval.
const CLEANUP_INTERVAL_HEADROOM: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_BOT_MIN_DELAY: Duration = Duration::from_millis(75);
pub const DEFAULT_BOT_THRESHOLD: u8 = 5;

/// Tracker configuration.
///
/// Zero values mean "use the default" (or "derive" for the cleanup
/// interval). [`validate`](Self::validate) resolves them and clamps
/// everything into its valid band; the tracker always runs on a validated
/// copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Worker threads; 0 uses the number of logical CPUs.
    pub workers: usize,
    /// Rows a worker collects before writing a batch.
    pub worker_buffer_size: usize,
    pub flush_timeout: Duration,
    pub session_max_age: Duration,
    /// Interval of the session cache generation swap; zero derives it from
    /// the flush timeout.
    pub cleanup_interval: Duration,
    /// Page views faster than this count towards the bot score; zero disables.
    pub bot_min_delay: Duration,
    /// Sessions at or above this score are ignored; 0 disables.
    pub bot_threshold: u8,
    /// Page views after which a session is pinned as a bot; 0 disables.
    pub max_page_views: u16,
    /// Global fingerprint salt; empty picks a random salt at construction.
    pub salt: String,
    /// Fingerprint keys; `None` picks random keys at construction.
    pub keys: Option<FingerprintKeys>,
    pub rotate_daily: bool,
    pub referrer_blacklist: Vec<String>,
    pub blacklist_includes_subdomains: bool,
    pub respect_do_not_track: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            worker_buffer_size: DEFAULT_WORKER_BUFFER_SIZE,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            session_max_age: DEFAULT_SESSION_MAX_AGE,
            cleanup_interval: Duration::ZERO,
            bot_min_delay: DEFAULT_BOT_MIN_DELAY,
            bot_threshold: DEFAULT_BOT_THRESHOLD,
            max_page_views: 0,
            salt: String::new(),
            keys: None,
            rotate_daily: true,
            referrer_blacklist: Vec::new(),
            blacklist_includes_subdomains: false,
            respect_do_not_track: true,
        }
    }
}

impl TrackerConfig {
    /// Builds the runtime configuration from loaded settings.
    pub fn from_settings(settings: &FootfallConfig) -> Self {
        let keys = match (settings.fingerprint.key0, settings.fingerprint.key1) {
            (0, 0) => None,
            (key0, key1) => Some(FingerprintKeys::or_random(key0, key1)),
        };

        Self {
            workers: settings.tracker.workers,
            worker_buffer_size: settings.tracker.worker_buffer_size,
            flush_timeout: Duration::from_secs(settings.tracker.flush_timeout_secs),
            session_max_age: Duration::from_secs(settings.session.max_age_secs),
            cleanup_interval: Duration::from_secs(settings.session.cleanup_interval_secs),
            bot_min_delay: Duration::from_millis(settings.session.bot_min_delay_ms),
            bot_threshold: settings.session.bot_threshold,
            max_page_views: settings.session.max_page_views,
            salt: settings.fingerprint.salt.clone(),
            keys,
            rotate_daily: settings.fingerprint.rotate_daily,
            referrer_blacklist: settings.referrer.domain_blacklist.clone(),
            blacklist_includes_subdomains: settings.referrer.blacklist_includes_subdomains,
            respect_do_not_track: settings.filter.respect_do_not_track,
        }
    }

    /// Resolves defaults and clamps every option into its valid band.
    ///
    /// | option           | band                                        |
    /// |------------------|---------------------------------------------|
    /// | workers          | >= 1 (0 = logical CPUs)                     |
    /// | buffer size      | >= 1 (0 = 500)                              |
    /// | flush timeout    | (0, 60 s] (0 = 10 s)                        |
    /// | session max age  | [1 min, 24 h] (0 = 15 min)                  |
    /// | cleanup interval | [2 x flush, 2 x flush + 1 h] (0 = 6 x flush) |
    pub fn validate(mut self) -> Self {
        if self.workers == 0 {
            self.workers = thread::available_parallelism().map_or(1, std::num::NonZero::get);
        }

        if self.worker_buffer_size == 0 {
            self.worker_buffer_size = DEFAULT_WORKER_BUFFER_SIZE;
        }

        if self.flush_timeout.is_zero() {
            self.flush_timeout = DEFAULT_FLUSH_TIMEOUT;
        }
        self.flush_timeout = self.flush_timeout.min(MAX_FLUSH_TIMEOUT);

        if self.session_max_age.is_zero() {
            self.session_max_age = DEFAULT_SESSION_MAX_AGE;
        }
        self.session_max_age = self
            .session_max_age
            .clamp(MIN_SESSION_MAX_AGE, MAX_SESSION_MAX_AGE);

        let min_cleanup = self.flush_timeout * 2;
        let max_cleanup = min_cleanup + CLEANUP_INTERVAL_HEADROOM;
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = self.flush_timeout * 6;
        }
        self.cleanup_interval = self.cleanup_interval.clamp(min_cleanup, max_cleanup);

        self
    }

    /// Capacity of the hit channel shared by all workers.
    pub fn channel_capacity(&self) -> usize {
        self.workers.max(1) * self.worker_buffer_size.max(1)
    }
}
