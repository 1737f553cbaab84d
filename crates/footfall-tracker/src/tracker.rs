//! The ingestion pipeline.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use footfall_crypto::{FingerprintKeys, Fingerprinter};
use footfall_store::Store;
use footfall_types::{SessionKey, VisitAttributes, shorten};
use tracing::{debug, error, info, warn};

use crate::cache::{SessionCache, SessionState};
use crate::classify::{
    GeoLookup, HostReferrerClassifier, QueryUtmExtractor, ReferrerClassifier, UnknownUserAgent,
    UserAgentParser, UtmExtractor, language, raw_referrer, screen_class,
};
use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::filter::ignore_request;
use crate::ip::client_ip;
use crate::request::{EventOptions, HitOptions, HitRequest, split_url};
use crate::worker::{Message, WorkerPool, WorkerSettings, drain};
use crate::writer::{Hit, HitKind, Outcome, SessionWriter};

pub const MAX_PATH_LEN: usize = 2000;
pub const MAX_TITLE_LEN: usize = 512;

/// Visitor keys a hit may continue a session under.
struct VisitorKeys {
    today: SessionKey,
    /// Set while the session window reaches into the previous day.
    yesterday: Option<SessionKey>,
}

impl VisitorKeys {
    fn all(&self) -> Vec<SessionKey> {
        std::iter::once(self.today).chain(self.yesterday).collect()
    }
}

/// Builder for a [`Tracker`].
///
/// Every collaborator has a default: no user agent parsing, no GeoIP, the
/// host based referrer classifier configured from [`TrackerConfig`], query
/// string UTM extraction and the system clock.
pub struct TrackerBuilder {
    store: Arc<dyn Store>,
    config: TrackerConfig,
    user_agents: Arc<dyn UserAgentParser>,
    geo: Option<Arc<dyn GeoLookup>>,
    referrers: Option<Arc<dyn ReferrerClassifier>>,
    utm: Arc<dyn UtmExtractor>,
    clock: Arc<dyn Clock>,
}

impl TrackerBuilder {
    fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            config: TrackerConfig::default(),
            user_agents: Arc::new(UnknownUserAgent),
            geo: None,
            referrers: None,
            utm: Arc::new(QueryUtmExtractor),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn user_agent_parser(mut self, parser: Arc<dyn UserAgentParser>) -> Self {
        self.user_agents = parser;
        self
    }

    #[must_use]
    pub fn geo_lookup(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    #[must_use]
    pub fn referrer_classifier(mut self, classifier: Arc<dyn ReferrerClassifier>) -> Self {
        self.referrers = Some(classifier);
        self
    }

    #[must_use]
    pub fn utm_extractor(mut self, extractor: Arc<dyn UtmExtractor>) -> Self {
        self.utm = extractor;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the configuration, checks the store and starts the
    /// workers and the cache sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Store`] if the store's health check fails and
    /// [`TrackerError::Spawn`] if a thread cannot be started.
    pub fn build(self) -> Result<Tracker> {
        let config = self.config.validate();
        self.store.health_check()?;

        let salt = if config.salt.is_empty() {
            format!("{:032x}", rand::random::<u128>())
        } else {
            config.salt.clone()
        };
        let keys = config.keys.unwrap_or_else(FingerprintKeys::random);
        let fingerprinter = Fingerprinter::new(keys, salt, config.rotate_daily);

        let referrers = self.referrers.unwrap_or_else(|| {
            Arc::new(HostReferrerClassifier::new(
                &config.referrer_blacklist,
                config.blacklist_includes_subdomains,
            ))
        });

        let cache = SessionCache::new(Arc::clone(&self.store));
        cache
            .start_sweeper(config.cleanup_interval)
            .map_err(|source| TrackerError::Spawn {
                name: "footfall-cache-sweeper".to_string(),
                source,
            })?;

        let (sender, receiver) = crossbeam_channel::bounded(config.channel_capacity());
        let settings = WorkerSettings {
            workers: config.workers,
            buffer_size: config.worker_buffer_size,
            flush_timeout: config.flush_timeout,
        };
        let workers = WorkerPool::start(settings, &receiver, &self.store)?;

        info!(
            workers = config.workers,
            buffer_size = config.worker_buffer_size,
            flush_timeout_ms = config.flush_timeout.as_millis(),
            session_max_age_secs = config.session_max_age.as_secs(),
            cleanup_interval_secs = config.cleanup_interval.as_secs(),
            "tracker started"
        );

        Ok(Tracker {
            writer: SessionWriter::new(&config),
            settings,
            config,
            store: self.store,
            fingerprinter,
            cache,
            user_agents: self.user_agents,
            geo: RwLock::new(self.geo),
            referrers,
            utm: self.utm,
            clock: self.clock,
            sender,
            receiver,
            workers: Mutex::new(workers),
            gate: RwLock::new(()),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Tracks page views and events.
///
/// Each hit is filtered, fingerprinted, resolved against the session cache
/// and versioned synchronously on the caller's thread. The resulting rows
/// go into a bounded channel drained by background workers. A full
/// channel blocks the caller until a worker catches up; hits are never
/// dropped for lack of space.
///
/// Tracking methods never fail. Filtered requests are ignored, storage
/// failures are logged and the affected batch is dropped.
///
/// # Lifecycle
///
/// A tracker runs from [`build`](TrackerBuilder::build) until
/// [`stop`](Self::stop) (or drop). After that every hit is a no-op.
pub struct Tracker {
    config: TrackerConfig,
    settings: WorkerSettings,
    store: Arc<dyn Store>,
    fingerprinter: Fingerprinter,
    writer: SessionWriter,
    cache: SessionCache,
    user_agents: Arc<dyn UserAgentParser>,
    geo: RwLock<Option<Arc<dyn GeoLookup>>>,
    referrers: Arc<dyn ReferrerClassifier>,
    utm: Arc<dyn UtmExtractor>,
    clock: Arc<dyn Clock>,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    workers: Mutex<WorkerPool>,
    /// Hits hold it shared; flush and stop hold it exclusively.
    gate: RwLock<()>,
    stopped: AtomicBool,
}

impl Tracker {
    pub fn builder(store: Arc<dyn Store>) -> TrackerBuilder {
        TrackerBuilder::new(store)
    }

    /// Builds a tracker with default collaborators.
    ///
    /// # Errors
    ///
    /// See [`TrackerBuilder::build`].
    pub fn new(store: Arc<dyn Store>, config: TrackerConfig) -> Result<Self> {
        Self::builder(store).config(config).build()
    }

    /// Tracks a page view.
    pub fn page_view(&self, request: &HitRequest, options: &HitOptions) {
        self.track(request, options, HitKind::PageView);
    }

    /// Tracks a custom event. Events without a name are ignored.
    pub fn event(&self, request: &HitRequest, event: &EventOptions, options: &HitOptions) {
        if event.name.trim().is_empty() {
            debug!(client_id = %options.client_id, "ignoring event without name");
            return;
        }
        self.track(request, options, HitKind::Event(event));
    }

    /// Marks the visitor's session as active without recording a hit.
    ///
    /// Nothing is written; the session simply stays alive for another
    /// max-age window.
    pub fn extend_session(&self, request: &HitRequest, options: &HitOptions) {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if self.is_stopped() || ignore_request(request, self.config.respect_do_not_track).is_some()
        {
            return;
        }

        let now = self.clock.now();
        let keys = self.visitor_keys(request, options, now);
        let _locks = self.cache.lock_keys(&keys.all());

        if let Some(state) = self.resolve(&keys, now) {
            self.cache.store(keys.today, self.writer.extend(&state, now));
        }
    }

    /// Writes everything queued so far.
    ///
    /// Stops the workers (each writes its batch), drains the channel and
    /// starts fresh workers. Hits arriving meanwhile wait.
    pub fn flush(&self) {
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_stopped() {
            return;
        }

        let mut workers = self.workers();
        workers.stop();
        drain(&self.receiver, &*self.store, self.settings.buffer_size);

        let restarted = WorkerPool::start(self.settings, &self.receiver, &self.store);
        self.restart_workers(&mut workers, restarted);
        debug!("flushed tracker");
    }

    /// Installs the pool started by a flush.
    ///
    /// Without workers nothing would drain the channel, so a failed restart
    /// stops the tracker. The channel is already empty at this point.
    fn restart_workers(&self, workers: &mut WorkerPool, restarted: Result<WorkerPool>) {
        match restarted {
            Ok(pool) => *workers = pool,
            Err(e) => {
                error!(error = %e, "failed to restart workers after flush, stopping tracker");
                self.stopped.store(true, Ordering::Release);
                self.cache.shutdown();
            }
        }
    }

    /// Stops the tracker, writing everything queued before the call.
    ///
    /// Blocks until the workers and the cache sweeper have exited. Hits
    /// racing this call either complete first or are dropped. Idempotent;
    /// concurrent callers all return once the first one has finished.
    pub fn stop(&self) {
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.workers().stop();
        drain(&self.receiver, &*self.store, self.settings.buffer_size);
        self.cache.shutdown();

        info!("tracker stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Replaces the GeoIP lookup; `None` disables country detection.
    ///
    /// Takes effect for the next session started.
    pub fn set_geo_lookup(&self, geo: Option<Arc<dyn GeoLookup>>) {
        *self.geo.write().unwrap_or_else(PoisonError::into_inner) = geo;
    }

    /// Forgets every cached session. Continuity then relies on the store.
    pub fn clear_session_cache(&self) {
        self.cache.clear();
    }

    pub fn session_cache(&self) -> &SessionCache {
        &self.cache
    }

    /// The validated configuration.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn track(&self, request: &HitRequest, options: &HitOptions, kind: HitKind<'_>) {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if self.is_stopped() {
            return;
        }

        if let Some(reason) = ignore_request(request, self.config.respect_do_not_track) {
            debug!(client_id = %options.client_id, %reason, "ignoring request");
            return;
        }

        let now = self.clock.now();
        let url = options.url.as_deref().unwrap_or(request.uri());
        let (url_host, path, query) = split_url(url);
        let path = if path.is_empty() { "/" } else { path };
        let path = shorten(path, MAX_PATH_LEN);
        let title = shorten(options.title.trim(), MAX_TITLE_LEN);

        let request_host = request.header("Host").unwrap_or(url_host);
        let raw = raw_referrer(options.referrer.as_deref(), request.header("Referer"), query);
        let referrer = self.referrers.classify(&raw, request_host);
        let utm = self.utm.extract(query);

        let keys = self.visitor_keys(request, options, now);
        let _locks = self.cache.lock_keys(&keys.all());
        let existing = self.resolve(&keys, now);

        let hit = Hit {
            key: keys.today,
            time: now,
            path,
            title,
            referrer: &referrer,
            utm: &utm,
            kind,
        };

        match self
            .writer
            .apply(existing.as_ref(), &hit, || self.attributes(request, options))
        {
            Outcome::Write(update) => {
                let (rows, state) = update.into_parts();
                self.cache.store(keys.today, state);
                // blocks while the channel is full
                if self.sender.send(rows).is_err() {
                    warn!(client_id = %options.client_id, "hit channel closed, dropping hit");
                }
            }
            Outcome::Ignored(state) => {
                debug!(client_id = %options.client_id, "ignoring hit of bot session");
                self.cache.store(keys.today, state);
            }
        }
    }

    fn visitor_keys(
        &self,
        request: &HitRequest,
        options: &HitOptions,
        now: DateTime<Utc>,
    ) -> VisitorKeys {
        let user_agent = request.user_agent();
        let ip = client_ip(request);
        let key = |day| {
            SessionKey::new(
                options.client_id,
                self.fingerprinter
                    .fingerprint(user_agent, &ip, day, &options.salt),
            )
        };

        let today = now.date_naive();
        let window_day = self.writer.window_start(now).date_naive();
        let yesterday = (self.fingerprinter.rotates_daily() && window_day < today)
            .then(|| today.pred_opt())
            .flatten()
            .map(key);

        VisitorKeys {
            today: key(today),
            yesterday,
        }
    }

    /// Finds a continuable session under today's key, or yesterday's while
    /// the window reaches past midnight.
    fn resolve(&self, keys: &VisitorKeys, now: DateTime<Utc>) -> Option<SessionState> {
        let window = self.writer.window_start(now);
        self.cache
            .lookup(keys.today, window)
            .or_else(|| keys.yesterday.and_then(|key| self.cache.lookup(key, window)))
    }

    fn attributes(&self, request: &HitRequest, options: &HitOptions) -> VisitAttributes {
        let agent = self.user_agents.parse(request.user_agent()).shortened();

        let country_code = self
            .geo
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|geo| {
                let code = geo.country_code(&client_ip(request));
                shorten(code.trim(), 2).to_ascii_uppercase()
            })
            .unwrap_or_default();

        let (screen_width, screen_height) =
            if options.screen_width == 0 || options.screen_height == 0 {
                (0, 0)
            } else {
                (options.screen_width, options.screen_height)
            };

        VisitAttributes {
            language: language(request.header("Accept-Language").unwrap_or("")),
            country_code,
            os: agent.os,
            os_version: agent.os_version,
            browser: agent.browser,
            browser_version: agent.browser_version,
            desktop: agent.desktop,
            mobile: agent.mobile,
            screen_width,
            screen_height,
            screen_class: screen_class(screen_width).to_string(),
            ..VisitAttributes::default()
        }
    }

    fn workers(&self) -> MutexGuard<'_, WorkerPool> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("workers", &self.config.workers)
            .field("cache", &self.cache)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
