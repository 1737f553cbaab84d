//! Session cache with two-generation eviction.
//!
//! Sessions live in two maps, `active` and `inactive`. Lookups check
//! `active`, then `inactive` (promoting hits back into `active`), then ask
//! the [`Store`]. A background sweeper periodically turns `active` into
//! `inactive` and starts a fresh `active` map, so an entry that is not
//! touched for two sweeps is dropped from memory without any per-key
//! expiry bookkeeping.
//!
//! # Locking
//!
//! The generation maps sit behind one `RwLock` whose critical sections are
//! plain map operations. Store lookups never run under it. Resolving and
//! storing the state of one key is serialized by a striped key lock
//! ([`SessionCache::lock_keys`]), which callers hold across lookup, session
//! versioning and [`SessionCache::store`]. Two requests of the same visitor
//! arriving at the same instant therefore cannot both start a new session.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender};
use footfall_store::Store;
use footfall_types::{SessionKey, SessionRow};
use tracing::{debug, warn};

/// Number of key lock stripes.
const LOCK_STRIPES: usize = 64;

/// Cached state of one visitor's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Latest aggregate, including changes that were not written.
    pub current: SessionRow,
    /// The last `INSERT` row handed to the store, if any. The next change
    /// retracts exactly this row.
    pub emitted: Option<SessionRow>,
}

impl SessionState {
    /// State of a session row read back from the store.
    pub fn from_stored(row: SessionRow) -> Self {
        Self {
            current: row.clone(),
            emitted: Some(row),
        }
    }

    /// Time of the last activity; doubles as the entry's touch time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.current.time
    }

    fn is_fresh(&self, not_older_than: DateTime<Utc>) -> bool {
        self.last_activity() > not_older_than
    }
}

#[derive(Debug, Default)]
struct Generations {
    active: HashMap<SessionKey, SessionState>,
    inactive: HashMap<SessionKey, SessionState>,
}

impl Generations {
    fn rotate(&mut self) -> usize {
        self.inactive = std::mem::take(&mut self.active);
        self.inactive.len()
    }
}

struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Guards returned by [`SessionCache::lock_keys`].
///
/// The keys stay locked until the guard is dropped.
#[must_use = "keys are unlocked as soon as the guard is dropped"]
pub struct KeyLock<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

/// In-memory session cache backed by the store.
pub struct SessionCache {
    generations: Arc<RwLock<Generations>>,
    stripes: Box<[Mutex<()>]>,
    store: Arc<dyn Store>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionCache {
    /// Creates an empty cache that falls back to `store` on misses.
    ///
    /// No sweeper runs until [`start_sweeper`](Self::start_sweeper) is
    /// called.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            generations: Arc::new(RwLock::new(Generations::default())),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            store,
            sweeper: Mutex::new(None),
        }
    }

    /// Locks the given keys for a resolve-and-store cycle.
    ///
    /// Stripes are taken in ascending order, so callers locking several
    /// keys (e.g. today's and yesterday's fingerprint) cannot deadlock.
    pub fn lock_keys(&self, keys: &[SessionKey]) -> KeyLock<'_> {
        let mut stripes: Vec<usize> = keys.iter().map(stripe_of).collect();
        stripes.sort_unstable();
        stripes.dedup();

        KeyLock {
            _guards: stripes
                .into_iter()
                .map(|stripe| {
                    self.stripes[stripe]
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                })
                .collect(),
        }
    }

    /// Returns a copy of the session state for `key` if its last activity
    /// is later than `not_older_than`.
    ///
    /// A stale in-memory entry is a miss; the store is only consulted if
    /// neither generation knows the key. Store errors count as a miss.
    pub fn lookup(&self, key: SessionKey, not_older_than: DateTime<Utc>) -> Option<SessionState> {
        if let Some(state) = self.read().active.get(&key) {
            return state.is_fresh(not_older_than).then(|| state.clone());
        }

        {
            let mut generations = self.write();
            // The sweeper may have rotated since the read above.
            if let Some(state) = generations.active.get(&key) {
                return state.is_fresh(not_older_than).then(|| state.clone());
            }
            if let Some(state) = generations.inactive.remove(&key) {
                if !state.is_fresh(not_older_than) {
                    return None;
                }
                generations.active.insert(key, state.clone());
                return Some(state);
            }
        }

        match self
            .store
            .find_session(key.client_id, key.fingerprint, not_older_than)
        {
            Ok(Some(row)) => {
                let state = SessionState::from_stored(row);
                self.store(key, state.clone());
                Some(state)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "session lookup failed, starting a new session");
                None
            }
        }
    }

    /// Stores the state for `key` in the active generation.
    ///
    /// If the cache already holds a state with a later last activity, that
    /// state is kept.
    pub fn store(&self, key: SessionKey, state: SessionState) {
        let mut generations = self.write();
        generations.inactive.remove(&key);

        match generations.active.entry(key) {
            Entry::Occupied(existing)
                if existing.get().last_activity() > state.last_activity() => {}
            Entry::Occupied(mut existing) => {
                existing.insert(state);
            }
            Entry::Vacant(slot) => {
                slot.insert(state);
            }
        }
    }

    /// Makes the active generation inactive and starts a fresh one.
    ///
    /// Whatever was in the inactive generation is dropped.
    pub fn rotate(&self) {
        rotate(&self.generations);
    }

    /// Drops both generations.
    pub fn clear(&self) {
        let mut generations = self.write();
        generations.active.clear();
        generations.inactive.clear();
    }

    /// Returns the number of entries in the (active, inactive) generations.
    pub fn generation_sizes(&self) -> (usize, usize) {
        let generations = self.read();
        (generations.active.len(), generations.inactive.len())
    }

    /// Starts the background thread that rotates the generations every
    /// `interval`. Replaces a running sweeper.
    pub fn start_sweeper(&self, interval: Duration) -> io::Result<()> {
        self.shutdown();

        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let generations = Arc::clone(&self.generations);

        let handle = thread::Builder::new()
            .name("footfall-cache-sweeper".to_string())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => rotate(&generations),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        *self.sweeper_slot() = Some(Sweeper { stop, handle });
        Ok(())
    }

    /// Stops the sweeper thread, if any. Idempotent.
    pub fn shutdown(&self) {
        let Some(sweeper) = self.sweeper_slot().take() else {
            return;
        };

        drop(sweeper.stop);
        if sweeper.handle.join().is_err() {
            warn!("session cache sweeper panicked");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Generations> {
        self.generations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Generations> {
        self.generations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn sweeper_slot(&self) -> MutexGuard<'_, Option<Sweeper>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (active, inactive) = self.generation_sizes();
        f.debug_struct("SessionCache")
            .field("active", &active)
            .field("inactive", &inactive)
            .finish_non_exhaustive()
    }
}

fn rotate(generations: &RwLock<Generations>) {
    let moved = generations
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .rotate();
    debug!(sessions = moved, "rotated session cache generations");
}

fn stripe_of(key: &SessionKey) -> usize {
    // fingerprints are already uniformly distributed
    let mixed = key.fingerprint.as_u64() ^ key.client_id.as_u64().rotate_left(32);
    (mixed % LOCK_STRIPES as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use footfall_store::MemoryStore;
    use footfall_types::{ClientId, Fingerprint, Row, SessionId, Sign, VisitAttributes};
    use std::time::Instant;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 10, minute, 0).unwrap()
    }

    fn key(fingerprint: u64) -> SessionKey {
        SessionKey::new(ClientId::new(1), Fingerprint::new(fingerprint))
    }

    fn row(key: SessionKey, time: DateTime<Utc>) -> SessionRow {
        SessionRow {
            sign: Sign::INSERT,
            version: 1,
            client_id: key.client_id,
            visitor_id: key.fingerprint,
            session_id: SessionId::new(7),
            time,
            start: time,
            duration_seconds: 0,
            entry_path: "/".to_string(),
            exit_path: "/".to_string(),
            entry_title: String::new(),
            exit_title: String::new(),
            page_views: 1,
            is_bounce: true,
            bot_score: 0,
            attributes: VisitAttributes::default(),
        }
    }

    fn cache() -> (Arc<MemoryStore>, SessionCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(Arc::clone(&store) as Arc<dyn Store>);
        (store, cache)
    }

    #[test]
    fn active_entry_is_found_without_store() {
        let (store, cache) = cache();
        let state = SessionState::from_stored(row(key(1), at(10)));
        cache.store(key(1), state.clone());

        assert_eq!(cache.lookup(key(1), at(0)), Some(state));
        assert_eq!(store.lookup_calls(), 0);
    }

    #[test]
    fn one_rotation_keeps_entry_reachable() {
        let (store, cache) = cache();
        let state = SessionState::from_stored(row(key(1), at(10)));
        cache.store(key(1), state.clone());

        cache.rotate();
        assert_eq!(cache.generation_sizes(), (0, 1));

        assert_eq!(cache.lookup(key(1), at(0)), Some(state));
        assert_eq!(cache.generation_sizes(), (1, 0), "entry is promoted");
        assert_eq!(store.lookup_calls(), 0);
    }

    #[test]
    fn two_rotations_fall_back_to_store() {
        let (store, cache) = cache();
        let stored = row(key(1), at(10));
        store.save_batch(&[Row::Session(stored.clone())]).unwrap();
        cache.store(key(1), SessionState::from_stored(stored.clone()));

        cache.rotate();
        cache.rotate();
        assert_eq!(cache.generation_sizes(), (0, 0));

        let found = cache.lookup(key(1), at(0)).expect("store fallback");
        assert_eq!(found.current, stored);
        assert_eq!(found.emitted, Some(stored));
        assert_eq!(store.lookup_calls(), 1);

        // rehydrated into the active generation
        cache.lookup(key(1), at(0));
        assert_eq!(store.lookup_calls(), 1);
    }

    #[test]
    fn stale_entry_is_a_miss_without_fallback() {
        let (store, cache) = cache();
        cache.store(key(1), SessionState::from_stored(row(key(1), at(10))));

        assert_eq!(cache.lookup(key(1), at(10)), None);
        assert_eq!(store.lookup_calls(), 0);
    }

    #[test]
    fn unknown_key_asks_store_once() {
        let (store, cache) = cache();
        assert_eq!(cache.lookup(key(9), at(0)), None);
        assert_eq!(store.lookup_calls(), 1);
    }

    #[test]
    fn store_errors_are_misses() {
        let (store, cache) = cache();
        store.save_batch(&[Row::Session(row(key(1), at(10)))]).unwrap();
        store.fail_lookups(true);

        assert_eq!(cache.lookup(key(1), at(0)), None);
    }

    #[test]
    fn newer_state_wins() {
        let (_store, cache) = cache();
        let newer = SessionState::from_stored(row(key(1), at(20)));
        let older = SessionState::from_stored(row(key(1), at(10)));

        cache.store(key(1), newer.clone());
        cache.store(key(1), older);
        assert_eq!(cache.lookup(key(1), at(0)), Some(newer));

        let newest = SessionState::from_stored(row(key(1), at(30)));
        cache.store(key(1), newest.clone());
        assert_eq!(cache.lookup(key(1), at(0)), Some(newest));
    }

    #[test]
    fn clear_drops_both_generations() {
        let (_store, cache) = cache();
        cache.store(key(1), SessionState::from_stored(row(key(1), at(10))));
        cache.rotate();
        cache.store(key(2), SessionState::from_stored(row(key(2), at(10))));

        cache.clear();
        assert_eq!(cache.generation_sizes(), (0, 0));
    }

    #[test]
    fn duplicate_keys_lock_once() {
        let (_store, cache) = cache();
        let _lock = cache.lock_keys(&[key(3), key(3), key(3 + LOCK_STRIPES as u64)]);
    }

    #[test]
    fn sweeper_rotates_until_shut_down() {
        let (_store, cache) = cache();
        cache.store(key(1), SessionState::from_stored(row(key(1), at(10))));
        cache.start_sweeper(Duration::from_millis(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.generation_sizes() != (0, 0) {
            assert!(Instant::now() < deadline, "sweeper never rotated twice");
            thread::sleep(Duration::from_millis(5));
        }

        cache.shutdown();
        cache.shutdown();
        cache.store(key(2), SessionState::from_stored(row(key(2), at(10))));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.generation_sizes(), (1, 0));
    }

    #[test]
    fn last_activity_is_row_time() {
        let mut state = SessionState::from_stored(row(key(1), at(10)));
        state.current.time += TimeDelta::minutes(1);
        assert_eq!(state.last_activity(), at(11));
    }
}
