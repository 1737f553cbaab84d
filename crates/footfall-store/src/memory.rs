//! In-memory collapsing store.
//!
//! Keeps every committed row in arrival order and collapses session rows as
//! they commit, the way a merge-based columnar engine eventually would.
//! Used by the tests, the replay CLI and as the reference for the
//! signed-row contract.
//!
//! Not suitable for production - data is lost on restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use footfall_types::{
    ClientId, EventRecord, Fingerprint, PageViewRecord, Row, SessionId, SessionKey, SessionRow,
    Sign,
};

use crate::{Result, Store, StoreError};

/// Committed rows plus the running sign sum of every distinct session row.
#[derive(Debug, Default)]
struct Ledger {
    rows: Vec<Row>,
    /// Net sign per distinct session row (sign normalized to `+1`), in
    /// first-seen order.
    net: Vec<(SessionRow, i64)>,
    /// Positions in `net` per visitor key.
    by_key: HashMap<SessionKey, Vec<usize>>,
}

impl Ledger {
    fn commit(&mut self, rows: &[Row]) {
        for session in rows.iter().filter_map(Row::as_session) {
            self.apply(session);
        }
        self.rows.extend_from_slice(rows);
    }

    /// Cancels a `-1` row against an identical `+1` row, in either order.
    fn apply(&mut self, row: &SessionRow) {
        let identity = SessionRow {
            sign: Sign::INSERT,
            ..row.clone()
        };
        let delta = i64::from(row.sign.as_i8());

        let positions = self.by_key.entry(row.key()).or_default();
        let found = positions
            .iter()
            .copied()
            .find(|&at| self.net[at].0 == identity);
        match found {
            Some(at) => self.net[at].1 += delta,
            None => {
                positions.push(self.net.len());
                self.net.push((identity, delta));
            }
        }
    }

    fn net_of(&self, key: SessionKey) -> impl Iterator<Item = &(SessionRow, i64)> {
        self.by_key
            .get(&key)
            .into_iter()
            .flatten()
            .map(|&at| &self.net[at])
    }
}

/// Reference [`Store`] that keeps rows in memory.
///
/// Besides the store contract it offers inspection helpers and fault
/// injection (failing saves, failing lookups, a pause gate that stalls
/// writers).
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: Mutex<Ledger>,
    /// Pause gate: writers block while the flag is set.
    paused: Mutex<bool>,
    resumed: Condvar,
    failing_saves: AtomicU64,
    failing_lookups: AtomicBool,
    unavailable: AtomicBool,
    // Statistics
    save_calls: AtomicU64,
    committed_batches: AtomicU64,
    lookup_calls: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Makes the next `n` calls to `save_batch` fail without committing.
    pub fn fail_next_saves(&self, n: u64) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Makes `find_session` fail until switched off again.
    pub fn fail_lookups(&self, fail: bool) {
        self.failing_lookups.store(fail, Ordering::SeqCst);
    }

    /// Makes `health_check` fail until switched off again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Blocks every subsequent `save_batch` call until [`resume`](Self::resume).
    pub fn pause(&self) {
        *lock(&self.paused) = true;
    }

    /// Releases writers blocked by [`pause`](Self::pause).
    pub fn resume(&self) {
        *lock(&self.paused) = false;
        self.resumed.notify_all();
    }

    fn wait_until_resumed(&self) {
        let mut paused = lock(&self.paused);
        while *paused {
            paused = self
                .resumed
                .wait(paused)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Returns every committed row in commit order.
    pub fn rows(&self) -> Vec<Row> {
        self.ledger().rows.clone()
    }

    /// Returns every committed session row, cancellations included.
    pub fn session_rows(&self) -> Vec<SessionRow> {
        self.ledger()
            .rows
            .iter()
            .filter_map(Row::as_session)
            .cloned()
            .collect()
    }

    pub fn page_views(&self) -> Vec<PageViewRecord> {
        self.ledger()
            .rows
            .iter()
            .filter_map(|row| match row {
                Row::PageView(pv) => Some(pv.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.ledger()
            .rows
            .iter()
            .filter_map(|row| match row {
                Row::Event(ev) => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the session rows that survive sign collapsing.
    ///
    /// Every `-1` row cancels one otherwise identical `+1` row.
    pub fn collapsed_sessions(&self) -> Vec<SessionRow> {
        self.ledger()
            .net
            .iter()
            .flat_map(|(row, count)| {
                std::iter::repeat_n(row, usize::try_from(*count).unwrap_or(0)).cloned()
            })
            .collect()
    }

    /// Returns the number of `-1` rows that had no matching `+1` row.
    ///
    /// Always zero for a correctly operating writer.
    pub fn unmatched_cancellations(&self) -> usize {
        self.ledger()
            .net
            .iter()
            .filter(|(_, count)| *count < 0)
            .map(|(_, count)| count.unsigned_abs() as usize)
            .sum()
    }

    /// Sums the sign column of one session.
    pub fn sign_sum(&self, key: SessionKey, session_id: SessionId) -> i64 {
        self.ledger()
            .net_of(key)
            .filter(|(row, _)| row.session_id == session_id)
            .map(|(_, count)| count)
            .sum()
    }

    /// Sums the sign column per (visitor key, session id).
    pub fn sign_sums(&self) -> HashMap<(SessionKey, SessionId), i64> {
        let mut sums = HashMap::new();
        for (row, count) in &self.ledger().net {
            *sums.entry((row.key(), row.session_id)).or_insert(0) += count;
        }
        sums
    }

    /// Number of `save_batch` calls, failed ones included.
    pub fn save_calls(&self) -> u64 {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Number of batches that were committed.
    pub fn committed_batches(&self) -> u64 {
        self.committed_batches.load(Ordering::SeqCst)
    }

    /// Number of `find_session` calls.
    pub fn lookup_calls(&self) -> u64 {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        lock(&self.ledger)
    }
}

impl Store for MemoryStore {
    fn save_batch(&self, rows: &[Row]) -> Result<()> {
        self.wait_until_resumed();
        self.save_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::WriteFailed {
                rows: rows.len(),
                reason: "injected failure".to_string(),
            });
        }

        self.ledger().commit(rows);
        self.committed_batches.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(rows = rows.len(), "memory store committed batch");
        Ok(())
    }

    fn find_session(
        &self,
        client_id: ClientId,
        fingerprint: Fingerprint,
        not_older_than: DateTime<Utc>,
    ) -> Result<Option<SessionRow>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::LookupFailed("injected failure".to_string()));
        }

        let key = SessionKey::new(client_id, fingerprint);
        Ok(self
            .ledger()
            .net_of(key)
            .filter(|(row, count)| *count > 0 && row.time > not_older_than)
            .map(|(row, _)| row)
            .max_by_key(|row| (row.time, row.version))
            .cloned())
    }

    fn health_check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use footfall_types::VisitAttributes;
    use std::sync::Arc;
    use std::thread;
    use test_case::test_case;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    fn session(
        fp: u64,
        session_id: u32,
        version: u32,
        page_views: u16,
        time: DateTime<Utc>,
    ) -> SessionRow {
        SessionRow {
            sign: Sign::INSERT,
            version,
            client_id: ClientId::new(1),
            visitor_id: Fingerprint::new(fp),
            session_id: SessionId::new(session_id),
            time,
            start: at(0),
            duration_seconds: 0,
            entry_path: "/".to_string(),
            exit_path: "/".to_string(),
            entry_title: String::new(),
            exit_title: String::new(),
            page_views,
            is_bounce: page_views == 1,
            bot_score: 0,
            attributes: VisitAttributes::default(),
        }
    }

    #[test]
    fn retraction_cancels_identical_row() {
        let store = MemoryStore::new();
        let first = session(9, 1, 1, 1, at(0));
        let second = session(9, 1, 2, 2, at(1));

        store.save_batch(&[Row::Session(first.clone())]).unwrap();
        store
            .save_batch(&[
                Row::Session(first.retraction()),
                Row::Session(second.clone()),
            ])
            .unwrap();

        assert_eq!(store.collapsed_sessions(), vec![second]);
        assert_eq!(store.unmatched_cancellations(), 0);
        assert_eq!(store.sign_sum(first.key(), first.session_id), 1);
    }

    #[test]
    fn collapse_ignores_commit_order() {
        let store = MemoryStore::new();
        let first = session(9, 1, 1, 1, at(0));
        let second = session(9, 1, 2, 2, at(1));

        // retraction lands before the row it cancels
        store
            .save_batch(&[
                Row::Session(first.retraction()),
                Row::Session(second.clone()),
            ])
            .unwrap();
        store.save_batch(&[Row::Session(first)]).unwrap();

        assert_eq!(store.collapsed_sessions(), vec![second]);
        assert_eq!(store.unmatched_cancellations(), 0);
    }

    #[test]
    fn retraction_must_match_exactly() {
        let store = MemoryStore::new();
        let written = session(9, 1, 1, 1, at(0));
        let mut stale = written.retraction();
        stale.page_views = 7;

        store
            .save_batch(&[Row::Session(written.clone()), Row::Session(stale)])
            .unwrap();

        assert_eq!(store.collapsed_sessions(), vec![written]);
        assert_eq!(store.unmatched_cancellations(), 1);
    }

    #[test]
    fn find_session_returns_latest_surviving_row() {
        let store = MemoryStore::new();
        let old = session(9, 1, 1, 1, at(0));
        let newer = session(9, 2, 1, 1, at(5));
        let other_visitor = session(10, 3, 1, 1, at(6));

        store
            .save_batch(&[
                Row::Session(old),
                Row::Session(newer.clone()),
                Row::Session(other_visitor),
            ])
            .unwrap();

        let found = store
            .find_session(ClientId::new(1), Fingerprint::new(9), at(0))
            .unwrap();
        assert_eq!(found, Some(newer));
        assert_eq!(store.lookup_calls(), 1);
    }

    #[test]
    fn lookups_follow_version_chains_per_visitor() {
        const VISITORS: u64 = 200;
        let store = MemoryStore::new();

        for fp in 0..VISITORS {
            let mut previous = session(fp, 1, 1, 1, at(0));
            store.save_batch(&[Row::Session(previous.clone())]).unwrap();
            for version in 2..=4 {
                let next = session(fp, 1, version, version as u16, at(version));
                store
                    .save_batch(&[
                        Row::Session(previous.retraction()),
                        Row::Session(next.clone()),
                    ])
                    .unwrap();
                previous = next;
            }
        }

        assert_eq!(store.collapsed_sessions().len(), VISITORS as usize);
        assert_eq!(store.unmatched_cancellations(), 0);
        for fp in [0, 57, VISITORS - 1] {
            let found = store
                .find_session(ClientId::new(1), Fingerprint::new(fp), at(0))
                .unwrap()
                .unwrap();
            assert_eq!(found.version, 4);
            assert_eq!(found.page_views, 4);
            assert_eq!(store.sign_sum(found.key(), found.session_id), 1);
        }
    }

    #[test_case(4 => true; "inside window")]
    #[test_case(5 => false; "boundary is exclusive")]
    #[test_case(6 => false; "outside window")]
    fn find_session_respects_not_older_than(cutoff_minute: u32) -> bool {
        let store = MemoryStore::new();
        store
            .save_batch(&[Row::Session(session(9, 1, 1, 1, at(5)))])
            .unwrap();

        store
            .find_session(ClientId::new(1), Fingerprint::new(9), at(cutoff_minute))
            .unwrap()
            .is_some()
    }

    #[test]
    fn injected_save_failures_commit_nothing() {
        let store = MemoryStore::new();
        store.fail_next_saves(2);

        let row = Row::Session(session(9, 1, 1, 1, at(0)));
        assert!(matches!(
            store.save_batch(std::slice::from_ref(&row)),
            Err(StoreError::WriteFailed { rows: 1, .. })
        ));
        assert!(store.save_batch(std::slice::from_ref(&row)).is_err());
        assert!(store.save_batch(std::slice::from_ref(&row)).is_ok());

        assert_eq!(store.save_calls(), 3);
        assert_eq!(store.committed_batches(), 1);
        assert_eq!(store.rows().len(), 1);
    }

    #[test]
    fn injected_lookup_failure() {
        let store = MemoryStore::new();
        store.fail_lookups(true);
        assert!(
            store
                .find_session(ClientId::new(1), Fingerprint::new(9), at(0) - Duration::hours(1))
                .is_err()
        );
    }

    #[test]
    fn health_check_reflects_availability() {
        let store = MemoryStore::new();
        assert!(store.health_check().is_ok());
        store.set_unavailable(true);
        assert!(matches!(store.health_check(), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn pause_blocks_writers_until_resume() {
        let store = Arc::new(MemoryStore::new());
        store.pause();

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .save_batch(&[Row::Session(session(9, 1, 1, 1, at(0)))])
                    .unwrap();
            })
        };

        thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(store.committed_batches(), 0);

        store.resume();
        writer.join().unwrap();
        assert_eq!(store.committed_batches(), 1);
    }
}
