//! Batching workers.
//!
//! Each worker drains the shared hit channel into its own batch and writes
//! the batch when it holds `buffer_size` rows or when `flush_timeout` has
//! passed since the last write. Every channel message carries all rows of
//! one hit, so a retraction and its replacement always land in the same
//! batch, in order.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use footfall_store::Store;
use footfall_types::Row;
use tracing::{debug, error, warn};

use crate::error::{Result, TrackerError};

/// Rows of one hit, written together.
pub(crate) type Message = Vec<Row>;

/// Settings shared by every worker of a pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
    pub workers: usize,
    pub buffer_size: usize,
    pub flush_timeout: Duration,
}

/// A running set of workers.
///
/// Dropping the cancel sender disconnects the cancel channel, which every
/// worker observes as "write what you have and exit".
pub(crate) struct WorkerPool {
    cancel: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `settings.workers` threads reading from `receiver`.
    ///
    /// If a thread cannot be spawned, the ones already running are stopped
    /// again before the error is returned.
    pub(crate) fn start(
        settings: WorkerSettings,
        receiver: &Receiver<Message>,
        store: &Arc<dyn Store>,
    ) -> Result<Self> {
        let (cancel, cancelled) = crossbeam_channel::bounded::<()>(0);
        let mut pool = Self {
            cancel: Some(cancel),
            handles: Vec::with_capacity(settings.workers),
        };

        for index in 0..settings.workers {
            let name = format!("footfall-worker-{index}");
            let worker = Worker {
                receiver: receiver.clone(),
                cancelled: cancelled.clone(),
                store: Arc::clone(store),
                buffer_size: settings.buffer_size,
                flush_timeout: settings.flush_timeout,
            };

            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())
            {
                Ok(handle) => pool.handles.push(handle),
                Err(source) => {
                    pool.stop();
                    return Err(TrackerError::Spawn { name, source });
                }
            }
        }

        Ok(pool)
    }

    /// Cancels every worker and waits until each has written its batch.
    /// Idempotent.
    pub(crate) fn stop(&mut self) {
        drop(self.cancel.take());

        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!(worker = %name, "worker panicked, its batch is lost");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    receiver: Receiver<Message>,
    cancelled: Receiver<()>,
    store: Arc<dyn Store>,
    buffer_size: usize,
    flush_timeout: Duration,
}

impl Worker {
    fn run(self) {
        let mut batch: Vec<Row> = Vec::with_capacity(self.buffer_size);
        let mut deadline = Instant::now() + self.flush_timeout;

        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());

            select! {
                recv(self.receiver) -> message => match message {
                    Ok(rows) => {
                        batch.extend(rows);
                        if batch.len() >= self.buffer_size {
                            save(&*self.store, &mut batch);
                            deadline = Instant::now() + self.flush_timeout;
                        }
                    }
                    Err(_) => break,
                },
                recv(self.cancelled) -> _ => break,
                default(timeout) => {
                    save(&*self.store, &mut batch);
                    deadline = Instant::now() + self.flush_timeout;
                }
            }
        }

        save(&*self.store, &mut batch);
    }
}

/// Writes whatever is left in the channel, in batches of `buffer_size`
/// rows. Only called while no worker is running.
pub(crate) fn drain(receiver: &Receiver<Message>, store: &dyn Store, buffer_size: usize) {
    let mut batch = Vec::with_capacity(buffer_size);

    while let Ok(rows) = receiver.try_recv() {
        batch.extend(rows);
        if batch.len() >= buffer_size {
            save(store, &mut batch);
        }
    }

    save(store, &mut batch);
}

/// Writes `batch` and clears it. Failed batches are logged and dropped;
/// retrying would reorder them behind newer session rows.
fn save(store: &dyn Store, batch: &mut Vec<Row>) {
    if batch.is_empty() {
        return;
    }

    match store.save_batch(batch) {
        Ok(()) => debug!(rows = batch.len(), "saved batch"),
        Err(e) => error!(rows = batch.len(), error = %e, "failed to save batch, dropping it"),
    }

    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use footfall_store::MemoryStore;
    use footfall_types::{ClientId, EventRecord, Fingerprint, SessionId, VisitAttributes};

    fn event(n: u32) -> Row {
        Row::Event(EventRecord {
            client_id: ClientId::new(1),
            visitor_id: Fingerprint::new(u64::from(n)),
            session_id: SessionId::new(n),
            session_version: 1,
            time: Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap(),
            name: format!("event-{n}"),
            duration_seconds: 0,
            meta_keys: Vec::new(),
            meta_values: Vec::new(),
            path: "/".to_string(),
            title: String::new(),
            attributes: VisitAttributes::default(),
        })
    }

    fn setup(
        buffer_size: usize,
        flush_timeout: Duration,
    ) -> (Arc<MemoryStore>, Sender<Message>, Receiver<Message>, WorkerSettings) {
        let store = Arc::new(MemoryStore::new());
        let (sender, receiver) = crossbeam_channel::bounded(16);
        let settings = WorkerSettings {
            workers: 1,
            buffer_size,
            flush_timeout,
        };
        (store, sender, receiver, settings)
    }

    #[test]
    fn full_batch_is_written_immediately() {
        let (store, sender, receiver, settings) = setup(2, Duration::from_secs(60));
        let dyn_store: Arc<dyn Store> = store.clone();
        let mut pool = WorkerPool::start(settings, &receiver, &dyn_store).unwrap();

        sender.send(vec![event(1), event(2)]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.committed_batches() == 0 {
            assert!(Instant::now() < deadline, "batch never written");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.events().len(), 2);

        pool.stop();
    }

    #[test]
    fn idle_timeout_writes_partial_batch() {
        let (store, sender, receiver, settings) = setup(100, Duration::from_millis(20));
        let dyn_store: Arc<dyn Store> = store.clone();
        let mut pool = WorkerPool::start(settings, &receiver, &dyn_store).unwrap();

        sender.send(vec![event(1)]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.events().is_empty() {
            assert!(Instant::now() < deadline, "timeout never flushed");
            thread::sleep(Duration::from_millis(5));
        }

        pool.stop();
    }

    #[test]
    fn stop_writes_pending_rows_and_is_idempotent() {
        let (store, sender, receiver, settings) = setup(100, Duration::from_secs(60));
        let dyn_store: Arc<dyn Store> = store.clone();
        let mut pool = WorkerPool::start(settings, &receiver, &dyn_store).unwrap();

        sender.send(vec![event(1), event(2), event(3)]).unwrap();
        pool.stop();
        pool.stop();
        drain(&receiver, &*dyn_store, 100);

        assert_eq!(store.events().len(), 3);
    }

    #[test]
    fn drain_respects_buffer_size() {
        let (store, sender, receiver, _) = setup(2, Duration::from_secs(60));
        for n in 0..5 {
            sender.send(vec![event(n)]).unwrap();
        }

        drain(&receiver, &*store, 2);

        assert_eq!(store.events().len(), 5);
        assert_eq!(store.committed_batches(), 3);
        assert!(receiver.is_empty());
    }

    #[test]
    fn failed_batches_are_dropped() {
        let (store, sender, receiver, _) = setup(1, Duration::from_secs(60));
        store.fail_next_saves(1);
        sender.send(vec![event(1)]).unwrap();
        sender.send(vec![event(2)]).unwrap();

        drain(&receiver, &*store, 1);

        let names: Vec<_> = store.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["event-2".to_string()]);
        assert_eq!(store.save_calls(), 2);
    }
}
