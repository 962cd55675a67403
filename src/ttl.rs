//! TTL manager: schedules delayed deletes for expiring keys.
//!
//! A dedicated worker thread owns a deadline heap fed through a channel.
//! When a deadline fires and the key is still tracked as expiring, the
//! worker opens a writable transaction and deletes it. A newer Set for
//! the same key supersedes the pending expiry; persistent writes cancel
//! it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::db::DbCore;
use crate::entry::now_millis;

enum Cmd {
    Schedule {
        bucket: String,
        key: String,
        generation: u64,
        deadline_ms: u64,
    },
    Shutdown,
}

/// Tracks which (bucket, key) pairs have a pending expiry and drives the
/// worker that executes them.
pub struct TtlManager {
    tx: Sender<Cmd>,
    rx: Mutex<Option<Receiver<Cmd>>>,
    tracked: Arc<Mutex<HashMap<(String, String), u64>>>,
    generation: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TtlManager {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            tracked: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            handle: Mutex::new(None),
        }
    }

    /// Starts the worker thread. Called once, after the owning core has
    /// been placed behind an `Arc`.
    pub(crate) fn bind(&self, db: Weak<DbCore>) -> crate::error::Result<()> {
        let Some(rx) = self.rx.lock().take() else {
            return Ok(());
        };
        let tracked = Arc::clone(&self.tracked);
        let handle = std::thread::Builder::new()
            .name("emberdb-ttl".to_string())
            .spawn(move || worker(rx, tracked, db))?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Schedules (or reschedules) an expiry delete for the key.
    pub fn add(&self, bucket: &str, key: &[u8], delay: Duration) {
        let key = String::from_utf8_lossy(key).into_owned();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracked
            .lock()
            .insert((bucket.to_string(), key.clone()), generation);
        let _ = self.tx.send(Cmd::Schedule {
            bucket: bucket.to_string(),
            key,
            generation,
            deadline_ms: now_millis() + delay.as_millis() as u64,
        });
    }

    /// Cancels any pending expiry for the key.
    pub fn del(&self, bucket: &str, key: &[u8]) {
        let key = String::from_utf8_lossy(key).into_owned();
        self.tracked.lock().remove(&(bucket.to_string(), key));
    }

    /// Whether the key is still tracked as expiring.
    pub fn exist(&self, bucket: &str, key: &[u8]) -> bool {
        let key = String::from_utf8_lossy(key).into_owned();
        self.tracked
            .lock()
            .contains_key(&(bucket.to_string(), key))
    }

    /// Stops the worker and waits for it to drain.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Cmd::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for TtlManager {
    fn default() -> Self {
        Self::new()
    }
}

type Deadline = Reverse<(u64, u64, String, String)>;

fn worker(
    rx: Receiver<Cmd>,
    tracked: Arc<Mutex<HashMap<(String, String), u64>>>,
    db: Weak<DbCore>,
) {
    let mut heap: BinaryHeap<Deadline> = BinaryHeap::new();

    loop {
        let timeout = match heap.peek() {
            Some(Reverse((deadline, ..))) => {
                Duration::from_millis(deadline.saturating_sub(now_millis()))
            }
            None => Duration::from_secs(1),
        };

        match rx.recv_timeout(timeout) {
            Ok(Cmd::Schedule {
                bucket,
                key,
                generation,
                deadline_ms,
            }) => {
                heap.push(Reverse((deadline_ms, generation, bucket, key)));
            }
            Ok(Cmd::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        fire_due(&mut heap, &tracked, &db);
    }
}

fn fire_due(
    heap: &mut BinaryHeap<Deadline>,
    tracked: &Mutex<HashMap<(String, String), u64>>,
    db: &Weak<DbCore>,
) {
    while let Some(Reverse((deadline, ..))) = heap.peek() {
        if *deadline > now_millis() {
            return;
        }
        let Some(Reverse((_, generation, bucket, key))) = heap.pop() else {
            return;
        };

        // A later Set or an explicit delete supersedes this schedule.
        if tracked.lock().get(&(bucket.clone(), key.clone())) != Some(&generation) {
            continue;
        }

        let Some(core) = db.upgrade() else {
            return;
        };

        let result = core.update(|tx| {
            if core.ttl.exist(&bucket, key.as_bytes()) {
                tx.delete(&bucket, key.as_bytes())
            } else {
                Ok(())
            }
        });

        if let Err(e) = result {
            tracing::error!(error = %e, %bucket, %key, "Expired deletion failed");
        }

        let mut tracked = tracked.lock();
        if tracked.get(&(bucket.clone(), key.clone())) == Some(&generation) {
            tracked.remove(&(bucket, key));
        }
    }
}
