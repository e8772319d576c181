//! Debounced write-coalescing queue in front of [`PersistenceManager`].
//!
//! `schedule()` asks for a save; requests arriving within the debounce window
//! collapse into one write. Writes are strictly serialized: a request that
//! arrives while a write is in flight is marked pending and performed after
//! it completes. `flush()` writes immediately and blocks the caller.

use crate::error::Result;
use crate::models::DataFile;
use crate::persistence::PersistenceManager;
use log::{debug, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Supplies the document to write and hears how the write went.
pub trait SnapshotSource: Send + Sync {
    /// Current document; taking it marks the in-memory state as saved
    fn snapshot(&self) -> DataFile;

    /// Called after every write attempt
    fn write_finished(&self, result: &Result<()>);
}

#[derive(Debug, Default)]
struct QueueState {
    /// When the oldest unserved request arrived
    requested_at: Option<Instant>,
    in_flight: bool,
    pending: bool,
    stopping: bool,
    writes: u64,
}

struct Shared {
    queue: Mutex<QueueState>,
    wake: Condvar,
    debounce: Duration,
    persistence: Arc<PersistenceManager>,
    source: Arc<dyn SnapshotSource>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_now(&self) -> Result<()> {
        let document = self.source.snapshot();
        let result = self.persistence.save_immediate(&document);
        self.source.write_finished(&result);
        result
    }
}

pub struct DebouncedWriter {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl DebouncedWriter {
    pub fn spawn(
        persistence: Arc<PersistenceManager>,
        source: Arc<dyn SnapshotSource>,
        debounce: Duration,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            debounce,
            persistence,
            source,
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("timekeeper-writer".to_string())
            .spawn(move || run(worker))?;

        Ok(DebouncedWriter {
            shared,
            handle: Some(handle),
        })
    }

    /// Request a save; returns immediately
    pub fn schedule(&self) {
        let mut queue = self.shared.lock();
        if queue.stopping {
            return;
        }
        if queue.in_flight {
            queue.pending = true;
        } else if queue.requested_at.is_none() {
            queue.requested_at = Some(Instant::now());
        }
        self.shared.wake.notify_all();
    }

    /// Write the current state now, waiting out any in-flight write first
    pub fn flush(&self) -> Result<()> {
        let mut queue = self.shared.lock();
        while queue.in_flight {
            queue = self.shared.wake.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
        queue.in_flight = true;
        queue.requested_at = None;
        queue.pending = false;
        drop(queue);

        let result = self.shared.write_now();

        let mut queue = self.shared.lock();
        queue.in_flight = false;
        queue.writes += 1;
        if queue.pending {
            queue.pending = false;
            queue.requested_at = Some(Instant::now());
        }
        self.shared.wake.notify_all();
        result
    }

    /// Number of completed write attempts
    pub fn writes(&self) -> u64 {
        self.shared.lock().writes
    }

    /// True when no write is queued, pending or running
    pub fn is_idle(&self) -> bool {
        let queue = self.shared.lock();
        queue.requested_at.is_none() && !queue.pending && !queue.in_flight
    }

    /// Stop the worker after any in-flight write; queued requests are dropped
    pub fn stop(&mut self) {
        {
            let mut queue = self.shared.lock();
            queue.stopping = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Writer thread panicked");
            }
        }
    }
}

impl Drop for DebouncedWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>) {
    let mut queue = shared.lock();
    loop {
        if queue.stopping {
            break;
        }

        let Some(requested_at) = queue.requested_at else {
            queue = shared.wake.wait(queue).unwrap_or_else(|e| e.into_inner());
            continue;
        };

        let due = requested_at + shared.debounce;
        let now = Instant::now();
        if now < due {
            queue = shared
                .wake
                .wait_timeout(queue, due - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
            continue;
        }

        if queue.in_flight {
            // A flush is writing on another thread
            queue = shared.wake.wait(queue).unwrap_or_else(|e| e.into_inner());
            continue;
        }

        queue.requested_at = None;
        queue.in_flight = true;
        drop(queue);

        if let Err(e) = shared.write_now() {
            warn!("Debounced save failed, will retry on the next cycle: {}", e);
        }

        queue = shared.lock();
        queue.in_flight = false;
        queue.writes += 1;
        if queue.pending {
            queue.pending = false;
            queue.requested_at = Some(Instant::now());
            debug!("Running pending save");
        }
        shared.wake.notify_all();
    }
}
