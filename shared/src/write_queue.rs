//! Write-coalescing persistence queue.
//!
//! Components enqueue the latest value for a key; repeated writes to the same
//! key collapse into one. [`WriteQueue::flush`] drains the queue to storage and
//! is run periodically and before any destructive operation. Logout disables
//! the queue and bumps its epoch so a flush that is already running stops
//! before touching the next key.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::MutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{KvError, KvKey};
use crate::kv_store::PersistentKeyValueStore;
use crate::{lock, spawn_detached, AppError, ErrorKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteQueueError {
    #[error("writes are disabled until the cache is re-initialized")]
    Disabled,

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl From<WriteQueueError> for AppError {
    fn from(e: WriteQueueError) -> Self {
        match e {
            WriteQueueError::Disabled => AppError::new(ErrorKind::Disposed, e.to_string()),
            WriteQueueError::Kv(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingWrite {
    Set(String),
    Remove,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<String, PendingWrite>,
    enabled: bool,
    epoch: u64,
}

#[derive(Debug, Default)]
pub struct WriteQueueMetrics {
    pub enqueued: AtomicU64,
    pub coalesced: AtomicU64,
    pub flushes: AtomicU64,
    pub writes: AtomicU64,
    pub storage_errors: AtomicU64,
    pub cancelled: AtomicU64,
}

impl WriteQueueMetrics {
    pub fn snapshot(&self) -> WriteQueueMetricsSnapshot {
        WriteQueueMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteQueueMetricsSnapshot {
    pub enqueued: u64,
    pub coalesced: u64,
    pub flushes: u64,
    pub writes: u64,
    pub storage_errors: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
    /// Entries dropped because the queue was disabled mid-flush.
    pub abandoned: usize,
}

pub struct WriteQueue {
    store: Arc<PersistentKeyValueStore>,
    state: Mutex<QueueState>,
    io_lock: tokio::sync::Mutex<()>,
    metrics: WriteQueueMetrics,
}

impl WriteQueue {
    /// Starts disabled; [`enable`](Self::enable) once a user scope is set.
    pub fn new(store: Arc<PersistentKeyValueStore>) -> Self {
        Self {
            store,
            state: Mutex::new(QueueState::default()),
            io_lock: tokio::sync::Mutex::new(()),
            metrics: WriteQueueMetrics::default(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<PersistentKeyValueStore> {
        &self.store
    }

    pub fn enqueue_set<T: Serialize>(&self, key: &KvKey, value: &T) -> Result<(), WriteQueueError> {
        let encoded = PersistentKeyValueStore::encode(value)?;
        self.enqueue(key, PendingWrite::Set(encoded))
    }

    pub fn enqueue_remove(&self, key: &KvKey) -> Result<(), WriteQueueError> {
        self.enqueue(key, PendingWrite::Remove)
    }

    fn enqueue(&self, key: &KvKey, write: PendingWrite) -> Result<(), WriteQueueError> {
        let mut state = lock(&self.state);
        if !state.enabled {
            return Err(WriteQueueError::Disabled);
        }
        let full = self.store.storage_key(key)?;
        if state.pending.insert(full, write).is_some() {
            self.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    pub fn enable(&self) {
        lock(&self.state).enabled = true;
    }

    /// Drains pending writes to storage. Failed writes are re-queued unless a
    /// newer value for the same key arrived meanwhile.
    #[instrument(skip_all)]
    pub async fn flush(&self) -> FlushReport {
        let _io = self.io_lock.lock().await;
        let (epoch, batch) = {
            let mut state = lock(&self.state);
            if !state.enabled || state.pending.is_empty() {
                return FlushReport::default();
            }
            (state.epoch, state.pending.drain().collect::<Vec<_>>())
        };
        self.metrics.flushes.fetch_add(1, Ordering::Relaxed);

        let mut report = FlushReport::default();
        let total = batch.len();
        for (index, (key, write)) in batch.into_iter().enumerate() {
            if !self.is_current(epoch) {
                report.abandoned = total - index;
                break;
            }
            let result = match &write {
                PendingWrite::Set(encoded) => self.store.write_raw(&key, encoded).await,
                PendingWrite::Remove => self.store.remove_raw(&key).await,
            };
            match result {
                Ok(()) => {
                    report.written += 1;
                    self.metrics.writes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "persisting cache entry failed, will retry");
                    let mut state = lock(&self.state);
                    if state.enabled && state.epoch == epoch {
                        state.pending.entry(key).or_insert(write);
                    }
                }
            }
        }

        if report.failed > 0 || report.abandoned > 0 {
            info!(
                written = report.written,
                failed = report.failed,
                abandoned = report.abandoned,
                "flush finished with errors"
            );
        } else {
            debug!(written = report.written, "flush finished");
        }
        report
    }

    fn is_current(&self, epoch: u64) -> bool {
        let state = lock(&self.state);
        state.enabled && state.epoch == epoch
    }

    /// Drops every pending write. Returns how many were dropped.
    pub fn cancel_pending(&self) -> usize {
        let cancelled = {
            let mut state = lock(&self.state);
            let n = state.pending.len();
            state.pending.clear();
            n
        };
        self.metrics
            .cancelled
            .fetch_add(cancelled as u64, Ordering::Relaxed);
        cancelled
    }

    /// Disables the queue, cancels pending writes and waits for any running
    /// flush to stop. Holding the returned guard keeps flushes out.
    pub async fn disable_and_drain(&self) -> MutexGuard<'_, ()> {
        {
            let mut state = lock(&self.state);
            state.enabled = false;
            state.epoch = state.epoch.wrapping_add(1);
        }
        let cancelled = self.cancel_pending();
        let guard = self.io_lock.lock().await;
        info!(cancelled, "write queue disabled");
        guard
    }

    pub fn metrics(&self) -> WriteQueueMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Flushes every `interval` until the queue is dropped.
    pub fn spawn_periodic_flush(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        let weak: Weak<Self> = Arc::downgrade(self);
        spawn_detached("periodic_flush", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(queue) = weak.upgrade() else { break };
                if queue.pending_len() > 0 {
                    queue.flush().await;
                }
            }
        })
    }
}
