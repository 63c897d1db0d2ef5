//! App lifecycle transitions applied across every cache.

use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

use crate::mutation::OptimisticMutationStore;
use crate::pagination::{ListRegistry, Reconcile};
use crate::realtime::RealtimeSyncChannel;
use crate::thumbnail::MediaThumbnailCache;
use crate::write_queue::{FlushReport, WriteQueue};
use crate::{lock, AppResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AppPhase {
    #[default]
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackgroundReport {
    pub flushed: usize,
    pub flush_failures: usize,
    pub thumbnails_swept: usize,
    pub suspended: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForegroundReport {
    pub resumed: bool,
    pub lists_reconciled: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogoutReport {
    pub lists_cleared: usize,
    pub keys_removed: usize,
}

pub struct CacheLifecycleCoordinator {
    queue: Arc<WriteQueue>,
    mutations: Arc<OptimisticMutationStore>,
    thumbnails: Arc<MediaThumbnailCache>,
    lists: Arc<ListRegistry>,
    realtime: Arc<RealtimeSyncChannel>,
    phase: Mutex<AppPhase>,
}

impl CacheLifecycleCoordinator {
    pub fn new(
        queue: Arc<WriteQueue>,
        mutations: Arc<OptimisticMutationStore>,
        thumbnails: Arc<MediaThumbnailCache>,
        lists: Arc<ListRegistry>,
        realtime: Arc<RealtimeSyncChannel>,
    ) -> Self {
        Self {
            queue,
            mutations,
            thumbnails,
            lists,
            realtime,
            phase: Mutex::new(AppPhase::Foreground),
        }
    }

    #[must_use]
    pub fn phase(&self) -> AppPhase {
        *lock(&self.phase)
    }

    /// Persists pending writes, sweeps expired thumbnails and pauses the
    /// realtime channel. In-memory state is kept.
    #[instrument(skip_all)]
    pub async fn on_background(&self) -> BackgroundReport {
        *lock(&self.phase) = AppPhase::Background;

        let first = self.queue.flush().await;
        let thumbnails_swept = self.thumbnails.sweep_expired();
        // The sweep rewrites the thumbnail index.
        let second = if thumbnails_swept > 0 {
            self.queue.flush().await
        } else {
            FlushReport::default()
        };
        let suspended = self.realtime.suspend().await;

        let report = BackgroundReport {
            flushed: first.written + second.written,
            flush_failures: second.failed.max(first.failed),
            thumbnails_swept,
            suspended,
        };
        info!(
            flushed = report.flushed,
            flush_failures = report.flush_failures,
            swept = report.thumbnails_swept,
            "entered background"
        );
        report
    }

    /// Resumes the realtime channel and re-fetches lists that may have
    /// missed events while suspended.
    #[instrument(skip_all)]
    pub async fn on_foreground(&self) -> ForegroundReport {
        *lock(&self.phase) = AppPhase::Foreground;

        let resumed = self.realtime.resume().await;
        let lists_reconciled = self.lists.reconcile().await;
        info!(resumed, lists_reconciled, "entered foreground");
        ForegroundReport {
            resumed,
            lists_reconciled,
        }
    }

    /// Tears down the session: pending writes are cancelled first, then all
    /// in-memory and persisted state is cleared while flushes are held off.
    /// Writes stay disabled until the queue is enabled again.
    #[instrument(skip_all)]
    pub async fn on_logout(&self) -> AppResult<LogoutReport> {
        let io_guard = self.queue.disable_and_drain().await;

        self.realtime.logout().await;
        self.mutations.clear();
        self.thumbnails.clear();
        let lists_cleared = self.lists.clear_all();

        let store = self.queue.store();
        let removed = store.clear_all().await;
        store.clear_user();
        drop(io_guard);

        let keys_removed = removed.map_err(|e| {
            warn!(error = %e, "clearing persisted cache failed");
            e
        })?;
        info!(lists_cleared, keys_removed, "session state cleared");
        Ok(LogoutReport {
            lists_cleared,
            keys_removed,
        })
    }
}
