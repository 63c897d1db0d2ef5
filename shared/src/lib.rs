//! Client-side cache and synchronization core for the feed app.
//!
//! Holds user intent (likes, follows), paginated content windows and video
//! thumbnails, and keeps them consistent across optimistic edits, server
//! confirmation, the realtime channel and app lifecycle transitions.
//! [`CacheService`] is the composition root; everything else is reachable
//! from it.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod config;
pub mod event;
pub mod kv_store;
pub mod lifecycle;
pub mod model;
pub mod mutation;
pub mod pagination;
pub mod realtime;
pub mod service;
pub mod subscription;
pub mod thumbnail;
pub mod write_queue;

#[cfg(test)]
mod testing;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub use capabilities::Capabilities;
pub use config::CacheConfig;
pub use model::UnixTimeMs;
pub use service::CacheService;

pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_THUMBNAIL_TTL_MS: u64 = 7 * DAY_MS;
pub const DEFAULT_THUMBNAIL_BATCH_SIZE: usize = 5;
pub const DEFAULT_THUMBNAIL_QUALITY: f32 = 0.7;
pub const DEFAULT_MAX_THUMBNAILS: usize = 500;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_MAX_PAGES: u32 = 10;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_KEY_PREFIX: &str = "feedcache";
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const JITTER_MAX_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    TransientNetwork,
    Server,
    AuthExpired,
    Conflict,
    Storage,
    Generation,
    Serialization,
    Validation,
    InvalidState,
    Disposed,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::TransientNetwork => "TRANSIENT_NETWORK",
            Self::Server => "SERVER_ERROR",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::Conflict => "CONFLICT",
            Self::Storage => "STORAGE_ERROR",
            Self::Generation => "GENERATION_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Disposed => "DISPOSED",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::TransientNetwork | Self::Server | Self::Storage | Self::Generation => {
                ErrorSeverity::Transient
            }

            Self::Serialization | Self::InvalidState => ErrorSeverity::Fatal,

            Self::AuthExpired
            | Self::Conflict
            | Self::Validation
            | Self::Disposed
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork | Self::Server | Self::Storage)
    }

    /// Only an expired session crosses component boundaries.
    #[must_use]
    pub const fn escalates(self) -> bool {
        matches!(self, Self::AuthExpired)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub const fn escalates(&self) -> bool {
        self.kind.escalates()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

/// Time source for everything that stamps or expires cached state.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Clock that only moves when told to. Used for deterministic TTL handling.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now_ms.store(now.0, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}

/// Locks a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Spawns onto the current tokio runtime, or logs and drops the task when
/// called outside of one.
pub(crate) fn spawn_detached<F>(label: &'static str, task: F) -> Option<tokio::task::JoinHandle<()>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(task)),
        Err(_) => {
            tracing::warn!(task = label, "no async runtime available, task skipped");
            None
        }
    }
}

/// Capped exponential backoff: `base * 2^attempt`, clamped to `max`, plus jitter.
#[must_use]
pub fn calculate_retry_delay(attempt: u32, base_ms: u64, max_ms: u64, jitter_ms: u64) -> u64 {
    let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt.min(32)));
    let capped = exponential.min(max_ms);
    capped.saturating_add(jitter_ms)
}

#[must_use]
pub fn generate_jitter(max_ms: u64) -> u64 {
    use rand::Rng;
    if max_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..max_ms)
}
