use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::{
    AppError, ErrorKind, BASE_RETRY_DELAY_MS, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_KEY_PREFIX,
    DEFAULT_MAX_PAGES, DEFAULT_MAX_THUMBNAILS, DEFAULT_PAGE_SIZE, DEFAULT_THUMBNAIL_BATCH_SIZE,
    DEFAULT_THUMBNAIL_QUALITY, DEFAULT_THUMBNAIL_TTL_MS, JITTER_MAX_MS, MAX_RETRY_DELAY_MS,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("config parse error: {0}")]
    Parse(String),
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub page_size: u32,
    pub max_pages: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl PaginationConfig {
    /// Upper bound on items held by one window.
    #[must_use]
    pub fn max_items(&self) -> usize {
        (self.max_pages as usize).saturating_mul(self.page_size as usize)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub ttl_ms: u64,
    pub batch_size: usize,
    pub quality: f32,
    pub max_entries: usize,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_THUMBNAIL_TTL_MS,
            batch_size: DEFAULT_THUMBNAIL_BATCH_SIZE,
            quality: DEFAULT_THUMBNAIL_QUALITY,
            max_entries: DEFAULT_MAX_THUMBNAILS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub key_prefix: String,
    pub flush_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

impl PersistenceConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub confirm_max_attempts: u32,
    pub confirm_base_backoff_ms: u64,
    pub confirm_max_backoff_ms: u64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            confirm_max_attempts: 3,
            confirm_base_backoff_ms: 500,
            confirm_max_backoff_ms: 8_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub base_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_reconnect_delay_ms: BASE_RETRY_DELAY_MS,
            max_reconnect_delay_ms: MAX_RETRY_DELAY_MS,
            jitter_max_ms: JITTER_MAX_MS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub pagination: PaginationConfig,
    pub thumbnails: ThumbnailConfig,
    pub persistence: PersistenceConfig,
    pub mutations: MutationConfig,
    pub realtime: RealtimeConfig,
}

impl CacheConfig {
    /// Parses a JSON config; missing sections and fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pagination.page_size == 0 {
            return Err(invalid("pagination.page_size", "must be > 0"));
        }
        if self.pagination.max_pages == 0 {
            return Err(invalid("pagination.max_pages", "must be > 0"));
        }
        if self.thumbnails.ttl_ms == 0 {
            return Err(invalid("thumbnails.ttl_ms", "must be > 0"));
        }
        if self.thumbnails.batch_size == 0 {
            return Err(invalid("thumbnails.batch_size", "must be > 0"));
        }
        if self.thumbnails.max_entries == 0 {
            return Err(invalid("thumbnails.max_entries", "must be > 0"));
        }
        if !(self.thumbnails.quality > 0.0 && self.thumbnails.quality <= 1.0) {
            return Err(invalid(
                "thumbnails.quality",
                format!("must be in (0, 1], got {}", self.thumbnails.quality),
            ));
        }
        let prefix = &self.persistence.key_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid(
                "persistence.key_prefix",
                "must be non-empty and contain only [A-Za-z0-9_-]",
            ));
        }
        if self.persistence.flush_interval_ms == 0 {
            return Err(invalid("persistence.flush_interval_ms", "must be > 0"));
        }
        if self.mutations.confirm_max_attempts == 0 {
            return Err(invalid("mutations.confirm_max_attempts", "must be > 0"));
        }
        if self.mutations.confirm_max_backoff_ms < self.mutations.confirm_base_backoff_ms {
            return Err(invalid(
                "mutations.confirm_max_backoff_ms",
                "must be >= confirm_base_backoff_ms",
            ));
        }
        if self.realtime.base_reconnect_delay_ms == 0 {
            return Err(invalid("realtime.base_reconnect_delay_ms", "must be > 0"));
        }
        if self.realtime.max_reconnect_delay_ms < self.realtime.base_reconnect_delay_ms {
            return Err(invalid(
                "realtime.max_reconnect_delay_ms",
                "must be >= base_reconnect_delay_ms",
            ));
        }
        Ok(())
    }
}
