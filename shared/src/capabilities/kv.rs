use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::{lock, AppError, ErrorKind};

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

/// Device key/value storage provided by the host platform.
///
/// Keys and values are opaque strings; every call may fail.
#[async_trait]
pub trait DeviceStorage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn remove_item(&self, key: &str) -> Result<(), KvError>;
    async fn multi_remove(&self, keys: &[String]) -> Result<(), KvError>;
    async fn all_keys(&self) -> Result<Vec<String>, KvError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    /// For compile-time constant keys, which are known to be valid.
    pub(crate) fn fixed(namespace: KeyNamespace, key: &'static str) -> Self {
        debug_assert!(Self::validate_key(key).is_ok(), "invalid fixed key {key}");
        Self {
            namespace,
            key: key.to_string(),
        }
    }

    /// `namespace:key`, without the user scope.
    #[must_use]
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    #[must_use]
    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Mutations,
    Thumbnails,
    Session,
    Custom(String),
}

impl KeyNamespace {
    #[must_use]
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Mutations => "mutations",
            KeyNamespace::Thumbnails => "thumbnails",
            KeyNamespace::Session => "session",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!("custom namespace must be 1..={MAX_PREFIX_LENGTH} bytes"),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },

    #[error("store is not initialized for a user")]
    NotInitialized,
}

impl KvError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }

    pub fn serialization(message: impl Into<String>, key: Option<&str>) -> Self {
        Self::Serialization {
            message: message.into(),
            key: key.map(str::to_string),
        }
    }
}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        let kind = match &e {
            KvError::Serialization { .. } => ErrorKind::Serialization,
            KvError::InvalidKey { .. } | KvError::ValueTooLarge { .. } => ErrorKind::Validation,
            KvError::NotInitialized => ErrorKind::InvalidState,
            KvError::Storage { .. } => ErrorKind::Storage,
        };
        AppError::new(kind, "local storage operation failed").with_internal(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::Busy | StorageErrorCode::Locked | StorageErrorCode::IoError
        )
    }
}

/// In-process storage. Used on platforms without a native store and in tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    /// Raw contents, for inspection.
    #[must_use]
    pub fn dump(&self) -> BTreeMap<String, String> {
        lock(&self.items).clone()
    }
}

#[async_trait]
impl DeviceStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(lock(&self.items).get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        lock(&self.items).insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), KvError> {
        lock(&self.items).remove(key);
        Ok(())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), KvError> {
        let mut items = lock(&self.items);
        for key in keys {
            items.remove(key);
        }
        Ok(())
    }

    async fn all_keys(&self) -> Result<Vec<String>, KvError> {
        Ok(lock(&self.items).keys().cloned().collect())
    }
}
