//! Typed, user-scoped access to device storage.
//!
//! Every persisted value is stored under
//! `{prefix}:{scope}:{namespace}:{key}`, where `scope` is derived from the
//! authenticated user, and wrapped in a versioned JSON envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{DeviceStorage, KvError, KvKey};
use crate::model::UserId;

pub const ENVELOPE_VERSION: u32 = 1;
const SCOPE_HEX_LEN: usize = 16;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    v: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    data: serde_json::Value,
}

pub struct PersistentKeyValueStore {
    storage: Arc<dyn DeviceStorage>,
    prefix: String,
    scope: RwLock<Option<String>>,
}

impl PersistentKeyValueStore {
    pub fn new(storage: Arc<dyn DeviceStorage>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            scope: RwLock::new(None),
        }
    }

    /// Stable, non-reversible scope for a user id.
    #[must_use]
    pub fn scope_for(user_id: &UserId) -> String {
        let hash = blake3::hash(user_id.as_str().as_bytes());
        hash.to_hex().as_str()[..SCOPE_HEX_LEN].to_string()
    }

    pub fn set_user(&self, user_id: &UserId) {
        let scope = Self::scope_for(user_id);
        debug!(scope = %scope, "storage scope set");
        *self
            .scope
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(scope);
    }

    pub fn clear_user(&self) {
        *self
            .scope
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    #[must_use]
    pub fn scope(&self) -> Option<String> {
        self.scope
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full device key for `key` under the current user scope.
    pub fn storage_key(&self, key: &KvKey) -> Result<String, KvError> {
        let scope = self.scope().ok_or(KvError::NotInitialized)?;
        Ok(format!("{}:{}:{}", self.prefix, scope, key.raw()))
    }

    pub fn encode<T: Serialize>(value: &T) -> Result<String, KvError> {
        serde_json::to_string(&EnvelopeRef {
            v: ENVELOPE_VERSION,
            data: value,
        })
        .map_err(|e| KvError::serialization(e.to_string(), None))
    }

    pub fn decode<T: DeserializeOwned>(raw: &str, key: &str) -> Result<T, KvError> {
        let envelope: Envelope =
            serde_json::from_str(raw).map_err(|e| KvError::serialization(e.to_string(), Some(key)))?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(KvError::serialization(
                format!("unsupported envelope version {}", envelope.v),
                Some(key),
            ));
        }
        serde_json::from_value(envelope.data)
            .map_err(|e| KvError::serialization(e.to_string(), Some(key)))
    }

    #[instrument(skip_all, fields(key = %key.raw()))]
    pub async fn get<T: DeserializeOwned>(&self, key: &KvKey) -> Result<Option<T>, KvError> {
        let full = self.storage_key(key)?;
        match self.storage.get_item(&full).await? {
            Some(raw) => Self::decode(&raw, &full).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get), but corrupted or unreadable values are
    /// logged and treated as absent.
    pub async fn get_or_absent<T: DeserializeOwned>(&self, key: &KvKey) -> Option<T> {
        match self.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key.raw(), error = %e, "ignoring unreadable persisted value");
                None
            }
        }
    }

    #[instrument(skip_all, fields(key = %key.raw()))]
    pub async fn set<T: Serialize + Sync>(&self, key: &KvKey, value: &T) -> Result<(), KvError> {
        let full = self.storage_key(key)?;
        let encoded = Self::encode(value)?;
        self.storage.set_item(&full, &encoded).await
    }

    #[instrument(skip_all, fields(key = %key.raw()))]
    pub async fn remove(&self, key: &KvKey) -> Result<(), KvError> {
        let full = self.storage_key(key)?;
        self.storage.remove_item(&full).await
    }

    /// Writes an already-encoded value under a full device key.
    pub(crate) async fn write_raw(&self, full_key: &str, encoded: &str) -> Result<(), KvError> {
        self.storage.set_item(full_key, encoded).await
    }

    pub(crate) async fn remove_raw(&self, full_key: &str) -> Result<(), KvError> {
        self.storage.remove_item(full_key).await
    }

    /// Removes every key this crate ever wrote, for all users.
    #[instrument(skip_all, fields(prefix = %self.prefix))]
    pub async fn clear_all(&self) -> Result<usize, KvError> {
        let marker = format!("{}:", self.prefix);
        let keys: Vec<String> = self
            .storage
            .all_keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(&marker))
            .collect();
        if !keys.is_empty() {
            self.storage.multi_remove(&keys).await?;
        }
        info!(removed = keys.len(), "persisted cache cleared");
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{KeyNamespace, MemoryStorage};
    use std::collections::HashMap;

    fn store() -> (Arc<MemoryStorage>, PersistentKeyValueStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = PersistentKeyValueStore::new(storage.clone(), "feedcache");
        (storage, store)
    }

    fn key(name: &str) -> KvKey {
        KvKey::new(KeyNamespace::Session, name).unwrap()
    }

    #[tokio::test]
    async fn test_requires_user_scope() {
        let (_, store) = store();
        assert_eq!(store.get::<u32>(&key("x")).await, Err(KvError::NotInitialized));
        assert_eq!(store.set(&key("x"), &1u32).await, Err(KvError::NotInitialized));
    }

    #[tokio::test]
    async fn test_typed_roundtrip_and_layout() {
        let (storage, store) = store();
        store.set_user(&UserId::new("alice"));

        let mut value = HashMap::new();
        value.insert("p1".to_string(), true);
        store.set(&key("likes"), &value).await.unwrap();

        let loaded: Option<HashMap<String, bool>> = store.get(&key("likes")).await.unwrap();
        assert_eq!(loaded, Some(value));

        let scope = PersistentKeyValueStore::scope_for(&UserId::new("alice"));
        assert_eq!(scope.len(), 16);
        let raw = storage.dump();
        let stored = raw.get(&format!("feedcache:{scope}:session:likes")).unwrap();
        assert!(stored.starts_with(r#"{"v":1,"data":"#));
    }

    #[tokio::test]
    async fn test_users_do_not_share_keys() {
        let (_, store) = store();
        store.set_user(&UserId::new("alice"));
        store.set(&key("flag"), &true).await.unwrap();

        store.set_user(&UserId::new("bob"));
        assert_eq!(store.get::<bool>(&key("flag")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupted_and_future_versions_are_rejected() {
        let (storage, store) = store();
        store.set_user(&UserId::new("alice"));
        let full = store.storage_key(&key("blob")).unwrap();

        storage.set_item(&full, "{not json").await.unwrap();
        assert!(matches!(
            store.get::<u32>(&key("blob")).await,
            Err(KvError::Serialization { .. })
        ));
        assert_eq!(store.get_or_absent::<u32>(&key("blob")).await, None);

        storage.set_item(&full, r#"{"v":2,"data":5}"#).await.unwrap();
        assert!(store.get::<u32>(&key("blob")).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_all_spans_users_and_spares_foreign_keys() {
        let (storage, store) = store();
        storage.set_item("other_app:token", "x").await.unwrap();
        for user in ["alice", "bob"] {
            store.set_user(&UserId::new(user));
            store.set(&key("flag"), &true).await.unwrap();
        }

        assert_eq!(store.clear_all().await.unwrap(), 2);
        assert_eq!(storage.all_keys().await.unwrap(), vec!["other_app:token".to_string()]);
    }
}
