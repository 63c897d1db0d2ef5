//! Collaborators the host platform provides to the cache core.

mod http;
mod kv;
mod media;
mod push;

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

use std::sync::Arc;

pub use self::http::{Ack, ApiError, BackendApi, PageResponse, MAX_PAGE_SIZE};
pub use self::kv::{
    DeviceStorage, KeyNamespace, KvError, KvKey, MemoryStorage, StorageErrorCode, MAX_KEY_LENGTH,
    MAX_VALUE_SIZE,
};
pub use self::media::{
    GenerationError, MediaUrl, ThumbnailGenerator, ThumbnailOptions, ALLOWED_SCHEMES,
};
pub use self::push::{
    AuthToken, Channel, ChannelHandle, RealtimeTransport, TransportError, TransportFrame,
};

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteStorage;

#[derive(Clone)]
pub struct Capabilities {
    pub api: Arc<dyn BackendApi>,
    pub storage: Arc<dyn DeviceStorage>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub thumbnails: Arc<dyn ThumbnailGenerator>,
}

impl Capabilities {
    pub fn new(
        api: Arc<dyn BackendApi>,
        storage: Arc<dyn DeviceStorage>,
        transport: Arc<dyn RealtimeTransport>,
        thumbnails: Arc<dyn ThumbnailGenerator>,
    ) -> Self {
        Self {
            api,
            storage,
            transport,
            thumbnails,
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
