//! In-process fakes for the platform collaborators.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

use crate::capabilities::{
    Ack, ApiError, AuthToken, BackendApi, Channel, ChannelHandle, DeviceStorage,
    GenerationError, KvError, MemoryStorage, PageResponse, RealtimeTransport, StorageErrorCode,
    ThumbnailGenerator, ThumbnailOptions, TransportError, TransportFrame,
};
use crate::lock;
use crate::model::{EntityId, UserId};

async fn pass_gate(gate: &Mutex<Option<Arc<Semaphore>>>) {
    let gate = lock(gate).clone();
    if let Some(gate) = gate {
        if let Ok(permit) = gate.acquire().await {
            permit.forget();
        }
    }
}

fn open_gate(gate: &Mutex<Option<Arc<Semaphore>>>, permits: usize) {
    if let Some(gate) = lock(gate).as_ref() {
        gate.add_permits(permits);
    }
}

pub fn items_json(ids: impl IntoIterator<Item = u32>) -> Vec<Value> {
    ids.into_iter().map(|id| json!({ "id": id })).collect()
}

pub fn notification_json(id: &str) -> Value {
    json!({ "id": id, "kind": "like", "created_at": 1 })
}

// --- Backend ---

#[derive(Default)]
pub struct FakeBackend {
    confirms: Mutex<VecDeque<Result<Ack, ApiError>>>,
    confirm_calls: Mutex<Vec<(EntityId, bool)>>,
    confirm_gate: Mutex<Option<Arc<Semaphore>>>,
    pages: Mutex<HashMap<String, VecDeque<Result<PageResponse<Value>, ApiError>>>>,
    fetch_calls: Mutex<Vec<(String, u32, u32)>>,
    fetch_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next confirmation result; an empty queue acks.
    pub fn push_confirm(&self, result: Result<Ack, ApiError>) {
        lock(&self.confirms).push_back(result);
    }

    pub fn confirm_calls(&self) -> Vec<(EntityId, bool)> {
        lock(&self.confirm_calls).clone()
    }

    pub fn hold_confirmations(&self) {
        *lock(&self.confirm_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_confirmations(&self, n: usize) {
        open_gate(&self.confirm_gate, n);
    }

    /// Queues the next page for `resource`; an empty queue serves an empty
    /// final page.
    pub fn push_page(&self, resource: &str, result: Result<PageResponse<Value>, ApiError>) {
        lock(&self.pages)
            .entry(resource.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn fetch_calls(&self) -> Vec<(String, u32, u32)> {
        lock(&self.fetch_calls).clone()
    }

    pub fn hold_fetches(&self) {
        *lock(&self.fetch_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_fetches(&self, n: usize) {
        open_gate(&self.fetch_gate, n);
    }

    async fn confirm(&self, entity: &EntityId, value: bool) -> Result<Ack, ApiError> {
        lock(&self.confirm_calls).push((entity.clone(), value));
        pass_gate(&self.confirm_gate).await;
        lock(&self.confirms).pop_front().unwrap_or_else(|| Ok(Ack::default()))
    }
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn fetch_page(
        &self,
        resource: &str,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<Value>, ApiError> {
        lock(&self.fetch_calls).push((resource.to_string(), page, size));
        pass_gate(&self.fetch_gate).await;
        lock(&self.pages)
            .get_mut(resource)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(PageResponse::new(Vec::new(), Some(false))))
    }

    async fn confirm_like(&self, post_id: &EntityId, liked: bool) -> Result<Ack, ApiError> {
        self.confirm(post_id, liked).await
    }

    async fn confirm_follow(&self, user_id: &EntityId, following: bool) -> Result<Ack, ApiError> {
        self.confirm(user_id, following).await
    }
}

// --- Realtime ---

#[derive(Default)]
pub struct FakeChannel {
    pub subscribed: Mutex<Vec<String>>,
    pub unsubscribed: Mutex<Vec<String>>,
    pub paused: AtomicBool,
    pub closed: AtomicBool,
    pub fail_resume: AtomicBool,
}

#[async_trait]
impl Channel for FakeChannel {
    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        lock(&self.subscribed).extend_from_slice(topics);
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        lock(&self.unsubscribed).extend_from_slice(topics);
        Ok(())
    }

    async fn pause(&self) -> Result<(), TransportError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), TransportError> {
        if self.fail_resume.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeTransport {
    connects: AtomicUsize,
    failures: Mutex<VecDeque<TransportError>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<TransportFrame>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: TransportError) {
        lock(&self.failures).push_back(error);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn channel(&self, index: usize) -> Arc<FakeChannel> {
        Arc::clone(&lock(&self.channels)[index])
    }

    pub fn latest_channel(&self) -> Option<Arc<FakeChannel>> {
        lock(&self.channels).last().cloned()
    }

    /// Delivers a frame on the most recent channel.
    pub fn send(&self, frame: TransportFrame) -> bool {
        lock(&self.senders)
            .last()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn connect(
        &self,
        _user_id: &UserId,
        _token: &AuthToken,
    ) -> Result<ChannelHandle, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        let channel = Arc::new(FakeChannel::default());
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.channels).push(Arc::clone(&channel));
        lock(&self.senders).push(tx);
        Ok(ChannelHandle {
            channel,
            frames: rx,
        })
    }
}

// --- Thumbnails ---

#[derive(Default)]
pub struct FakeGenerator {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uri_for(source: &str) -> String {
        let hash = blake3::hash(source.as_bytes());
        format!("file:///thumbs/{}.jpg", &hash.to_hex().as_str()[..12])
    }

    pub fn fail_for(&self, source: &str) {
        lock(&self.failing).insert(source.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn hold(&self) {
        *lock(&self.gate) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, n: usize) {
        open_gate(&self.gate, n);
    }
}

#[async_trait]
impl ThumbnailGenerator for FakeGenerator {
    async fn generate(
        &self,
        source_uri: &str,
        _options: ThumbnailOptions,
    ) -> Result<String, GenerationError> {
        lock(&self.calls).push(source_uri.to_string());
        pass_gate(&self.gate).await;
        if lock(&self.failing).contains(source_uri) {
            return Err(GenerationError::decode("unsupported codec"));
        }
        Ok(Self::uri_for(source_uri))
    }
}

// --- Storage ---

type WriteHook = Arc<dyn Fn() + Send + Sync>;

/// Memory storage whose writes can be made to fail, with a hook that runs
/// inside every write.
#[derive(Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    fail_writes: AtomicBool,
    on_write: Mutex<Option<WriteHook>>,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStorage {
        &self.inner
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn on_write(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.on_write) = Some(Arc::new(hook));
    }

    pub fn clear_on_write(&self) {
        *lock(&self.on_write) = None;
    }

    fn before_write(&self) -> Result<(), KvError> {
        let hook = lock(&self.on_write).clone();
        if let Some(hook) = hook {
            hook();
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::storage(StorageErrorCode::DiskFull, "disk full"));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStorage for FlakyStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, KvError> {
        self.inner.get_item(key).await
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.before_write()?;
        self.inner.set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), KvError> {
        self.before_write()?;
        self.inner.remove_item(key).await
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), KvError> {
        self.before_write()?;
        self.inner.multi_remove(keys).await
    }

    async fn all_keys(&self) -> Result<Vec<String>, KvError> {
        self.inner.all_keys().await
    }
}
