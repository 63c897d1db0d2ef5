//! Fakes for the platform collaborators, shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use feed_cache::capabilities::{
    Ack, ApiError, AuthToken, BackendApi, Capabilities, Channel, ChannelHandle, GenerationError,
    MemoryStorage, PageResponse, RealtimeTransport, ThumbnailGenerator, ThumbnailOptions,
    TransportError, TransportFrame,
};
use feed_cache::event::RealtimeEvent;
use feed_cache::model::{EntityId, UserId};
use feed_cache::{CacheConfig, CacheService};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

#[derive(Default)]
pub struct ScriptedBackend {
    pages: Mutex<HashMap<String, VecDeque<PageResponse<Value>>>>,
    fetches: Mutex<Vec<(String, u32)>>,
    confirms: Mutex<Vec<(EntityId, bool)>>,
    confirm_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedBackend {
    pub fn page(&self, resource: &str, items: Vec<Value>, has_more: Option<bool>) {
        self.pages
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .push_back(PageResponse::new(items, has_more));
    }

    pub fn fetches(&self, resource: &str) -> Vec<u32> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == resource)
            .map(|(_, page)| *page)
            .collect()
    }

    pub fn confirms(&self) -> Vec<(EntityId, bool)> {
        self.confirms.lock().unwrap().clone()
    }

    pub fn hold_confirms(&self) {
        *self.confirm_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_confirms(&self) {
        if let Some(gate) = self.confirm_gate.lock().unwrap().as_ref() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    async fn confirm(&self, entity: &EntityId, value: bool) -> Result<Ack, ApiError> {
        self.confirms.lock().unwrap().push((entity.clone(), value));
        let gate = self.confirm_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        Ok(Ack::default())
    }
}

#[async_trait]
impl BackendApi for ScriptedBackend {
    async fn fetch_page(
        &self,
        resource: &str,
        page: u32,
        _size: u32,
    ) -> Result<PageResponse<Value>, ApiError> {
        self.fetches
            .lock()
            .unwrap()
            .push((resource.to_string(), page));
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get_mut(resource)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| PageResponse::new(Vec::new(), Some(false))))
    }

    async fn confirm_like(&self, post_id: &EntityId, liked: bool) -> Result<Ack, ApiError> {
        self.confirm(post_id, liked).await
    }

    async fn confirm_follow(&self, user_id: &EntityId, following: bool) -> Result<Ack, ApiError> {
        self.confirm(user_id, following).await
    }
}

#[derive(Default)]
pub struct RecordingChannel {
    pub subscribed: Mutex<Vec<String>>,
    pub unsubscribed: Mutex<Vec<String>>,
    pub paused: AtomicBool,
    pub closed: AtomicBool,
}

#[async_trait]
impl Channel for RecordingChannel {
    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.subscribed.lock().unwrap().extend_from_slice(topics);
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.unsubscribed.lock().unwrap().extend_from_slice(topics);
        Ok(())
    }

    async fn pause(&self) -> Result<(), TransportError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), TransportError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Transport whose frames are pushed by the test.
#[derive(Default)]
pub struct LoopbackTransport {
    connects: AtomicUsize,
    users: Mutex<Vec<UserId>>,
    channels: Mutex<Vec<Arc<RecordingChannel>>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<TransportFrame>>>,
}

impl LoopbackTransport {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn users(&self) -> Vec<UserId> {
        self.users.lock().unwrap().clone()
    }

    pub fn latest_channel(&self) -> Arc<RecordingChannel> {
        Arc::clone(self.channels.lock().unwrap().last().unwrap())
    }

    pub fn emit(&self, event: RealtimeEvent) {
        self.send(TransportFrame::Event(event));
    }

    pub fn send(&self, frame: TransportFrame) {
        if let Some(tx) = self.senders.lock().unwrap().last() {
            let _ = tx.send(frame);
        }
    }
}

#[async_trait]
impl RealtimeTransport for LoopbackTransport {
    async fn connect(
        &self,
        user_id: &UserId,
        _token: &AuthToken,
    ) -> Result<ChannelHandle, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.users.lock().unwrap().push(user_id.clone());
        let channel = Arc::new(RecordingChannel::default());
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        self.senders.lock().unwrap().push(tx);
        Ok(ChannelHandle {
            channel,
            frames: rx,
        })
    }
}

#[derive(Default)]
pub struct StubGenerator {
    calls: AtomicUsize,
}

impl StubGenerator {
    pub fn thumb_for(source: &str) -> String {
        let name = source.rsplit('/').next().unwrap_or(source);
        format!("file:///thumbs/{name}.jpg")
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ThumbnailGenerator for StubGenerator {
    async fn generate(
        &self,
        source_uri: &str,
        _options: ThumbnailOptions,
    ) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Self::thumb_for(source_uri))
    }
}

pub struct App {
    pub service: CacheService,
    pub backend: Arc<ScriptedBackend>,
    pub transport: Arc<LoopbackTransport>,
    pub generator: Arc<StubGenerator>,
}

pub fn app(storage: Arc<MemoryStorage>) -> App {
    let backend = Arc::new(ScriptedBackend::default());
    let transport = Arc::new(LoopbackTransport::default());
    let generator = Arc::new(StubGenerator::default());
    let caps = Capabilities::new(
        backend.clone(),
        storage,
        transport.clone(),
        generator.clone(),
    );
    let service = CacheService::new(caps, CacheConfig::default()).unwrap();
    App {
        service,
        backend,
        transport,
        generator,
    }
}

pub fn posts(ids: impl IntoIterator<Item = u32>) -> Vec<Value> {
    ids.into_iter()
        .map(|id| json!({ "id": id, "author": format!("u{id}") }))
        .collect()
}

/// Lets spawned confirmation, generation and connection tasks run.
pub async fn settle() {
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
