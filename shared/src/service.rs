//! Composition root. One [`CacheService`] is built at startup and handed to
//! whatever drives the UI; it owns every cache and the background tasks
//! that keep them in sync.

use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, Span};
use uuid::Uuid;

use crate::capabilities::{AuthToken, BackendApi, Capabilities};
use crate::config::CacheConfig;
use crate::event::ConnectionState;
use crate::kv_store::PersistentKeyValueStore;
use crate::lifecycle::{BackgroundReport, CacheLifecycleCoordinator, ForegroundReport, LogoutReport};
use crate::model::{EntityId, Identifiable, ListKey, MutationKey, Notification, UserId};
use crate::mutation::{MutationMetricsSnapshot, OptimisticMutationStore};
use crate::pagination::{
    BackendPageSource, ListMetricsSnapshot, ListRegistry, LoadOutcome, ManagedList,
    PaginatedListCache,
};
use crate::realtime::{RealtimeMetricsSnapshot, RealtimeSyncChannel};
use crate::subscription::{AuthSignal, Subscription};
use crate::thumbnail::{MediaThumbnailCache, PregenerateReport, ThumbnailMetricsSnapshot};
use crate::write_queue::{FlushReport, WriteQueue, WriteQueueMetricsSnapshot};
use crate::{lock, AppError, AppResult, Clock, ErrorKind, SystemClock};

pub const NOTIFICATIONS_RESOURCE: &str = "notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ActiveSession {
    id: SessionId,
    user_id: UserId,
    flush_task: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn stop(&mut self) {
        if let Some(task) = self.flush_task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMetrics {
    pub writes: WriteQueueMetricsSnapshot,
    pub mutations: MutationMetricsSnapshot,
    pub lists: ListMetricsSnapshot,
    pub thumbnails: ThumbnailMetricsSnapshot,
    pub realtime: RealtimeMetricsSnapshot,
}

pub struct CacheService {
    api: Arc<dyn BackendApi>,
    config: CacheConfig,
    auth: AuthSignal,
    queue: Arc<WriteQueue>,
    mutations: Arc<OptimisticMutationStore>,
    thumbnails: Arc<MediaThumbnailCache>,
    notifications: Arc<PaginatedListCache<Notification>>,
    lists: Arc<ListRegistry>,
    realtime: Arc<RealtimeSyncChannel>,
    lifecycle: CacheLifecycleCoordinator,
    session: Mutex<Option<ActiveSession>>,
}

impl CacheService {
    pub fn new(caps: Capabilities, config: CacheConfig) -> AppResult<Self> {
        Self::with_clock(caps, config, Arc::new(SystemClock))
    }

    /// Builds the service with an explicit time source for TTLs and
    /// mutation timestamps.
    pub fn with_clock(
        caps: Capabilities,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        config.validate()?;
        let auth = AuthSignal::new();

        let store = Arc::new(PersistentKeyValueStore::new(
            caps.storage,
            config.persistence.key_prefix.clone(),
        ));
        let queue = Arc::new(WriteQueue::new(store));
        let mutations = Arc::new(OptimisticMutationStore::new(
            Arc::clone(&caps.api),
            Arc::clone(&queue),
            Arc::clone(&clock),
            auth.clone(),
            config.mutations.clone(),
        ));
        let thumbnails = Arc::new(MediaThumbnailCache::new(
            caps.thumbnails,
            Arc::clone(&queue),
            clock,
            config.thumbnails.clone(),
        ));

        let notifications = Arc::new(
            PaginatedListCache::new(
                ListKey::notifications(),
                Arc::new(BackendPageSource::new(
                    Arc::clone(&caps.api),
                    NOTIFICATIONS_RESOURCE,
                )),
                config.pagination.clone(),
            )
            .with_auth_signal(auth.clone()),
        );
        let lists = Arc::new(ListRegistry::new());
        lists.register(notifications.clone(), true);

        let realtime = Arc::new(RealtimeSyncChannel::new(
            caps.transport,
            Arc::clone(&mutations),
            Arc::clone(&notifications),
            lists.clone(),
            auth.clone(),
            config.realtime.clone(),
        ));
        let lifecycle = CacheLifecycleCoordinator::new(
            Arc::clone(&queue),
            Arc::clone(&mutations),
            Arc::clone(&thumbnails),
            Arc::clone(&lists),
            Arc::clone(&realtime),
        );

        Ok(Self {
            api: caps.api,
            config,
            auth,
            queue,
            mutations,
            thumbnails,
            notifications,
            lists,
            realtime,
            lifecycle,
            session: Mutex::new(None),
        })
    }

    // --- Session ---

    /// Starts a session for `user_id`: hydrates persisted state, starts the
    /// periodic flush, connects realtime and re-sends unconfirmed intents.
    #[instrument(skip_all, fields(user_id = %user_id, session = tracing::field::Empty))]
    pub async fn init(&self, user_id: UserId, token: AuthToken) -> AppResult<SessionId> {
        let id = SessionId::generate();
        {
            let mut session = lock(&self.session);
            if let Some(active) = session.as_ref() {
                return Err(AppError::new(
                    ErrorKind::InvalidState,
                    "a session is already active",
                )
                .with_context("user_id", active.user_id.as_str()));
            }
            *session = Some(ActiveSession {
                id,
                user_id: user_id.clone(),
                flush_task: None,
            });
        }
        Span::current().record("session", tracing::field::display(&id));

        self.queue.store().set_user(&user_id);
        self.auth.reset();
        self.queue.enable();

        let records = self.mutations.hydrate().await;
        let thumbnails = self.thumbnails.hydrate().await;
        let flush_task = self
            .queue
            .spawn_periodic_flush(self.config.persistence.flush_interval());
        {
            let mut session = lock(&self.session);
            match session.as_mut() {
                Some(active) if active.id == id => active.flush_task = flush_task,
                _ => {
                    if let Some(task) = flush_task {
                        task.abort();
                    }
                    return Err(AppError::new(
                        ErrorKind::Disposed,
                        "session ended during initialization",
                    ));
                }
            }
        }

        self.realtime.connect(user_id, token);
        let redispatched = self.mutations.redispatch_pending();
        info!(records, thumbnails, redispatched, "session initialized");
        Ok(id)
    }

    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        lock(&self.session).as_ref().map(|s| s.id)
    }

    #[must_use]
    pub fn current_user(&self) -> Option<UserId> {
        lock(&self.session).as_ref().map(|s| s.user_id.clone())
    }

    /// Ends the session without discarding anything: pending writes are
    /// flushed, then the realtime connection is closed and writes are
    /// disabled until the next `init`.
    #[instrument(skip_all)]
    pub async fn dispose(&self) -> FlushReport {
        if let Some(mut active) = lock(&self.session).take() {
            active.stop();
        }
        let report = self.queue.flush().await;
        self.realtime.disconnect().await;
        drop(self.queue.disable_and_drain().await);
        info!(written = report.written, failed = report.failed, "service disposed");
        report
    }

    /// Ends the session and wipes every trace of it, in memory and on disk.
    pub async fn logout(&self) -> AppResult<LogoutReport> {
        if let Some(mut active) = lock(&self.session).take() {
            active.stop();
        }
        self.lifecycle.on_logout().await
    }

    pub async fn on_background(&self) -> BackgroundReport {
        self.lifecycle.on_background().await
    }

    pub async fn on_foreground(&self) -> ForegroundReport {
        self.lifecycle.on_foreground().await
    }

    #[must_use]
    pub fn auth_signal(&self) -> &AuthSignal {
        &self.auth
    }

    fn require_session(&self) -> AppResult<()> {
        if lock(&self.session).is_some() {
            Ok(())
        } else {
            Err(AppError::new(ErrorKind::InvalidState, "no active session"))
        }
    }

    // --- Mutations ---

    /// Flips the like on `post_id` and returns the value held before.
    pub fn toggle_like(&self, post_id: &EntityId) -> AppResult<bool> {
        self.require_session()?;
        Ok(self.mutations.toggle(MutationKey::like(post_id)))
    }

    /// Flips the follow on `user_id` and returns the value held before.
    pub fn toggle_follow(&self, user_id: &EntityId) -> AppResult<bool> {
        self.require_session()?;
        Ok(self.mutations.toggle(MutationKey::follow(user_id)))
    }

    #[must_use]
    pub fn is_liked(&self, post_id: &EntityId) -> bool {
        self.mutations.value(&MutationKey::like(post_id))
    }

    #[must_use]
    pub fn is_following(&self, user_id: &EntityId) -> bool {
        self.mutations.value(&MutationKey::follow(user_id))
    }

    #[must_use]
    pub fn like_count(&self, post_id: &EntityId) -> u64 {
        self.mutations.like_count(post_id).unwrap_or(0)
    }

    pub fn subscribe_like<F>(&self, post_id: &EntityId, callback: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.mutations.subscribe(MutationKey::like(post_id), callback)
    }

    pub fn subscribe_follow<F>(&self, user_id: &EntityId, callback: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.mutations.subscribe(MutationKey::follow(user_id), callback)
    }

    pub fn subscribe_like_count<F>(&self, post_id: &EntityId, callback: F) -> Subscription
    where
        F: Fn(&u64) + Send + Sync + 'static,
    {
        self.mutations.subscribe_count(post_id.clone(), callback)
    }

    // --- Lists ---

    #[must_use]
    pub fn notifications(&self) -> &Arc<PaginatedListCache<Notification>> {
        &self.notifications
    }

    /// Creates a list backed by the backend's `resource` and registers it
    /// under `key`, replacing any list registered there before.
    pub fn register_list<T>(
        &self,
        key: ListKey,
        resource: &str,
        reconcile_on_resume: bool,
    ) -> Arc<PaginatedListCache<T>>
    where
        T: Identifiable + Clone + DeserializeOwned + Send + Sync + 'static,
    {
        let list = Arc::new(
            PaginatedListCache::new(
                key,
                Arc::new(BackendPageSource::<T>::new(Arc::clone(&self.api), resource)),
                self.config.pagination.clone(),
            )
            .with_auth_signal(self.auth.clone()),
        );
        if self.lists.register(list.clone(), reconcile_on_resume).is_some() {
            info!(list = %list.key(), "list registration replaced");
        }
        list
    }

    fn list(&self, key: &ListKey) -> AppResult<Arc<dyn ManagedList>> {
        self.lists.get(key).ok_or_else(|| {
            AppError::new(ErrorKind::Validation, "unknown list").with_context("list", key.as_str())
        })
    }

    pub async fn load_more(&self, key: &ListKey) -> AppResult<LoadOutcome> {
        self.list(key)?.load_more().await
    }

    pub async fn refresh(&self, key: &ListKey) -> AppResult<LoadOutcome> {
        self.list(key)?.refresh().await
    }

    // --- Thumbnails ---

    /// The thumbnail for `source_url` if cached, otherwise `fallback_url`
    /// while one is generated.
    #[must_use]
    pub fn thumbnail(&self, source_url: &str, fallback_url: &str, time_ms: u64) -> String {
        self.thumbnails
            .get_or_generate(source_url, fallback_url, time_ms)
    }

    pub async fn prefetch_thumbnails(&self, urls: &[String]) -> PregenerateReport {
        self.thumbnails.pregenerate(urls).await
    }

    pub fn subscribe_thumbnail<F>(&self, source_url: &str, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.thumbnails.subscribe(source_url, callback)
    }

    // --- Realtime ---

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.realtime.state()
    }

    pub fn subscribe_connection<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.realtime.subscribe_state(callback)
    }

    pub fn metrics(&self) -> ServiceMetrics {
        ServiceMetrics {
            writes: self.queue.metrics(),
            mutations: self.mutations.metrics(),
            lists: self.lists.metrics(),
            thumbnails: self.thumbnails.metrics(),
            realtime: self.realtime.metrics(),
        }
    }
}

impl Drop for CacheService {
    fn drop(&mut self) {
        if let Some(mut active) = lock(&self.session).take() {
            active.stop();
        }
        self.realtime.abort();
    }
}
