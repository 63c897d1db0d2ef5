//! Live event connection.
//!
//! `Disconnected → Connecting → Connected`; a dropped connection goes back to
//! `Disconnected` and is retried with capped exponential backoff. While the
//! app is backgrounded the channel is paused (`Suspended`) rather than torn
//! down. Each connect, disconnect or logout starts a new generation; work
//! belonging to an older generation stops at its next step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{AuthToken, Channel, RealtimeTransport, TransportError, TransportFrame};
use crate::config::RealtimeConfig;
use crate::event::{ConnectionState, RealtimeEvent, Topic};
use crate::model::{MutationKey, Notification, UserId};
use crate::mutation::OptimisticMutationStore;
use crate::pagination::{PaginatedListCache, Reconcile};
use crate::subscription::{AuthSignal, Subscribers, Subscription};
use crate::{calculate_retry_delay, generate_jitter, lock, spawn_detached, AppError};

#[derive(Debug, Default)]
pub struct RealtimeMetrics {
    pub connects: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub events_applied: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub reconciliations: AtomicU64,
}

impl RealtimeMetrics {
    pub fn snapshot(&self) -> RealtimeMetricsSnapshot {
        RealtimeMetricsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeMetricsSnapshot {
    pub connects: u64,
    pub reconnect_attempts: u64,
    pub events_applied: u64,
    pub frames_dropped: u64,
    pub reconciliations: u64,
}

#[derive(Clone)]
struct Session {
    user_id: UserId,
    token: AuthToken,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    generation: u64,
    session: Option<Session>,
    channel: Option<Arc<dyn Channel>>,
    topics: Vec<String>,
    task: Option<JoinHandle<()>>,
    // App is in the background; set independently of whether a channel exists.
    suspended: bool,
}

/// Why a frame stream stopped being read.
enum StreamEnd {
    Superseded,
    AuthExpired,
    Dropped(String),
}

pub struct RealtimeSyncChannel {
    transport: Arc<dyn RealtimeTransport>,
    mutations: Arc<OptimisticMutationStore>,
    notifications: Arc<PaginatedListCache<Notification>>,
    reconciler: Arc<dyn Reconcile>,
    auth: AuthSignal,
    config: RealtimeConfig,
    inner: Mutex<Inner>,
    states: Subscribers<(), ConnectionState>,
    metrics: RealtimeMetrics,
}

impl RealtimeSyncChannel {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        mutations: Arc<OptimisticMutationStore>,
        notifications: Arc<PaginatedListCache<Notification>>,
        reconciler: Arc<dyn Reconcile>,
        auth: AuthSignal,
        config: RealtimeConfig,
    ) -> Self {
        Self {
            transport,
            mutations,
            notifications,
            reconciler,
            auth,
            config,
            inner: Mutex::new(Inner::default()),
            states: Subscribers::new(),
            metrics: RealtimeMetrics::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn subscribe_state<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.states.subscribe((), callback)
    }

    pub fn metrics(&self) -> RealtimeMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Opens a connection for `user_id`, superseding any connection or
    /// reconnect attempt already under way.
    pub fn connect(self: &Arc<Self>, user_id: UserId, token: AuthToken) {
        let topics = Topic::topic_set(&user_id);
        let (generation, previous) = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.session = Some(Session { user_id, token });
            inner.topics = topics;
            inner.suspended = false;
            (inner.generation, inner.channel.take())
        };
        self.set_state(generation, ConnectionState::Connecting);

        let this = Arc::clone(self);
        let task = spawn_detached("realtime_connection", async move {
            if let Some(channel) = previous {
                channel.close().await;
            }
            this.run(generation).await;
        });

        let mut inner = lock(&self.inner);
        if inner.generation == generation {
            inner.task = task;
        } else if let Some(task) = task {
            task.abort();
        }
    }

    #[instrument(skip_all, fields(generation = generation))]
    async fn run(&self, generation: u64) {
        let mut attempt = 0u32;
        let mut reconnecting = false;
        loop {
            let Some(session) = self.session_for(generation) else {
                return;
            };
            self.set_state(generation, ConnectionState::Connecting);

            match self.open(generation, &session).await {
                Ok(Some(mut frames)) => {
                    attempt = 0;
                    if reconnecting {
                        self.metrics.reconciliations.fetch_add(1, Ordering::Relaxed);
                        self.reconciler.reconcile().await;
                    }
                    match self.read_frames(generation, &mut frames).await {
                        StreamEnd::Superseded => return,
                        StreamEnd::AuthExpired => {
                            self.escalate_auth(generation, TransportError::AuthExpired);
                            return;
                        }
                        StreamEnd::Dropped(reason) => {
                            warn!(reason = %reason, "realtime connection dropped");
                            let suspended = {
                                let mut inner = lock(&self.inner);
                                if inner.generation != generation {
                                    return;
                                }
                                inner.channel = None;
                                inner.suspended
                            };
                            if suspended {
                                // Picked up again by resume().
                                debug!("connection dropped while suspended, waiting for resume");
                                return;
                            }
                            self.set_state(generation, ConnectionState::Disconnected);
                        }
                    }
                }
                Ok(None) => return,
                Err(TransportError::AuthExpired) => {
                    self.escalate_auth(generation, TransportError::AuthExpired);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "realtime connect failed");
                    if lock(&self.inner).suspended {
                        // resume() reconnects with a fresh generation.
                        return;
                    }
                    self.set_state(generation, ConnectionState::Disconnected);
                }
            }

            reconnecting = true;
            let delay = calculate_retry_delay(
                attempt,
                self.config.base_reconnect_delay_ms,
                self.config.max_reconnect_delay_ms,
                generate_jitter(self.config.jitter_max_ms),
            );
            attempt = attempt.saturating_add(1);
            self.metrics
                .reconnect_attempts
                .fetch_add(1, Ordering::Relaxed);
            debug!(delay_ms = delay, attempt, "scheduling reconnect");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Connects and subscribes. `Ok(None)` when the generation was
    /// superseded meanwhile.
    async fn open(
        &self,
        generation: u64,
        session: &Session,
    ) -> Result<Option<UnboundedReceiver<TransportFrame>>, TransportError> {
        let handle = self
            .transport
            .connect(&session.user_id, &session.token)
            .await?;
        let channel = handle.channel;

        let topics = self.topics_for(generation);
        let Some(topics) = topics else {
            channel.close().await;
            return Ok(None);
        };
        if let Err(e) = channel.subscribe(&topics).await {
            channel.close().await;
            return Err(e);
        }

        let suspended = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation {
                None
            } else {
                inner.channel = Some(Arc::clone(&channel));
                Some(inner.suspended)
            }
        };
        match suspended {
            None => {
                channel.close().await;
                Ok(None)
            }
            Some(true) => {
                if let Err(e) = channel.pause().await {
                    warn!(error = %e, "pausing fresh channel failed");
                }
                self.set_state(generation, ConnectionState::Suspended);
                Ok(Some(handle.frames))
            }
            Some(false) => {
                self.metrics.connects.fetch_add(1, Ordering::Relaxed);
                info!(topics = topics.len(), "realtime connected");
                self.set_state(generation, ConnectionState::Connected);
                Ok(Some(handle.frames))
            }
        }
    }

    async fn read_frames(
        &self,
        generation: u64,
        frames: &mut UnboundedReceiver<TransportFrame>,
    ) -> StreamEnd {
        while let Some(frame) = frames.recv().await {
            if !self.is_current(generation) {
                return StreamEnd::Superseded;
            }
            match frame {
                TransportFrame::Event(event) => {
                    self.apply_event(event);
                }
                TransportFrame::Error(TransportError::AuthExpired) => return StreamEnd::AuthExpired,
                TransportFrame::Error(e) if e.is_retryable() => return StreamEnd::Dropped(e.to_string()),
                TransportFrame::Error(e) => {
                    self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "ignoring bad realtime frame");
                }
                TransportFrame::Closed { reason } => return StreamEnd::Dropped(reason),
            }
        }
        if self.is_current(generation) {
            StreamEnd::Dropped("frame stream ended".to_string())
        } else {
            StreamEnd::Superseded
        }
    }

    /// Applies one event. Assignments are idempotent; returns whether any
    /// state was touched.
    pub fn apply_event(&self, event: RealtimeEvent) -> bool {
        debug!(event = event.name(), "applying realtime event");
        let applied = match event {
            RealtimeEvent::NewNotification(notification) => {
                self.notifications.prepend(notification)
            }
            RealtimeEvent::FollowChanged {
                user_id,
                is_following,
            } => self
                .mutations
                .set_server_value(&MutationKey::follow(&user_id), is_following),
            RealtimeEvent::LikeChanged { post_id, count } => {
                self.mutations.set_like_count(&post_id, count);
                true
            }
            RealtimeEvent::ConnectionStateChanged(remote) => {
                debug!(remote = %remote, "server reported connection state");
                false
            }
        };
        if applied {
            self.metrics.events_applied.fetch_add(1, Ordering::Relaxed);
        }
        applied
    }

    /// Pauses the channel without tearing it down. Returns `false` when
    /// there is no session or it is already suspended.
    #[instrument(skip_all)]
    pub async fn suspend(&self) -> bool {
        let (generation, channel) = {
            let mut inner = lock(&self.inner);
            if inner.session.is_none() || inner.suspended {
                return false;
            }
            inner.suspended = true;
            (inner.generation, inner.channel.clone())
        };
        if let Some(channel) = channel {
            if let Err(e) = channel.pause().await {
                warn!(error = %e, "pausing realtime channel failed");
            }
        }
        self.set_state(generation, ConnectionState::Suspended);
        info!("realtime suspended");
        true
    }

    /// Leaves the suspended state, reconnecting if the channel was lost
    /// meanwhile. The caller owes a reconciliation fetch afterwards.
    #[instrument(skip_all)]
    pub async fn resume(self: &Arc<Self>) -> bool {
        let (generation, channel, session) = {
            let mut inner = lock(&self.inner);
            if !inner.suspended {
                return false;
            }
            inner.suspended = false;
            (inner.generation, inner.channel.clone(), inner.session.clone())
        };
        let Some(session) = session else {
            return false;
        };

        let resumed = match channel {
            Some(channel) => match channel.resume().await {
                Ok(()) => {
                    self.set_state(generation, ConnectionState::Connected);
                    true
                }
                Err(e) => {
                    warn!(error = %e, "resuming realtime channel failed, reconnecting");
                    false
                }
            },
            None => false,
        };
        if !resumed && self.is_current(generation) {
            self.connect(session.user_id, session.token);
        }
        info!(reconnected = !resumed, "realtime resumed");
        true
    }

    /// Closes the connection and forgets the session.
    pub async fn disconnect(&self) {
        self.shutdown(false).await;
    }

    /// Unsubscribes every topic, then closes the connection and forgets the
    /// session. Pending reconnects are cancelled.
    #[instrument(skip_all)]
    pub async fn logout(&self) {
        self.shutdown(true).await;
    }

    /// Stops background work without talking to the transport.
    pub fn abort(&self) {
        let mut inner = lock(&self.inner);
        inner.generation += 1;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
    }

    async fn shutdown(&self, unsubscribe: bool) {
        let (channel, topics) = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.session = None;
            inner.suspended = false;
            (inner.channel.take(), std::mem::take(&mut inner.topics))
        };
        self.force_state(ConnectionState::Disconnected);

        if let Some(channel) = channel {
            if unsubscribe && !topics.is_empty() {
                if let Err(e) = channel.unsubscribe(&topics).await {
                    warn!(error = %e, "unsubscribing realtime topics failed");
                }
            }
            channel.close().await;
        }
        info!(unsubscribe, "realtime disconnected");
    }

    fn escalate_auth(&self, generation: u64, cause: TransportError) {
        {
            let mut inner = lock(&self.inner);
            if inner.generation != generation {
                return;
            }
            inner.channel = None;
        }
        self.set_state(generation, ConnectionState::Disconnected);
        self.auth.raise(&AppError::from(cause));
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.inner).generation == generation
    }

    fn session_for(&self, generation: u64) -> Option<Session> {
        let inner = lock(&self.inner);
        if inner.generation == generation {
            inner.session.clone()
        } else {
            None
        }
    }

    fn topics_for(&self, generation: u64) -> Option<Vec<String>> {
        let inner = lock(&self.inner);
        (inner.generation == generation).then(|| inner.topics.clone())
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        {
            let mut inner = lock(&self.inner);
            if inner.generation != generation || inner.state == state {
                return;
            }
            inner.state = state;
        }
        debug!(state = %state, "connection state changed");
        self.states.notify(&(), &state);
    }

    fn force_state(&self, state: ConnectionState) {
        let changed = {
            let mut inner = lock(&self.inner);
            let changed = inner.state != state;
            inner.state = state;
            changed
        };
        if changed {
            self.states.notify(&(), &state);
        }
    }
}
