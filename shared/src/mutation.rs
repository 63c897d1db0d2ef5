//! Optimistic like/follow state.
//!
//! A user toggle is applied locally and synchronously ([`OptimisticMutationStore::apply_local`]),
//! then confirmed in the background. Every settlement (confirm, rollback,
//! conflict) carries the intent sequence it was issued for and is discarded
//! when a newer intent exists for the same entity.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{Ack, ApiError, BackendApi, KeyNamespace, KvKey};
use crate::config::MutationConfig;
use crate::model::{EntityId, LikeCounter, MutationKey, MutationKind, MutationRecord};
use crate::subscription::{AuthSignal, Subscribers, Subscription};
use crate::write_queue::WriteQueue;
use crate::{calculate_retry_delay, generate_jitter, lock, spawn_detached, AppError, Clock};

fn records_key() -> KvKey {
    KvKey::fixed(KeyNamespace::Mutations, "records")
}

fn counters_key() -> KvKey {
    KvKey::fixed(KeyNamespace::Mutations, "counters")
}

/// Ticket for one local intent. Settling a handle whose intent has been
/// superseded is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationHandle {
    key: MutationKey,
    epoch: u64,
    seq: u64,
    previous: bool,
    new_value: bool,
    count_delta: i64,
    // Counter version this intent's delta was applied against.
    count_version: u64,
}

impl MutationHandle {
    #[must_use]
    pub fn key(&self) -> &MutationKey {
        &self.key
    }

    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub const fn previous(&self) -> bool {
        self.previous
    }

    #[must_use]
    pub const fn new_value(&self) -> bool {
        self.new_value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Confirmed,
    RolledBack,
    /// Server declared the value; local state now mirrors it.
    Reconciled { value: bool },
    /// A newer intent exists; the result was dropped.
    Stale,
}

#[derive(Debug, Default)]
pub struct MutationMetrics {
    pub toggles: AtomicU64,
    pub confirmations: AtomicU64,
    pub stale_discards: AtomicU64,
    pub rollbacks: AtomicU64,
    pub conflicts: AtomicU64,
    pub retries: AtomicU64,
    pub realtime_skipped: AtomicU64,
}

impl MutationMetrics {
    pub fn snapshot(&self) -> MutationMetricsSnapshot {
        MutationMetricsSnapshot {
            toggles: self.toggles.load(Ordering::Relaxed),
            confirmations: self.confirmations.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            realtime_skipped: self.realtime_skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationMetricsSnapshot {
    pub toggles: u64,
    pub confirmations: u64,
    pub stale_discards: u64,
    pub rollbacks: u64,
    pub conflicts: u64,
    pub retries: u64,
    pub realtime_skipped: u64,
}

#[derive(Default)]
struct StoreState {
    // Bumped on clear so handles from a previous session never match.
    epoch: u64,
    records: HashMap<MutationKey, MutationRecord>,
    counters: HashMap<EntityId, LikeCounter>,
    // Monotonic; bumped by every local intent and server-assigned count.
    count_version: u64,
    // Version at which each counter last took a server-assigned value.
    assigned_at: HashMap<EntityId, u64>,
}

impl StoreState {
    fn is_current(&self, handle: &MutationHandle) -> bool {
        self.epoch == handle.epoch
            && self
                .records
                .get(&handle.key)
                .is_some_and(|r| r.intent_seq == handle.seq)
    }

    fn next_count_version(&mut self) -> u64 {
        self.count_version += 1;
        self.count_version
    }

    fn mark_assigned(&mut self, post_id: &EntityId) {
        let version = self.next_count_version();
        self.assigned_at.insert(post_id.clone(), version);
    }

    /// Whether the server assigned this counter after `handle` moved it.
    fn reassigned_since(&self, handle: &MutationHandle) -> bool {
        self.assigned_at
            .get(&handle.key.entity_id)
            .is_some_and(|version| *version > handle.count_version)
    }

    /// Applies `delta` to a post's counter, creating it at zero. Returns
    /// `(applied_delta, new_count)`.
    fn shift_counter(
        &mut self,
        post_id: &EntityId,
        delta: i64,
        now: crate::UnixTimeMs,
    ) -> (i64, u64) {
        let counter = self
            .counters
            .entry(post_id.clone())
            .or_insert_with(|| LikeCounter::new(post_id.clone(), 0, now));
        let before = counter.count;
        let after = counter.apply_delta(delta, now);
        let applied = match after.cmp(&before) {
            CmpOrdering::Greater => i64::try_from(after - before).unwrap_or(i64::MAX),
            CmpOrdering::Less => -i64::try_from(before - after).unwrap_or(i64::MAX),
            CmpOrdering::Equal => 0,
        };
        (applied, after)
    }
}

/// Changes to announce once the state lock is released.
#[derive(Default)]
struct Changes {
    values: Vec<(MutationKey, bool)>,
    counts: Vec<(EntityId, u64)>,
}

pub struct OptimisticMutationStore {
    api: Arc<dyn BackendApi>,
    queue: Arc<WriteQueue>,
    clock: Arc<dyn Clock>,
    auth: AuthSignal,
    config: MutationConfig,
    state: Mutex<StoreState>,
    values: Subscribers<MutationKey, bool>,
    counts: Subscribers<EntityId, u64>,
    metrics: MutationMetrics,
}

impl OptimisticMutationStore {
    pub fn new(
        api: Arc<dyn BackendApi>,
        queue: Arc<WriteQueue>,
        clock: Arc<dyn Clock>,
        auth: AuthSignal,
        config: MutationConfig,
    ) -> Self {
        Self {
            api,
            queue,
            clock,
            auth,
            config,
            state: Mutex::new(StoreState::default()),
            values: Subscribers::new(),
            counts: Subscribers::new(),
            metrics: MutationMetrics::default(),
        }
    }

    // --- Reads ---

    #[must_use]
    pub fn value(&self, key: &MutationKey) -> bool {
        lock(&self.state)
            .records
            .get(key)
            .is_some_and(|r| r.local_value)
    }

    #[must_use]
    pub fn record(&self, key: &MutationKey) -> Option<MutationRecord> {
        lock(&self.state).records.get(key).cloned()
    }

    #[must_use]
    pub fn like_count(&self, post_id: &EntityId) -> Option<u64> {
        lock(&self.state).counters.get(post_id).map(|c| c.count)
    }

    pub fn subscribe<F>(&self, key: MutationKey, callback: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.values.subscribe(key, callback)
    }

    pub fn subscribe_count<F>(&self, post_id: EntityId, callback: F) -> Subscription
    where
        F: Fn(&u64) + Send + Sync + 'static,
    {
        self.counts.subscribe(post_id, callback)
    }

    pub fn metrics(&self) -> MutationMetricsSnapshot {
        self.metrics.snapshot()
    }

    // --- Local intent ---

    /// Flips the local value, issues a new intent sequence and, for likes,
    /// moves the counter by one. Subscribers are notified before returning.
    pub fn apply_local(&self, key: MutationKey) -> MutationHandle {
        let now = self.clock.now();
        let mut changes = Changes::default();
        let handle = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let record = state
                .records
                .entry(key.clone())
                .or_insert_with(|| MutationRecord {
                    entity_id: key.entity_id.clone(),
                    kind: key.kind,
                    local_value: false,
                    intent_seq: 0,
                    server_confirmed: true,
                    last_attempt_at: now,
                });
            let previous = record.local_value;
            record.local_value = !previous;
            record.intent_seq += 1;
            record.server_confirmed = false;
            record.last_attempt_at = now;
            let seq = record.intent_seq;

            let count_delta = if key.kind == MutationKind::Like {
                let (applied, count) =
                    state.shift_counter(&key.entity_id, if previous { -1 } else { 1 }, now);
                changes.counts.push((key.entity_id.clone(), count));
                applied
            } else {
                0
            };
            changes.values.push((key.clone(), !previous));
            self.persist(state);

            MutationHandle {
                key,
                epoch: state.epoch,
                seq,
                previous,
                new_value: !previous,
                count_delta,
                count_version: state.next_count_version(),
            }
        };
        self.metrics.toggles.fetch_add(1, Ordering::Relaxed);
        self.announce(changes);
        handle
    }

    /// Adjusts a like counter, clamped at zero. Returns the new count.
    pub fn apply_delta(&self, post_id: &EntityId, delta: i64) -> u64 {
        let now = self.clock.now();
        let (applied, count) = {
            let mut guard = lock(&self.state);
            let result = guard.shift_counter(post_id, delta, now);
            self.persist(&guard);
            result
        };
        if applied != 0 {
            self.counts.notify(post_id, &count);
        }
        count
    }

    // --- Settlement ---

    #[must_use]
    pub fn is_current(&self, handle: &MutationHandle) -> bool {
        lock(&self.state).is_current(handle)
    }

    pub fn confirm(&self, handle: &MutationHandle, ack: Option<&Ack>) -> Settlement {
        let now = self.clock.now();
        let mut changes = Changes::default();
        {
            let mut guard = lock(&self.state);
            if !guard.is_current(handle) {
                drop(guard);
                return self.discard_stale(handle, "confirmation");
            }
            let state = &mut *guard;
            if let Some(record) = state.records.get_mut(&handle.key) {
                record.server_confirmed = true;
            }
            if let (MutationKind::Like, Some(server_count)) =
                (handle.key.kind, ack.and_then(|a| a.like_count))
            {
                let counter = state
                    .counters
                    .entry(handle.key.entity_id.clone())
                    .or_insert_with(|| LikeCounter::new(handle.key.entity_id.clone(), 0, now));
                if counter.count != server_count {
                    counter.count = server_count;
                    counter.last_updated_at = now;
                    changes.counts.push((handle.key.entity_id.clone(), server_count));
                }
                state.mark_assigned(&handle.key.entity_id);
            }
            self.persist(state);
        }
        self.metrics.confirmations.fetch_add(1, Ordering::Relaxed);
        debug!(key = %handle.key, seq = handle.seq, "mutation confirmed");
        self.announce(changes);
        Settlement::Confirmed
    }

    /// Reverts to the value held before this intent, if it is still the latest.
    pub fn rollback(&self, handle: &MutationHandle) -> Settlement {
        match self.settle_to(handle, handle.previous) {
            Some(()) => {
                self.metrics.rollbacks.fetch_add(1, Ordering::Relaxed);
                Settlement::RolledBack
            }
            None => self.discard_stale(handle, "rollback"),
        }
    }

    /// Adopts the value the server declared when it rejected this intent.
    pub fn resolve_conflict(&self, handle: &MutationHandle, server_value: bool) -> Settlement {
        match self.settle_to(handle, server_value) {
            Some(()) => {
                self.metrics.conflicts.fetch_add(1, Ordering::Relaxed);
                Settlement::Reconciled {
                    value: server_value,
                }
            }
            None => self.discard_stale(handle, "conflict"),
        }
    }

    fn settle_to(&self, handle: &MutationHandle, value: bool) -> Option<()> {
        let now = self.clock.now();
        let mut changes = Changes::default();
        {
            let mut guard = lock(&self.state);
            if !guard.is_current(handle) {
                return None;
            }
            let state = &mut *guard;
            if let Some(record) = state.records.get_mut(&handle.key) {
                if record.local_value != value {
                    record.local_value = value;
                    changes.values.push((handle.key.clone(), value));
                }
                record.server_confirmed = true;
            }
            // A server-assigned count already excludes this intent.
            if handle.count_delta != 0 && !state.reassigned_since(handle) {
                let (applied, count) =
                    state.shift_counter(&handle.key.entity_id, -handle.count_delta, now);
                if applied != 0 {
                    changes.counts.push((handle.key.entity_id.clone(), count));
                }
            }
            self.persist(state);
        }
        self.announce(changes);
        Some(())
    }

    fn discard_stale(&self, handle: &MutationHandle, what: &'static str) -> Settlement {
        self.metrics.stale_discards.fetch_add(1, Ordering::Relaxed);
        debug!(key = %handle.key, seq = handle.seq, what, "discarding stale settlement");
        Settlement::Stale
    }

    // --- Server-declared state ---

    /// Assigns a value reported by the server outside of a confirmation.
    /// Ignored while a local intent for the entity is unconfirmed. Returns
    /// whether the value was applied.
    pub fn set_server_value(&self, key: &MutationKey, value: bool) -> bool {
        let now = self.clock.now();
        let outcome = {
            let mut guard = lock(&self.state);
            let outcome = match guard.records.get_mut(key) {
                Some(record) if record.is_pending() => None,
                Some(record) => {
                    let changed = record.local_value != value;
                    record.local_value = value;
                    record.server_confirmed = true;
                    Some(changed)
                }
                None => {
                    guard.records.insert(
                        key.clone(),
                        MutationRecord {
                            entity_id: key.entity_id.clone(),
                            kind: key.kind,
                            local_value: value,
                            intent_seq: 0,
                            server_confirmed: true,
                            last_attempt_at: now,
                        },
                    );
                    Some(value)
                }
            };
            if outcome == Some(true) {
                self.persist(&guard);
            }
            outcome
        };
        match outcome {
            None => {
                self.metrics.realtime_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "pending local intent wins over server value");
                false
            }
            Some(changed) => {
                if changed {
                    self.values.notify(key, &value);
                }
                true
            }
        }
    }

    /// Assigns the authoritative like count for a post.
    pub fn set_like_count(&self, post_id: &EntityId, count: u64) {
        let now = self.clock.now();
        let changed = {
            let mut guard = lock(&self.state);
            let counter = guard
                .counters
                .entry(post_id.clone())
                .or_insert_with(|| LikeCounter::new(post_id.clone(), count, now));
            let changed = counter.count != count;
            counter.count = count;
            counter.last_updated_at = now;
            guard.mark_assigned(post_id);
            self.persist(&guard);
            changed
        };
        if changed {
            self.counts.notify(post_id, &count);
        }
    }

    // --- Background confirmation ---

    /// Applies the intent locally and confirms it in the background.
    /// Returns the value held before the toggle.
    pub fn toggle(self: &Arc<Self>, key: MutationKey) -> bool {
        let handle = self.apply_local(key);
        let previous = handle.previous;
        let store = Arc::clone(self);
        spawn_detached("confirm_mutation", async move {
            store.run_confirmation(handle).await;
        });
        previous
    }

    /// Sends the intent to the backend, retrying transient failures while the
    /// intent is still the latest one, and settles the outcome.
    #[instrument(skip_all, fields(key = %handle.key, seq = handle.seq))]
    pub async fn run_confirmation(&self, handle: MutationHandle) -> Settlement {
        let max_attempts = self.config.confirm_max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            if !self.touch_attempt(&handle) {
                return self.discard_stale(&handle, "confirmation request");
            }

            let entity = &handle.key.entity_id;
            let result = match handle.key.kind {
                MutationKind::Like => self.api.confirm_like(entity, handle.new_value).await,
                MutationKind::Follow => self.api.confirm_follow(entity, handle.new_value).await,
            };

            match result {
                Ok(ack) => return self.confirm(&handle, Some(&ack)),
                Err(ApiError::Conflict { server_value }) => {
                    warn!(server_value, "server rejected mutation");
                    return self.resolve_conflict(&handle, server_value);
                }
                Err(ApiError::AuthExpired) => {
                    self.auth.raise(&AppError::from(ApiError::AuthExpired));
                    return self.rollback(&handle);
                }
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let base = self.config.confirm_base_backoff_ms;
                    let delay = calculate_retry_delay(
                        attempt,
                        base,
                        self.config.confirm_max_backoff_ms,
                        generate_jitter(base / 2),
                    );
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, delay_ms = delay, error = %e, "confirmation failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    warn!(error = %e, attempts = attempt + 1, "confirmation failed, rolling back");
                    return self.rollback(&handle);
                }
            }
        }
    }

    fn touch_attempt(&self, handle: &MutationHandle) -> bool {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        if !state.is_current(handle) {
            return false;
        }
        if let Some(record) = state.records.get_mut(&handle.key) {
            record.last_attempt_at = now;
        }
        true
    }

    // --- Persistence & lifecycle ---

    /// Loads persisted records and counters. Unreadable snapshots are
    /// ignored. Returns the number of records loaded.
    #[instrument(skip_all)]
    pub async fn hydrate(&self) -> usize {
        let store = self.queue.store();
        let records: Vec<MutationRecord> = store
            .get_or_absent(&records_key())
            .await
            .unwrap_or_default();
        let counters: Vec<LikeCounter> = store
            .get_or_absent(&counters_key())
            .await
            .unwrap_or_default();

        let loaded = records.len();
        let pending = records.iter().filter(|r| r.is_pending()).count();
        {
            let mut state = lock(&self.state);
            for record in records {
                state.records.insert(record.key(), record);
            }
            for counter in counters {
                state.counters.insert(counter.post_id.clone(), counter);
            }
        }
        info!(records = loaded, pending, "mutation state hydrated");
        loaded
    }

    /// Handles for every intent the server has not acknowledged yet.
    #[must_use]
    pub fn pending_confirmations(&self) -> Vec<MutationHandle> {
        let state = lock(&self.state);
        state
            .records
            .values()
            .filter(|r| r.is_pending())
            .map(|r| MutationHandle {
                key: r.key(),
                epoch: state.epoch,
                seq: r.intent_seq,
                previous: !r.local_value,
                new_value: r.local_value,
                count_delta: match (r.kind, r.local_value) {
                    (MutationKind::Like, true) => 1,
                    (MutationKind::Like, false) => -1,
                    (MutationKind::Follow, _) => 0,
                },
                count_version: state.count_version,
            })
            .collect()
    }

    /// Re-sends unacknowledged intents, e.g. after a restart.
    pub fn redispatch_pending(self: &Arc<Self>) -> usize {
        let handles = self.pending_confirmations();
        let count = handles.len();
        for handle in handles {
            let store = Arc::clone(self);
            spawn_detached("confirm_mutation", async move {
                store.run_confirmation(handle).await;
            });
        }
        if count > 0 {
            info!(count, "re-dispatched unconfirmed mutations");
        }
        count
    }

    /// Drops all in-memory state. Outstanding handles become stale.
    pub fn clear(&self) {
        let mut changes = Changes::default();
        {
            let mut state = lock(&self.state);
            state.epoch += 1;
            state.assigned_at.clear();
            changes.values = state
                .records
                .drain()
                .filter(|(_, r)| r.local_value)
                .map(|(k, _)| (k, false))
                .collect();
            changes.counts = state
                .counters
                .drain()
                .filter(|(_, c)| c.count > 0)
                .map(|(id, _)| (id, 0))
                .collect();
        }
        self.announce(changes);
    }

    fn persist(&self, state: &StoreState) {
        let records: Vec<&MutationRecord> = state.records.values().collect();
        let counters: Vec<&LikeCounter> = state.counters.values().collect();
        for result in [
            self.queue.enqueue_set(&records_key(), &records),
            self.queue.enqueue_set(&counters_key(), &counters),
        ] {
            if let Err(e) = result {
                debug!(error = %e, "mutation snapshot not queued");
            }
        }
    }

    fn announce(&self, changes: Changes) {
        for (key, value) in &changes.values {
            self.values.notify(key, value);
        }
        for (post_id, count) in &changes.counts {
            self.counts.notify(post_id, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryStorage;
    use crate::kv_store::PersistentKeyValueStore;
    use crate::model::UserId;
    use crate::testing::FakeBackend;
    use crate::{ManualClock, UnixTimeMs};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        backend: Arc<FakeBackend>,
        queue: Arc<WriteQueue>,
        auth: AuthSignal,
        store: Arc<OptimisticMutationStore>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(FakeBackend::new());
        let kv = Arc::new(PersistentKeyValueStore::new(
            Arc::new(MemoryStorage::new()),
            "feedcache",
        ));
        kv.set_user(&UserId::new("alice"));
        let queue = Arc::new(WriteQueue::new(kv));
        queue.enable();
        let auth = AuthSignal::new();
        let store = Arc::new(OptimisticMutationStore::new(
            backend.clone(),
            Arc::clone(&queue),
            Arc::new(ManualClock::new(UnixTimeMs(1_000))),
            auth.clone(),
            MutationConfig::default(),
        ));
        Fixture {
            backend,
            queue,
            auth,
            store,
        }
    }

    fn like(id: &str) -> MutationKey {
        MutationKey::like(&EntityId::new(id))
    }

    #[test]
    fn test_apply_local_is_synchronous_and_counts() {
        let f = fixture();
        f.store.set_like_count(&EntityId::new("p1"), 10);

        let handle = f.store.apply_local(like("p1"));
        assert!(!handle.previous());
        assert!(f.store.value(&like("p1")));
        assert_eq!(f.store.like_count(&EntityId::new("p1")), Some(11));
        assert!(f.store.record(&like("p1")).unwrap().is_pending());
    }

    #[test]
    fn test_rollback_reverts_value_and_count_exactly() {
        let f = fixture();
        f.store.set_like_count(&EntityId::new("p1"), 3);
        let handle = f.store.apply_local(like("p1"));

        assert_eq!(f.store.rollback(&handle), Settlement::RolledBack);
        assert!(!f.store.value(&like("p1")));
        assert_eq!(f.store.like_count(&EntityId::new("p1")), Some(3));
    }

    #[test]
    fn test_rollback_keeps_count_assigned_by_server_after_intent() {
        let f = fixture();
        let post = EntityId::new("p1");
        f.store.set_like_count(&post, 10);
        let handle = f.store.apply_local(like("p1"));
        assert_eq!(f.store.like_count(&post), Some(11));

        f.store.set_like_count(&post, 10);
        assert_eq!(f.store.rollback(&handle), Settlement::RolledBack);

        assert!(!f.store.value(&like("p1")));
        assert_eq!(f.store.like_count(&post), Some(10));
    }

    #[test]
    fn test_last_intent_wins_regardless_of_arrival_order() {
        let f = fixture();
        let h1 = f.store.apply_local(like("p1"));
        let h2 = f.store.apply_local(like("p1"));
        let h3 = f.store.apply_local(like("p1"));
        assert!(h3.new_value());

        assert_eq!(f.store.rollback(&h2), Settlement::Stale);
        assert_eq!(f.store.confirm(&h3, None), Settlement::Confirmed);
        assert_eq!(f.store.rollback(&h1), Settlement::Stale);

        assert!(f.store.value(&like("p1")));
        assert!(f.store.record(&like("p1")).unwrap().server_confirmed);
        assert_eq!(f.store.metrics().stale_discards, 2);
    }

    #[test]
    fn test_notifications_only_on_actual_changes() {
        let f = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = f.store.subscribe(like("p1"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handle = f.store.apply_local(like("p1"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        f.store.confirm(&handle, None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let handle = f.store.apply_local(like("p1"));
        f.store.rollback(&handle);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_ack_count_is_authoritative() {
        let f = fixture();
        let handle = f.store.apply_local(like("p1"));
        let ack = Ack {
            like_count: Some(42),
        };
        f.store.confirm(&handle, Some(&ack));
        assert_eq!(f.store.like_count(&EntityId::new("p1")), Some(42));
    }

    #[test]
    fn test_conflict_adopts_server_value_and_reverts_count() {
        let f = fixture();
        f.store.set_like_count(&EntityId::new("p1"), 5);
        let handle = f.store.apply_local(like("p1"));
        assert_eq!(
            f.store.resolve_conflict(&handle, true),
            Settlement::Reconciled { value: true }
        );
        assert!(f.store.value(&like("p1")));
        assert_eq!(f.store.like_count(&EntityId::new("p1")), Some(5));
    }

    #[test]
    fn test_server_value_is_idempotent_and_yields_to_pending_intent() {
        let f = fixture();
        let key = MutationKey::follow(&EntityId::new("u9"));
        assert!(f.store.set_server_value(&key, true));
        assert!(f.store.set_server_value(&key, true));
        assert!(f.store.value(&key));

        let handle = f.store.apply_local(key.clone());
        assert!(!f.store.value(&key));
        assert!(!f.store.set_server_value(&key, true));
        assert!(!f.store.value(&key));

        f.store.confirm(&handle, None);
        assert!(f.store.set_server_value(&key, true));
        assert!(f.store.value(&key));
    }

    #[test]
    fn test_clear_makes_old_handles_stale() {
        let f = fixture();
        let handle = f.store.apply_local(like("p1"));
        f.store.clear();
        let fresh = f.store.apply_local(like("p1"));
        assert_eq!(fresh.seq(), handle.seq());

        assert_eq!(f.store.rollback(&handle), Settlement::Stale);
        assert!(f.store.value(&like("p1")));
    }

    #[tokio::test]
    async fn test_failed_confirmation_rolls_back() {
        let f = fixture();
        f.backend.push_confirm(Err(ApiError::from_status(400, "bad")));
        let handle = f.store.apply_local(like("p1"));
        assert_eq!(f.store.run_confirmation(handle).await, Settlement::RolledBack);
        assert!(!f.store.value(&like("p1")));
        assert_eq!(f.store.like_count(&EntityId::new("p1")), Some(0));
        assert_eq!(f.backend.confirm_calls(), vec![(EntityId::new("p1"), true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let f = fixture();
        f.backend.push_confirm(Err(ApiError::network("offline")));
        f.backend.push_confirm(Err(ApiError::from_status(503, "busy")));
        let handle = f.store.apply_local(like("p1"));

        assert_eq!(f.store.run_confirmation(handle).await, Settlement::Confirmed);
        assert_eq!(f.backend.confirm_calls().len(), 3);
        assert_eq!(f.store.metrics().retries, 2);
        assert!(f.store.value(&like("p1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_intent_stops_retrying() {
        let f = fixture();
        for _ in 0..5 {
            f.backend.push_confirm(Err(ApiError::network("offline")));
        }
        let first = f.store.apply_local(like("p1"));
        let store = Arc::clone(&f.store);
        let task = tokio::spawn(async move { store.run_confirmation(first).await });

        while f.backend.confirm_calls().is_empty() {
            tokio::task::yield_now().await;
        }
        let _second = f.store.apply_local(like("p1"));
        assert_eq!(task.await.unwrap(), Settlement::Stale);
        assert_eq!(f.backend.confirm_calls().len(), 1);
        assert!(!f.store.value(&like("p1")));
    }

    #[tokio::test]
    async fn test_auth_expired_raises_signal() {
        let f = fixture();
        f.backend.push_confirm(Err(ApiError::AuthExpired));
        let handle = f.store.apply_local(like("p1"));
        f.store.run_confirmation(handle).await;
        assert!(f.auth.is_raised());
        assert!(!f.store.value(&like("p1")));
    }

    #[tokio::test]
    async fn test_toggle_confirms_in_background() {
        let f = fixture();
        assert!(!f.store.toggle(like("p1")));
        assert!(f.store.value(&like("p1")));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(f.store.record(&like("p1")).unwrap().server_confirmed);
    }

    #[tokio::test]
    async fn test_hydrate_restores_pending_intents() {
        let f = fixture();
        f.store.apply_local(like("p1"));
        f.store.apply_local(MutationKey::follow(&EntityId::new("u1")));
        f.queue.flush().await;

        let restored = OptimisticMutationStore::new(
            f.backend.clone(),
            Arc::clone(&f.queue),
            Arc::new(ManualClock::new(UnixTimeMs(2_000))),
            AuthSignal::new(),
            MutationConfig::default(),
        );
        assert_eq!(restored.hydrate().await, 2);
        assert!(restored.value(&like("p1")));
        assert_eq!(restored.like_count(&EntityId::new("p1")), Some(1));

        let pending = restored.pending_confirmations();
        assert_eq!(pending.len(), 2);
        let like_handle = pending
            .into_iter()
            .find(|h| h.key().kind == MutationKind::Like)
            .unwrap();
        assert_eq!(restored.rollback(&like_handle), Settlement::RolledBack);
        assert_eq!(restored.like_count(&EntityId::new("p1")), Some(0));
    }
}
