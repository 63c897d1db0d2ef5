//! Bounded, deduplicated, forward-paginated list windows.
//!
//! A [`PaginatedListCache`] owns one [`PageWindow`]. `refresh` replaces it
//! with page 1; `load_more` appends the next page. Concurrent `load_more`
//! calls share one request, and a result that lands after the window was
//! replaced is dropped.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ApiError, BackendApi, PageResponse, MAX_PAGE_SIZE};
use crate::config::PaginationConfig;
use crate::model::{Identifiable, ListKey, PageWindow};
use crate::subscription::{AuthSignal, Subscribers, Subscription};
use crate::{lock, AppError, AppResult};

/// Where a list's pages come from.
#[async_trait]
pub trait PageSource<T>: Send + Sync {
    async fn fetch(&self, page: u32, size: u32) -> AppResult<PageResponse<T>>;
}

/// Pages served by the backend's `fetch_page` for one resource, decoded
/// into `T`.
pub struct BackendPageSource<T> {
    api: Arc<dyn BackendApi>,
    resource: String,
    _item: PhantomData<fn() -> T>,
}

impl<T> BackendPageSource<T> {
    pub fn new(api: Arc<dyn BackendApi>, resource: impl Into<String>) -> Self {
        Self {
            api,
            resource: resource.into(),
            _item: PhantomData,
        }
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

#[async_trait]
impl<T> PageSource<T> for BackendPageSource<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn fetch(&self, page: u32, size: u32) -> AppResult<PageResponse<T>> {
        let response = self.api.fetch_page(&self.resource, page, size).await?;
        let items = response
            .items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()
            .map_err(|e| ApiError::InvalidResponse {
                reason: format!("{} page {page}: {e}", self.resource),
            })?;
        Ok(PageResponse::new(items, response.has_more))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The window was replaced by a fresh first page.
    Replaced { items: usize },
    Appended { added: usize, duplicates: usize },
    /// The server reported no further pages.
    Exhausted,
    /// The window changed while the request was in flight; the result was dropped.
    Discarded,
}

/// What subscribers and the UI see of a list.
#[derive(Debug, Clone)]
pub struct ListSnapshot<T> {
    pub window: PageWindow<T>,
    pub loading: bool,
    /// Last fetch error, kept alongside whatever data is still held.
    pub error: Option<AppError>,
    pub ever_loaded: bool,
}

impl<T> ListSnapshot<T> {
    /// Stale data beats an error screen; only a list that never loaded shows one.
    #[must_use]
    pub fn should_show_error_view(&self) -> bool {
        self.error.is_some() && !self.ever_loaded
    }
}

#[derive(Debug, Default)]
pub struct ListMetrics {
    pub fetches: AtomicU64,
    pub fetch_errors: AtomicU64,
    pub appended: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub trimmed: AtomicU64,
    pub coalesced: AtomicU64,
    pub discarded: AtomicU64,
}

impl ListMetrics {
    pub fn snapshot(&self) -> ListMetricsSnapshot {
        ListMetricsSnapshot {
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            appended: self.appended.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            trimmed: self.trimmed.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMetricsSnapshot {
    pub fetches: u64,
    pub fetch_errors: u64,
    pub appended: u64,
    pub duplicates_dropped: u64,
    pub trimmed: u64,
    pub coalesced: u64,
    pub discarded: u64,
}

impl std::ops::AddAssign for ListMetricsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.fetches += other.fetches;
        self.fetch_errors += other.fetch_errors;
        self.appended += other.appended;
        self.duplicates_dropped += other.duplicates_dropped;
        self.trimmed += other.trimmed;
        self.coalesced += other.coalesced;
        self.discarded += other.discarded;
    }
}

struct ListState<T: Identifiable> {
    window: PageWindow<T>,
    // Mirrors the ids in `window.items`.
    ids: HashSet<T::Id>,
    error: Option<AppError>,
    ever_loaded: bool,
    // Bumped whenever the window is replaced wholesale.
    generation: u64,
    // Bumped by every refresh and clear; only the latest refresh may apply.
    refresh_seq: u64,
    refreshing: bool,
    loading_more: bool,
}

impl<T: Identifiable> Default for ListState<T> {
    fn default() -> Self {
        Self {
            window: PageWindow::default(),
            ids: HashSet::new(),
            error: None,
            ever_loaded: false,
            generation: 0,
            refresh_seq: 0,
            refreshing: false,
            loading_more: false,
        }
    }
}

impl<T: Identifiable> ListState<T> {
    fn drop_front(&mut self, excess: usize) -> usize {
        let excess = excess.min(self.window.items.len());
        for removed in self.window.items.drain(..excess) {
            self.ids.remove(&removed.id());
        }
        excess
    }
}

pub struct PaginatedListCache<T: Identifiable> {
    key: ListKey,
    source: Arc<dyn PageSource<T>>,
    config: PaginationConfig,
    state: Mutex<ListState<T>>,
    // Holds the result of the last completed load_more, for callers that
    // queued behind it.
    load_more_gate: tokio::sync::Mutex<Option<AppResult<LoadOutcome>>>,
    load_more_completed: AtomicU64,
    subscribers: Subscribers<(), ListSnapshot<T>>,
    metrics: ListMetrics,
    auth: Option<AuthSignal>,
}

impl<T> PaginatedListCache<T>
where
    T: Identifiable + Clone + Send + Sync + 'static,
{
    pub fn new(key: ListKey, source: Arc<dyn PageSource<T>>, config: PaginationConfig) -> Self {
        Self {
            key,
            source,
            config,
            state: Mutex::new(ListState::default()),
            load_more_gate: tokio::sync::Mutex::new(None),
            load_more_completed: AtomicU64::new(0),
            subscribers: Subscribers::new(),
            metrics: ListMetrics::default(),
            auth: None,
        }
    }

    /// Escalates an expired session seen by any fetch to `auth`.
    #[must_use]
    pub fn with_auth_signal(mut self, auth: AuthSignal) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub fn key(&self) -> &ListKey {
        &self.key
    }

    fn page_size(&self) -> u32 {
        self.config.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Fetches one page without touching the cached window.
    #[instrument(skip_all, fields(list = %self.key, page = page))]
    pub async fn fetch(&self, page: u32, size: u32) -> AppResult<PageWindow<T>> {
        let size = size.clamp(1, MAX_PAGE_SIZE);
        self.metrics.fetches.fetch_add(1, Ordering::Relaxed);
        let response = self.source.fetch(page, size).await.map_err(|e| {
            self.metrics.fetch_errors.fetch_add(1, Ordering::Relaxed);
            if e.escalates() {
                if let Some(auth) = &self.auth {
                    auth.raise(&e);
                }
            }
            e
        })?;
        let has_more = response.resolve_has_more(size);
        Ok(PageWindow {
            items: response.items,
            page,
            has_more,
        })
    }

    /// Replaces the window with page 1. On failure the current window is
    /// kept and the error is recorded next to it.
    #[instrument(skip_all, fields(list = %self.key))]
    pub async fn refresh(&self) -> AppResult<LoadOutcome> {
        let seq = {
            let mut state = lock(&self.state);
            state.refresh_seq += 1;
            state.refreshing = true;
            state.refresh_seq
        };
        self.publish();

        let result = self.fetch(1, self.page_size()).await;

        let outcome = {
            let mut state = lock(&self.state);
            if state.refresh_seq != seq {
                None
            } else {
                state.refreshing = false;
                Some(match result {
                    Ok(page) => {
                        let mut ids = HashSet::with_capacity(page.items.len());
                        let items: Vec<T> = page
                            .items
                            .into_iter()
                            .filter(|item| ids.insert(item.id()))
                            .collect();
                        let count = items.len();
                        state.window = PageWindow {
                            items,
                            page: 1,
                            has_more: page.has_more,
                        };
                        state.ids = ids;
                        state.generation += 1;
                        state.error = None;
                        state.ever_loaded = true;
                        Ok(LoadOutcome::Replaced { items: count })
                    }
                    Err(e) => {
                        state.error = Some(e.clone());
                        Err(e)
                    }
                })
            }
        };

        match outcome {
            None => {
                self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
                debug!("refresh superseded by a newer one");
                Ok(LoadOutcome::Discarded)
            }
            Some(result) => {
                match &result {
                    Ok(LoadOutcome::Replaced { items }) => debug!(items, "list refreshed"),
                    Err(e) => warn!(error = %e, "refresh failed, keeping current items"),
                    Ok(_) => {}
                }
                self.publish();
                result
            }
        }
    }

    /// Appends the next page if the server reported one. Calls made while a
    /// load is in flight wait for it and return its outcome.
    #[instrument(skip_all, fields(list = %self.key))]
    pub async fn load_more(&self) -> AppResult<LoadOutcome> {
        let completed_before = self.load_more_completed.load(Ordering::SeqCst);
        let mut gate = self.load_more_gate.lock().await;
        if self.load_more_completed.load(Ordering::SeqCst) > completed_before {
            if let Some(last) = gate.as_ref() {
                self.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!("joined in-flight load_more");
                return last.clone();
            }
        }

        let outcome = self.load_next_page().await;
        *gate = Some(outcome.clone());
        self.load_more_completed.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn load_next_page(&self) -> AppResult<LoadOutcome> {
        let (page, generation) = {
            let mut state = lock(&self.state);
            if state.ever_loaded && !state.window.has_more {
                return Ok(LoadOutcome::Exhausted);
            }
            state.loading_more = true;
            (state.window.page + 1, state.generation)
        };
        self.publish();

        let size = self.page_size();
        let result = self.fetch(page, size).await;

        let outcome = {
            let mut state = lock(&self.state);
            state.loading_more = false;
            // Page N+1 of the old window would leave a gap after the new page 1.
            if state.generation != generation {
                Ok(LoadOutcome::Discarded)
            } else {
                match result {
                    Ok(fetched) => {
                        let mut added = 0;
                        let mut duplicates = 0;
                        for item in fetched.items {
                            if state.ids.insert(item.id()) {
                                state.window.items.push(item);
                                added += 1;
                            } else {
                                duplicates += 1;
                            }
                        }
                        state.window.page = page;
                        state.window.has_more = fetched.has_more;
                        state.error = None;
                        state.ever_loaded = true;

                        let max_items = self.config.max_items();
                        let len = state.window.items.len();
                        if len > max_items {
                            let trimmed = state.drop_front(len - max_items);
                            self.metrics
                                .trimmed
                                .fetch_add(trimmed as u64, Ordering::Relaxed);
                        }
                        self.metrics
                            .appended
                            .fetch_add(added as u64, Ordering::Relaxed);
                        self.metrics
                            .duplicates_dropped
                            .fetch_add(duplicates as u64, Ordering::Relaxed);
                        Ok(LoadOutcome::Appended { added, duplicates })
                    }
                    Err(e) => {
                        state.error = Some(e.clone());
                        Err(e)
                    }
                }
            }
        };

        match &outcome {
            Ok(LoadOutcome::Discarded) => {
                self.metrics.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(page, "window replaced while loading, dropping page");
            }
            Ok(LoadOutcome::Appended { added, duplicates }) => {
                debug!(page, added, duplicates, "page appended");
            }
            Err(e) => warn!(page, error = %e, "load_more failed, keeping current items"),
            Ok(_) => {}
        }
        self.publish();
        outcome
    }

    /// Loads page 1 unless the list already holds data or is loading it.
    pub async fn ensure_loaded(&self) -> AppResult<()> {
        let needed = {
            let state = lock(&self.state);
            !state.ever_loaded && !state.refreshing
        };
        if needed {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Inserts a pushed item at the head of the window. Returns `false` if
    /// its id is already present. Overflow is trimmed from the tail.
    pub fn prepend(&self, item: T) -> bool {
        {
            let mut state = lock(&self.state);
            if !state.ids.insert(item.id()) {
                return false;
            }
            state.window.items.insert(0, item);
            let max_items = self.config.max_items();
            if state.window.items.len() > max_items {
                let overflow: Vec<T> = state.window.items.drain(max_items..).collect();
                for removed in &overflow {
                    state.ids.remove(&removed.id());
                }
                state.window.has_more = true;
                self.metrics
                    .trimmed
                    .fetch_add(overflow.len() as u64, Ordering::Relaxed);
            }
        }
        self.publish();
        true
    }

    /// Drops the window. In-flight requests become stale.
    pub fn clear(&self) {
        {
            let mut state = lock(&self.state);
            let generation = state.generation + 1;
            let refresh_seq = state.refresh_seq + 1;
            *state = ListState {
                generation,
                refresh_seq,
                ..ListState::default()
            };
        }
        self.publish();
    }

    #[must_use]
    pub fn snapshot(&self) -> ListSnapshot<T> {
        let state = lock(&self.state);
        ListSnapshot {
            window: state.window.clone(),
            loading: state.refreshing || state.loading_more,
            error: state.error.clone(),
            ever_loaded: state.ever_loaded,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).window.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        lock(&self.state).ever_loaded
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ListSnapshot<T>) + Send + Sync + 'static,
    {
        self.subscribers.subscribe((), callback)
    }

    pub fn metrics(&self) -> ListMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn publish(&self) {
        if self.subscribers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        self.subscribers.notify(&(), &snapshot);
    }
}

/// Type-erased view of a list, for lifecycle-wide operations.
#[async_trait]
pub trait ManagedList: Send + Sync {
    fn list_key(&self) -> &ListKey;
    async fn refresh(&self) -> AppResult<LoadOutcome>;
    async fn load_more(&self) -> AppResult<LoadOutcome>;
    fn clear(&self);
    fn is_loaded(&self) -> bool;
    fn metrics(&self) -> ListMetricsSnapshot;
}

#[async_trait]
impl<T> ManagedList for PaginatedListCache<T>
where
    T: Identifiable + Clone + Send + Sync + 'static,
{
    fn list_key(&self) -> &ListKey {
        &self.key
    }

    async fn refresh(&self) -> AppResult<LoadOutcome> {
        PaginatedListCache::refresh(self).await
    }

    async fn load_more(&self) -> AppResult<LoadOutcome> {
        PaginatedListCache::load_more(self).await
    }

    fn clear(&self) {
        PaginatedListCache::clear(self);
    }

    fn is_loaded(&self) -> bool {
        PaginatedListCache::is_loaded(self)
    }

    fn metrics(&self) -> ListMetricsSnapshot {
        PaginatedListCache::metrics(self)
    }
}

/// A reconciliation fetch: re-reads server state after a gap in the
/// realtime stream. Returns how many sources were refreshed.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self) -> usize;
}

struct Registered {
    list: Arc<dyn ManagedList>,
    reconcile_on_resume: bool,
}

/// Every list the service knows about, by key.
#[derive(Default)]
pub struct ListRegistry {
    lists: Mutex<HashMap<ListKey, Registered>>,
}

impl ListRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `list` under its key, returning any list it replaced.
    pub fn register(
        &self,
        list: Arc<dyn ManagedList>,
        reconcile_on_resume: bool,
    ) -> Option<Arc<dyn ManagedList>> {
        let key = list.list_key().clone();
        lock(&self.lists)
            .insert(
                key,
                Registered {
                    list,
                    reconcile_on_resume,
                },
            )
            .map(|previous| previous.list)
    }

    #[must_use]
    pub fn get(&self, key: &ListKey) -> Option<Arc<dyn ManagedList>> {
        lock(&self.lists).get(key).map(|r| Arc::clone(&r.list))
    }

    #[must_use]
    pub fn keys(&self) -> Vec<ListKey> {
        lock(&self.lists).keys().cloned().collect()
    }

    /// Clears every registered list's window. Registrations stay.
    pub fn clear_all(&self) -> usize {
        let lists: Vec<Arc<dyn ManagedList>> = lock(&self.lists)
            .values()
            .map(|r| Arc::clone(&r.list))
            .collect();
        for list in &lists {
            list.clear();
        }
        lists.len()
    }

    pub fn metrics(&self) -> ListMetricsSnapshot {
        let lists: Vec<Arc<dyn ManagedList>> = lock(&self.lists)
            .values()
            .map(|r| Arc::clone(&r.list))
            .collect();
        let mut total = ListMetricsSnapshot::default();
        for list in lists {
            total += list.metrics();
        }
        total
    }
}

#[async_trait]
impl Reconcile for ListRegistry {
    /// Refreshes lists flagged for reconciliation that already hold data.
    async fn reconcile(&self) -> usize {
        let due: Vec<Arc<dyn ManagedList>> = lock(&self.lists)
            .values()
            .filter(|r| r.reconcile_on_resume && r.list.is_loaded())
            .map(|r| Arc::clone(&r.list))
            .collect();
        let mut refreshed = 0;
        for list in due {
            match list.refresh().await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(list = %list.list_key(), error = %e, "reconciliation fetch failed"),
            }
        }
        if refreshed > 0 {
            info!(refreshed, "lists reconciled");
        }
        refreshed
    }
}
