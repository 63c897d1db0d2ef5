//! Video thumbnails keyed by source URL.
//!
//! Lookups are synchronous; a miss returns the caller's fallback and starts
//! generation in the background. At most one generation runs per URL, and
//! everyone asking for that URL meanwhile gets its result.

use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    GenerationError, KeyNamespace, KvKey, MediaUrl, ThumbnailGenerator, ThumbnailOptions,
};
use crate::config::ThumbnailConfig;
use crate::model::ThumbnailEntry;
use crate::subscription::{Subscribers, Subscription};
use crate::write_queue::WriteQueue;
use crate::{lock, spawn_detached, Clock};

fn index_key() -> KvKey {
    KvKey::fixed(KeyNamespace::Thumbnails, "index")
}

type GenerationResult = Result<String, GenerationError>;
type Flight = Arc<tokio::sync::Mutex<Option<GenerationResult>>>;

#[derive(Debug, Default)]
pub struct ThumbnailMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub generations: AtomicU64,
    pub generation_failures: AtomicU64,
    pub coalesced: AtomicU64,
    pub expired: AtomicU64,
    pub evicted: AtomicU64,
}

impl ThumbnailMetrics {
    pub fn snapshot(&self) -> ThumbnailMetricsSnapshot {
        ThumbnailMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            generations: self.generations.load(Ordering::Relaxed),
            generation_failures: self.generation_failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThumbnailMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub generations: u64,
    pub generation_failures: u64,
    pub coalesced: u64,
    pub expired: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PregenerateReport {
    pub generated: usize,
    pub failed: usize,
    /// Already cached or not a valid media URL.
    pub skipped: usize,
}

struct CacheState {
    entries: LruCache<String, ThumbnailEntry>,
    in_flight: HashMap<String, Flight>,
    // Bumped on clear; generations started before it are not stored.
    epoch: u64,
}

pub struct MediaThumbnailCache {
    generator: Arc<dyn ThumbnailGenerator>,
    queue: Arc<WriteQueue>,
    clock: Arc<dyn Clock>,
    config: ThumbnailConfig,
    state: Mutex<CacheState>,
    subscribers: Subscribers<String, String>,
    metrics: ThumbnailMetrics,
}

impl MediaThumbnailCache {
    pub fn new(
        generator: Arc<dyn ThumbnailGenerator>,
        queue: Arc<WriteQueue>,
        clock: Arc<dyn Clock>,
        config: ThumbnailConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            generator,
            queue,
            clock,
            config,
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                in_flight: HashMap::new(),
                epoch: 0,
            }),
            subscribers: Subscribers::new(),
            metrics: ThumbnailMetrics::default(),
        }
    }

    /// The cached thumbnail for `source_url`, if present and unexpired.
    #[must_use]
    pub fn get(&self, source_url: &str) -> Option<String> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        let expired = match state.entries.get(source_url) {
            Some(entry) if !entry.is_expired(now) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.thumbnail_uri().to_string());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.pop(source_url);
            self.metrics.expired.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Returns the cached thumbnail, or `fallback_url` while one is generated
    /// in the background. Subscribers of `source_url` hear about the result.
    pub fn get_or_generate(
        self: &Arc<Self>,
        source_url: &str,
        fallback_url: &str,
        time_ms: u64,
    ) -> String {
        if let Err(e) = MediaUrl::parse(source_url) {
            warn!(error = %e, "not generating thumbnail for invalid url");
            return fallback_url.to_string();
        }
        if let Some(uri) = self.get(source_url) {
            return uri;
        }
        if !self.is_generating(source_url) {
            let cache = Arc::clone(self);
            let url = source_url.to_string();
            spawn_detached("generate_thumbnail", async move {
                if let Err(e) = cache.generate(&url, time_ms).await {
                    debug!(error = %e, "background thumbnail generation failed");
                }
            });
        }
        fallback_url.to_string()
    }

    #[must_use]
    pub fn is_generating(&self, source_url: &str) -> bool {
        lock(&self.state).in_flight.contains_key(source_url)
    }

    /// Generates (or joins the running generation of) the thumbnail for
    /// `source_url` and caches it.
    #[instrument(skip_all, fields(url = %source_url))]
    pub async fn generate(&self, source_url: &str, time_ms: u64) -> GenerationResult {
        MediaUrl::parse(source_url)?;
        if let Some(uri) = self.get(source_url) {
            return Ok(uri);
        }

        let (flight, epoch) = {
            let mut state = lock(&self.state);
            let flight = Arc::clone(
                state
                    .in_flight
                    .entry(source_url.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None))),
            );
            (flight, state.epoch)
        };

        let mut slot = flight.lock().await;
        if let Some(shared) = slot.as_ref() {
            self.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!("joined running generation");
            return shared.clone();
        }

        let options = ThumbnailOptions {
            time_ms,
            quality: self.config.quality,
        };
        let result = self.generator.generate(source_url, options).await;
        *slot = Some(result.clone());

        let current = {
            let mut state = lock(&self.state);
            if state
                .in_flight
                .get(source_url)
                .is_some_and(|f| Arc::ptr_eq(f, &flight))
            {
                state.in_flight.remove(source_url);
            }
            if let (Ok(uri), true) = (&result, state.epoch == epoch) {
                let entry =
                    ThumbnailEntry::new(source_url, uri.as_str(), self.clock.now(), self.config.ttl_ms);
                if let Some((evicted, _)) = state.entries.push(source_url.to_string(), entry) {
                    if evicted != source_url {
                        self.metrics.evicted.fetch_add(1, Ordering::Relaxed);
                    }
                }
                self.persist(&state);
            }
            state.epoch == epoch
        };
        drop(slot);

        match &result {
            Ok(uri) => {
                self.metrics.generations.fetch_add(1, Ordering::Relaxed);
                if current {
                    self.subscribers.notify(&source_url.to_string(), uri);
                } else {
                    debug!("cache cleared during generation, result not published");
                }
            }
            Err(e) => {
                self.metrics
                    .generation_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "thumbnail generation failed");
            }
        }
        result
    }

    /// Generates thumbnails for every uncached URL, `batch_size` at a time.
    /// Failures are counted and otherwise ignored.
    #[instrument(skip_all, fields(requested = urls.len()))]
    pub async fn pregenerate(self: &Arc<Self>, urls: &[String]) -> PregenerateReport {
        let mut report = PregenerateReport::default();
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for url in urls {
            if !seen.insert(url.as_str()) {
                continue;
            }
            if MediaUrl::parse(url).is_err() || self.get(url).is_some() {
                report.skipped += 1;
            } else {
                pending.push(url.clone());
            }
        }

        for batch in pending.chunks(self.config.batch_size.max(1)) {
            let mut tasks = JoinSet::new();
            for url in batch {
                let cache = Arc::clone(self);
                let url = url.clone();
                tasks.spawn(async move { cache.generate(&url, 0).await });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(_)) => report.generated += 1,
                    Ok(Err(_)) => report.failed += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(error = %e, "thumbnail task aborted");
                    }
                }
            }
        }

        debug!(
            generated = report.generated,
            failed = report.failed,
            skipped = report.skipped,
            "pregenerate finished"
        );
        report
    }

    /// Loads the persisted index, dropping entries that have expired.
    /// Returns the number of entries kept.
    #[instrument(skip_all)]
    pub async fn hydrate(&self) -> usize {
        let persisted: Vec<ThumbnailEntry> = self
            .queue
            .store()
            .get_or_absent(&index_key())
            .await
            .unwrap_or_default();
        let now = self.clock.now();
        let total = persisted.len();

        let kept = {
            let mut state = lock(&self.state);
            // Persisted least recently used first, so replaying restores recency.
            for entry in persisted.into_iter().filter(|e| !e.is_expired(now)) {
                state.entries.push(entry.source_url().to_string(), entry);
            }
            let kept = state.entries.len();
            if kept < total {
                self.persist(&state);
            }
            kept
        };
        let dropped = total - kept.min(total);
        self.metrics
            .expired
            .fetch_add(dropped as u64, Ordering::Relaxed);
        info!(kept, dropped, "thumbnail index hydrated");
        kept
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let removed = {
            let mut state = lock(&self.state);
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(url, _)| url.clone())
                .collect();
            for url in &expired {
                state.entries.pop(url);
            }
            if !expired.is_empty() {
                self.persist(&state);
            }
            expired.len()
        };
        if removed > 0 {
            self.metrics
                .expired
                .fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, "expired thumbnails swept");
        }
        removed
    }

    /// Forgets the entry for `source_url` so the next request regenerates it.
    pub fn invalidate(&self, source_url: &str) -> bool {
        let mut state = lock(&self.state);
        let removed = state.entries.pop(source_url).is_some();
        if removed {
            self.persist(&state);
        }
        removed
    }

    /// Drops all entries. Generations already running are not stored.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.in_flight.clear();
        state.epoch += 1;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe<F>(&self, source_url: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(source_url.into(), callback)
    }

    pub fn metrics(&self) -> ThumbnailMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn persist(&self, state: &CacheState) {
        let index: Vec<&ThumbnailEntry> = state.entries.iter().rev().map(|(_, e)| e).collect();
        if let Err(e) = self.queue.enqueue_set(&index_key(), &index) {
            debug!(error = %e, "thumbnail index not queued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryStorage;
    use crate::kv_store::PersistentKeyValueStore;
    use crate::model::UserId;
    use crate::testing::FakeGenerator;
    use crate::{ManualClock, UnixTimeMs, DAY_MS};

    const T0: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

    struct Fixture {
        generator: Arc<FakeGenerator>,
        queue: Arc<WriteQueue>,
        clock: Arc<ManualClock>,
        cache: Arc<MediaThumbnailCache>,
    }

    fn fixture_with(config: ThumbnailConfig) -> Fixture {
        let kv = Arc::new(PersistentKeyValueStore::new(
            Arc::new(MemoryStorage::new()),
            "feedcache",
        ));
        kv.set_user(&UserId::new("alice"));
        let queue = Arc::new(WriteQueue::new(kv));
        queue.enable();
        let generator = Arc::new(FakeGenerator::new());
        let clock = Arc::new(ManualClock::new(T0));
        let cache = Arc::new(MediaThumbnailCache::new(
            generator.clone(),
            Arc::clone(&queue),
            clock.clone(),
            config,
        ));
        Fixture {
            generator,
            queue,
            clock,
            cache,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ThumbnailConfig::default())
    }

    /// A second cache over the same storage, as after an app restart.
    fn restarted(f: &Fixture, now: UnixTimeMs) -> MediaThumbnailCache {
        MediaThumbnailCache::new(
            Arc::new(FakeGenerator::new()),
            Arc::clone(&f.queue),
            Arc::new(ManualClock::new(now)),
            ThumbnailConfig::default(),
        )
    }

    fn video(n: u32) -> String {
        format!("https://cdn.example.com/v/{n}.mp4")
    }

    #[tokio::test]
    async fn test_miss_returns_fallback_then_notifies() {
        let f = fixture();
        let url = video(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = f.cache.subscribe(url.clone(), move |uri| lock(&sink).push(uri.clone()));

        assert_eq!(f.cache.get_or_generate(&url, "fallback.png", 0), "fallback.png");
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let expected = FakeGenerator::uri_for(&url);
        assert_eq!(*lock(&seen), vec![expected.clone()]);
        assert_eq!(f.cache.get_or_generate(&url, "fallback.png", 0), expected);
    }

    #[tokio::test]
    async fn test_concurrent_requests_generate_once() {
        let f = fixture();
        f.generator.hold();
        let url = video(2);

        let first = tokio::spawn({
            let cache = Arc::clone(&f.cache);
            let url = url.clone();
            async move { cache.generate(&url, 0).await }
        });
        let second = tokio::spawn({
            let cache = Arc::clone(&f.cache);
            let url = url.clone();
            async move { cache.generate(&url, 0).await }
        });
        while f.generator.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(f.cache.is_generating(&url));
        assert_eq!(f.cache.get_or_generate(&url, "fb", 0), "fb");

        f.generator.release(1);
        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(f.generator.calls().len(), 1);
        assert_eq!(f.cache.metrics().coalesced, 1);
    }

    #[tokio::test]
    async fn test_failure_and_invalid_url_fall_back() {
        let f = fixture();
        let url = video(3);
        f.generator.fail_for(&url);

        assert!(matches!(
            f.cache.generate(&url, 0).await,
            Err(GenerationError::Decode { .. })
        ));
        assert_eq!(f.cache.get_or_generate(&url, "fb", 0), "fb");

        assert_eq!(f.cache.get_or_generate("javascript:alert(1)", "fb", 0), "fb");
        assert_eq!(f.cache.get_or_generate("not a url", "fb", 0), "fb");
        assert!(f.generator.calls().iter().all(|c| c == &url));
    }

    #[tokio::test]
    async fn test_hydration_drops_entries_past_ttl() {
        let f = fixture();
        let url = video(4);
        f.cache.generate(&url, 0).await.unwrap();
        f.queue.flush().await;

        let six_days = restarted(&f, T0.add_millis(6 * DAY_MS));
        assert_eq!(six_days.hydrate().await, 1);
        assert_eq!(six_days.get(&url), Some(FakeGenerator::uri_for(&url)));

        let eight_days = restarted(&f, T0.add_millis(8 * DAY_MS));
        assert_eq!(eight_days.hydrate().await, 0);
        assert_eq!(eight_days.get(&url), None);
    }

    #[tokio::test]
    async fn test_sweep_and_invalidate() {
        let f = fixture();
        f.cache.generate(&video(5), 0).await.unwrap();
        f.clock.advance(DAY_MS);
        f.cache.generate(&video(6), 0).await.unwrap();

        f.clock.advance(6 * DAY_MS);
        assert_eq!(f.cache.sweep_expired(), 1);
        assert_eq!(f.cache.len(), 1);

        assert!(f.cache.invalidate(&video(6)));
        assert!(!f.cache.invalidate(&video(6)));
        f.cache.generate(&video(6), 0).await.unwrap();
        assert_eq!(f.generator.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_pregenerate_batches_and_swallows_failures() {
        let f = fixture();
        let mut urls: Vec<String> = (0..12).map(video).collect();
        f.generator.fail_for(&urls[7]);
        f.cache.generate(&urls[0], 0).await.unwrap();
        urls.push(urls[1].clone());
        urls.push("ftp://nope/x.mp4".to_string());

        let report = f.cache.pregenerate(&urls).await;
        assert_eq!(
            report,
            PregenerateReport {
                generated: 10,
                failed: 1,
                skipped: 2,
            }
        );
        assert_eq!(f.generator.calls().len(), 12);
        assert_eq!(f.cache.len(), 11);
    }

    #[tokio::test]
    async fn test_lru_bound_evicts_least_recent() {
        let f = fixture_with(ThumbnailConfig {
            max_entries: 2,
            ..ThumbnailConfig::default()
        });
        f.cache.generate(&video(1), 0).await.unwrap();
        f.cache.generate(&video(2), 0).await.unwrap();
        assert!(f.cache.get(&video(1)).is_some());
        f.cache.generate(&video(3), 0).await.unwrap();

        assert!(f.cache.get(&video(1)).is_some());
        assert!(f.cache.get(&video(2)).is_none());
        assert_eq!(f.cache.metrics().evicted, 1);
    }

    #[tokio::test]
    async fn test_clear_discards_running_generation() {
        let f = fixture();
        f.generator.hold();
        let url = video(9);
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        let _sub = f.cache.subscribe(url.clone(), move |uri| lock(&sink).push(uri.clone()));
        let task = tokio::spawn({
            let cache = Arc::clone(&f.cache);
            let url = url.clone();
            async move { cache.generate(&url, 0).await }
        });
        while f.generator.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        f.cache.clear();
        f.generator.release(1);
        assert!(task.await.unwrap().is_ok());
        assert!(f.cache.is_empty());
        assert!(lock(&seen).is_empty());
    }
}
