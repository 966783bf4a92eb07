//! Cached read path for tender listings and counts.

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tv_core::TenderView;
use tv_storage::TenderStore;
use tv_sync::{IngestionTrigger, TriggerRequest};

mod cache;

pub use cache::{CacheEntry, Clock, ManualClock, SystemClock, TtlCache};

pub const CRATE_NAME: &str = "tv-feed";

pub const COUNT_KEY: &str = "tender_count";

pub fn listing_key(limit: usize) -> String {
    format!("tenders_{limit}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    pub ttl: Duration,
    pub default_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(5),
            default_limit: 50,
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ttl_secs = std::env::var("TV_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|secs| *secs >= 0);
        Self {
            ttl: ttl_secs.map(Duration::seconds).unwrap_or(defaults.ttl),
            default_limit: std::env::var("TV_FEED_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_limit),
        }
    }
}

/// Latest listings and the total count, served from a per-process TTL cache.
///
/// Store failures never reach the caller: listings degrade to empty and counts to zero,
/// and nothing is cached for them.
pub struct TenderFeed {
    store: Arc<dyn TenderStore>,
    clock: Arc<dyn Clock>,
    fallback: Option<Arc<dyn IngestionTrigger>>,
    config: FeedConfig,
    listings: Mutex<TtlCache<Vec<TenderView>>>,
    counts: Mutex<TtlCache<u64>>,
}

impl TenderFeed {
    pub fn new(store: Arc<dyn TenderStore>, config: FeedConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            fallback: None,
            config,
            listings: Mutex::new(TtlCache::new(config.ttl)),
            counts: Mutex::new(TtlCache::new(config.ttl)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Ingestion to run when a listing read finds the store empty.
    pub fn with_fallback(mut self, trigger: Arc<dyn IngestionTrigger>) -> Self {
        self.fallback = Some(trigger);
        self
    }

    pub fn config(&self) -> FeedConfig {
        self.config
    }

    pub async fn fetch_latest(&self, limit: usize) -> Vec<TenderView> {
        let key = listing_key(limit);
        let now = self.clock.now();
        if let Some(views) = self.listings.lock().await.get_fresh(&key, now) {
            debug!(key = %key, "listing cache hit");
            return views.iter().cloned().map(|v| v.refreshed(now)).collect();
        }

        let rows = match self.store.latest_tenders(limit).await {
            Ok(rows) if rows.is_empty() && limit > 0 => self.read_after_fallback(limit).await,
            Ok(rows) => Some(rows),
            Err(err) => {
                warn!(error = %err, "listing read failed; serving empty list");
                None
            }
        };
        let Some(rows) = rows else {
            return Vec::new();
        };

        let now = self.clock.now();
        let views = rows
            .into_iter()
            .map(|record| TenderView::at(record, now))
            .collect::<Vec<_>>();
        self.listings.lock().await.put(key, views.clone(), now);
        views
    }

    async fn read_after_fallback(&self, limit: usize) -> Option<Vec<tv_core::TenderRecord>> {
        let Some(trigger) = &self.fallback else {
            return Some(Vec::new());
        };
        info!("store is empty; running fallback ingestion");
        let response = trigger.trigger(TriggerRequest::fallback()).await;
        if !response.success {
            warn!(error = ?response.error, "fallback ingestion reported errors");
        }
        match self.store.latest_tenders(limit).await {
            Ok(rows) => Some(rows),
            Err(err) => {
                warn!(error = %err, "listing read after fallback failed");
                None
            }
        }
    }

    pub async fn get_total_count(&self) -> u64 {
        let now = self.clock.now();
        if let Some(count) = self.counts.lock().await.get_fresh(COUNT_KEY, now) {
            return *count;
        }
        match self.store.count_tenders().await {
            Ok(count) => {
                self.counts.lock().await.put(COUNT_KEY, count, self.clock.now());
                count
            }
            Err(err) => {
                warn!(error = %err, "count read failed; reporting zero");
                0
            }
        }
    }

    pub async fn clear_cache(&self) {
        self.listings.lock().await.clear();
        self.counts.lock().await.clear();
        debug!("feed cache cleared");
    }

    /// Warms the default listing and the count.
    pub async fn preload(&self) {
        let listed = self.fetch_latest(self.config.default_limit).await.len();
        let count = self.get_total_count().await;
        info!(listed, count, "feed cache preloaded");
    }

    /// Runs [`TenderFeed::preload`] on its own task so callers never wait on a fallback ingestion.
    pub fn preload_in_background(self: &Arc<Self>) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        tokio::spawn(async move { feed.preload().await })
    }

    /// Timestamp of the cached entry for `limit`, if any.
    pub async fn cached_at(&self, limit: usize) -> Option<chrono::DateTime<chrono::Utc>> {
        self.listings
            .lock()
            .await
            .get(&listing_key(limit))
            .map(|entry| entry.stored_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tv_core::{AffirmativeAction, NewTender, TenderStatus, TriggerKind};
    use tv_storage::MemoryTenderStore;
    use tv_sync::TriggerResponse;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).single().unwrap()
    }

    fn tender(key: &str, deadline: Option<DateTime<Utc>>) -> NewTender {
        NewTender {
            natural_key: key.into(),
            tender_no: None,
            title: format!("Tender {key}"),
            procuring_entity: Some("Kenya Ports Authority".into()),
            description: None,
            category: Some("Goods".into()),
            location: Some("Mombasa".into()),
            deadline,
            source: "tenders-go-ke".into(),
            contact_info: None,
            tender_url: None,
            requirements: None,
            affirmative_action: AffirmativeAction::default(),
            points_required: 0,
        }
    }

    fn feed(store: Arc<MemoryTenderStore>, clock: Arc<ManualClock>) -> TenderFeed {
        TenderFeed::new(store, FeedConfig::default()).with_clock(clock)
    }

    #[tokio::test]
    async fn second_read_within_ttl_is_served_from_cache() {
        let store = Arc::new(MemoryTenderStore::new());
        store.upsert_tenders(&[tender("a", None), tender("b", None)]).await.unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = feed(store.clone(), clock.clone());

        let first = feed.fetch_latest(10).await;
        clock.advance(Duration::minutes(4));
        let second = feed.fetch_latest(10).await;

        assert_eq!(store.read_count(), 1);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn expired_entry_triggers_a_fresh_read() {
        let store = Arc::new(MemoryTenderStore::new());
        store.upsert_tenders(&[tender("a", None)]).await.unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = feed(store.clone(), clock.clone());

        feed.fetch_latest(10).await;
        clock.advance(Duration::minutes(5));
        feed.fetch_latest(10).await;

        assert_eq!(store.read_count(), 2);
        assert_eq!(feed.cached_at(10).await, Some(t0() + Duration::minutes(5)));
    }

    #[tokio::test]
    async fn cached_zero_count_is_a_hit() {
        let store = Arc::new(MemoryTenderStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = feed(store.clone(), clock);

        assert_eq!(feed.get_total_count().await, 0);
        assert_eq!(feed.get_total_count().await, 0);
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test]
    async fn store_failures_degrade_and_are_not_cached() {
        let store = Arc::new(MemoryTenderStore::new());
        store.upsert_tenders(&[tender("a", None)]).await.unwrap();
        store.set_fail_reads(true);
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = feed(store.clone(), clock);

        assert!(feed.fetch_latest(10).await.is_empty());
        assert_eq!(feed.get_total_count().await, 0);

        store.set_fail_reads(false);
        assert_eq!(feed.fetch_latest(10).await.len(), 1);
        assert_eq!(feed.get_total_count().await, 1);
        assert_eq!(store.read_count(), 4);
    }

    #[tokio::test]
    async fn clear_cache_forces_the_next_read() {
        let store = Arc::new(MemoryTenderStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = feed(store.clone(), clock);

        feed.get_total_count().await;
        store.upsert_tenders(&[tender("a", None)]).await.unwrap();
        assert_eq!(feed.get_total_count().await, 0);

        feed.clear_cache().await;
        assert_eq!(feed.get_total_count().await, 1);
    }

    #[tokio::test]
    async fn status_is_recomputed_on_cache_hits() {
        let store = Arc::new(MemoryTenderStore::new());
        store
            .upsert_tenders(&[tender("a", Some(t0() + Duration::days(10)))])
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = TenderFeed::new(
            store.clone(),
            FeedConfig {
                ttl: Duration::days(30),
                default_limit: 50,
            },
        )
        .with_clock(clock.clone());

        assert_eq!(feed.fetch_latest(5).await[0].status, TenderStatus::Open);
        clock.advance(Duration::days(4));
        assert_eq!(feed.fetch_latest(5).await[0].status, TenderStatus::ClosingSoon);
        clock.advance(Duration::days(7));
        assert_eq!(feed.fetch_latest(5).await[0].status, TenderStatus::Closed);
        assert_eq!(store.read_count(), 1);
    }

    struct SeedingTrigger {
        store: Arc<MemoryTenderStore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IngestionTrigger for SeedingTrigger {
        async fn trigger(&self, request: TriggerRequest) -> TriggerResponse {
            assert_eq!(request.trigger_kind(), TriggerKind::Fallback);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.store.upsert_tenders(&[tender("seeded", None)]).await.unwrap();
            TriggerResponse {
                success: true,
                message: None,
                tenders_scraped: Some(1),
                error: None,
                sources: vec![],
            }
        }
    }

    #[tokio::test]
    async fn empty_store_runs_the_fallback_once() {
        let store = Arc::new(MemoryTenderStore::new());
        let trigger = Arc::new(SeedingTrigger {
            store: store.clone(),
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = feed(store.clone(), clock).with_fallback(trigger.clone());

        let views = feed.fetch_latest(10).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].record.natural_key, "seeded");
        feed.fetch_latest(10).await;
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
    }

    struct StalledTrigger;

    #[async_trait]
    impl IngestionTrigger for StalledTrigger {
        async fn trigger(&self, _request: TriggerRequest) -> TriggerResponse {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            TriggerResponse::failure("stalled")
        }
    }

    #[tokio::test]
    async fn background_preload_does_not_wait_for_the_fallback() {
        let store = Arc::new(MemoryTenderStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = Arc::new(feed(store.clone(), clock).with_fallback(Arc::new(StalledTrigger)));

        let handle = feed.preload_in_background();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert_eq!(store.read_count(), 1, "preload reached the empty store and is inside the fallback");
        handle.abort();
    }

    #[tokio::test]
    async fn zero_limit_never_runs_the_fallback() {
        let store = Arc::new(MemoryTenderStore::new());
        store.upsert_tenders(&[tender("a", None)]).await.unwrap();
        let trigger = Arc::new(SeedingTrigger {
            store: store.clone(),
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = feed(store.clone(), clock).with_fallback(trigger.clone());

        assert!(feed.fetch_latest(0).await.is_empty());
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn preload_warms_both_entries() {
        let store = Arc::new(MemoryTenderStore::new());
        store.upsert_tenders(&[tender("a", None)]).await.unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = feed(store.clone(), clock);

        feed.preload().await;
        feed.fetch_latest(FeedConfig::default().default_limit).await;
        feed.get_total_count().await;
        assert_eq!(store.read_count(), 2);
    }
}
