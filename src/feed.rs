//! Feed-read composition: the data flow spec.md describes as
//! `HTTP → (B) cache → fallback (C) → opportunistic (B) warm`.
//!
//! Like `FanoutPublisher`/`FollowGraphReactor`, this is an entry point the
//! external HTTP collaborator calls into (`GET /feed` et al. are out of this
//! repository's scope), not a routed endpoint itself. The composition logic
//! — cache miss falls back to the store, and a miss opportunistically warms
//! the ring so the next read is a hit — belongs to the core because it
//! spans modules B and C, both in scope.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::errors::CoreError;
use crate::metrics::Metrics;
use crate::timeline_cache::{CachedEntry, TimelineCache};
use crate::timeline_store::{TimelineEntry, TimelineStore};

#[async_trait]
pub trait FeedCacheApi: Send + Sync {
    async fn get_feed(&self, user_id: i64, limit: usize, offset: usize) -> Option<Vec<CachedEntry>>;
    async fn warm(&self, user_ids: &[i64], entries: &[CachedEntry]);
}

#[async_trait]
impl FeedCacheApi for TimelineCache {
    async fn get_feed(&self, user_id: i64, limit: usize, offset: usize) -> Option<Vec<CachedEntry>> {
        TimelineCache::get_feed(self, user_id, limit, offset).await
    }

    async fn warm(&self, user_ids: &[i64], entries: &[CachedEntry]) {
        TimelineCache::warm(self, user_ids, entries).await
    }
}

#[async_trait]
pub trait FeedStoreApi: Send + Sync {
    async fn read_range(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TimelineEntry>, CoreError>;
}

#[async_trait]
impl FeedStoreApi for TimelineStore {
    async fn read_range(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TimelineEntry>, CoreError> {
        TimelineStore::read_range(self, user_id, limit, offset).await
    }
}

fn to_cached(entry: TimelineEntry) -> CachedEntry {
    CachedEntry {
        post_id: entry.post_id,
        body: entry.body,
        author_id: entry.author_id,
        author_username: entry.author_username,
        ts: entry.ts,
    }
}

/// Pure composition, independent of any concrete cache/store client so it
/// can be exercised against in-memory fakes in tests. On a cache miss, reads
/// up to `warm_capacity` entries from the store (not just the requested
/// page) so the warmed ring holds a useful window rather than only the slice
/// this one call happened to ask for, then slices out the caller's page.
pub async fn get_feed(
    cache: &dyn FeedCacheApi,
    store: &dyn FeedStoreApi,
    metrics: &Metrics,
    warm_capacity: i64,
    user_id: i64,
    limit: usize,
    offset: usize,
) -> Vec<CachedEntry> {
    if let Some(entries) = cache.get_feed(user_id, limit, offset).await {
        metrics.gauge(&format!("feed.size.{user_id}"), entries.len() as u64);
        return entries;
    }

    let full_page = match store.read_range(user_id, warm_capacity, 0).await {
        Ok(page) => page,
        Err(err) => {
            tracing::warn!(error = %err, user_id, "feed store fallback failed");
            return Vec::new();
        }
    };

    let newest_first: Vec<CachedEntry> = full_page.into_iter().map(to_cached).collect();

    let mut oldest_first = newest_first.clone();
    oldest_first.reverse();
    cache.warm(&[user_id], &oldest_first).await;

    let page: Vec<CachedEntry> = newest_first.into_iter().skip(offset).take(limit).collect();
    metrics.gauge(&format!("feed.size.{user_id}"), page.len() as u64);
    page
}

/// Thin, timeout-bounded wrapper around [`get_feed`] for production use: a
/// read must have a per-call budget shorter than the caller's own, and on
/// timeout returns an empty page rather than blocking past it.
pub struct FeedReader {
    cache: TimelineCache,
    store: TimelineStore,
    metrics: Metrics,
    warm_capacity: i64,
    read_timeout: Duration,
}

impl FeedReader {
    pub fn new(
        cache: TimelineCache,
        store: TimelineStore,
        metrics: Metrics,
        warm_capacity: i64,
        read_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            metrics,
            warm_capacity,
            read_timeout,
        }
    }

    pub async fn get_feed(&self, user_id: i64, limit: usize, offset: usize) -> Vec<CachedEntry> {
        let started = Instant::now();
        let fut = get_feed(
            &self.cache,
            &self.store,
            &self.metrics,
            self.warm_capacity,
            user_id,
            limit,
            offset,
        );

        let result = match tokio::time::timeout(self.read_timeout, fut).await {
            Ok(entries) => entries,
            Err(_) => {
                tracing::warn!(user_id, "feed read timed out, returning empty page");
                Vec::new()
            }
        };
        self.metrics.time("feed.get_user_feed", started.elapsed());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    struct FakeCache {
        hit: Option<Vec<CachedEntry>>,
        warmed: Mutex<Vec<(i64, Vec<CachedEntry>)>>,
    }

    #[async_trait]
    impl FeedCacheApi for FakeCache {
        async fn get_feed(&self, _user_id: i64, _limit: usize, _offset: usize) -> Option<Vec<CachedEntry>> {
            self.hit.clone()
        }

        async fn warm(&self, user_ids: &[i64], entries: &[CachedEntry]) {
            for &user_id in user_ids {
                self.warmed.lock().unwrap().push((user_id, entries.to_vec()));
            }
        }
    }

    struct FakeStore {
        rows: Vec<TimelineEntry>,
    }

    #[async_trait]
    impl FeedStoreApi for FakeStore {
        async fn read_range(
            &self,
            _user_id: i64,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<TimelineEntry>, CoreError> {
            let offset = offset as usize;
            let limit = limit as usize;
            Ok(self.rows.iter().skip(offset).take(limit).cloned().collect())
        }
    }

    fn entry(post_id: i64) -> TimelineEntry {
        TimelineEntry {
            post_id,
            body: "hi".to_string(),
            author_id: 1,
            author_username: "alice".to_string(),
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cache_hit_never_touches_the_store() {
        let cache = FakeCache {
            hit: Some(vec![CachedEntry {
                post_id: 1,
                body: "hi".to_string(),
                author_id: 1,
                author_username: "alice".to_string(),
                ts: Utc::now(),
            }]),
            warmed: Mutex::new(Vec::new()),
        };
        let store = FakeStore { rows: Vec::new() };

        let page = get_feed(&cache, &store, &Metrics::noop(), 1000, 7, 10, 0).await;
        assert_eq!(page.len(), 1);
        assert!(cache.warmed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cache_miss_falls_back_to_store_and_warms() {
        let cache = FakeCache {
            hit: None,
            warmed: Mutex::new(Vec::new()),
        };
        let store = FakeStore {
            rows: vec![entry(3), entry(2), entry(1)],
        };

        let page = get_feed(&cache, &store, &Metrics::noop(), 1000, 7, 10, 0).await;
        assert_eq!(page.iter().map(|e| e.post_id).collect::<Vec<_>>(), vec![3, 2, 1]);

        let warmed = cache.warmed.lock().unwrap();
        assert_eq!(warmed.len(), 1);
        assert_eq!(warmed[0].0, 7);
        // warm() is fed oldest-first so the ring's own append order
        // reproduces the newest-first read.
        assert_eq!(
            warmed[0].1.iter().map(|e| e.post_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn cache_miss_respects_requested_page_within_the_warmed_window() {
        let cache = FakeCache {
            hit: None,
            warmed: Mutex::new(Vec::new()),
        };
        let store = FakeStore {
            rows: vec![entry(4), entry(3), entry(2), entry(1)],
        };

        let page = get_feed(&cache, &store, &Metrics::noop(), 1000, 7, 2, 1).await;
        assert_eq!(page.iter().map(|e| e.post_id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn store_failure_degrades_to_an_empty_page() {
        struct FailingStore;
        #[async_trait]
        impl FeedStoreApi for FailingStore {
            async fn read_range(
                &self,
                _user_id: i64,
                _limit: i64,
                _offset: i64,
            ) -> Result<Vec<TimelineEntry>, CoreError> {
                Err(CoreError::Transient(anyhow::anyhow!("db down")))
            }
        }

        let cache = FakeCache {
            hit: None,
            warmed: Mutex::new(Vec::new()),
        };
        let page = get_feed(&cache, &FailingStore, &Metrics::noop(), 1000, 7, 10, 0).await;
        assert!(page.is_empty());
    }
}
