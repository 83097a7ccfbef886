//! Remote-KV-backed per-user timeline cache (module B).
//!
//! Every operation here is best-effort: a Redis failure is logged, counted,
//! and turned into a cache-miss-shaped result rather than propagated as an
//! error, so the caller always has a path to fall back to the authoritative
//! store.

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::metrics::Metrics;
use crate::ring_buffer::RingBuffer;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedEntry {
    pub post_id: i64,
    pub body: String,
    pub author_id: i64,
    pub author_username: String,
    pub ts: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TimelineCache {
    conn: redis::aio::ConnectionManager,
    metrics: Metrics,
    ring_capacity: usize,
    feed_ttl_secs: u64,
    post_ttl_secs: u64,
    dedup_ttl_secs: u64,
}

fn feed_key(user_id: i64) -> String {
    format!("feed:buffer:{user_id}")
}

fn post_key(post_id: i64) -> String {
    format!("tweet:{post_id}")
}

fn dedup_key(message_id: &str) -> String {
    format!("msg:processed:{message_id}")
}

const HOT_USERS_KEY: &str = "users:hot";
const ACCESS_KEY: &str = "feed:access";

impl TimelineCache {
    pub fn new(
        conn: redis::aio::ConnectionManager,
        metrics: Metrics,
        ring_capacity: usize,
        feed_ttl_secs: u64,
        post_ttl_secs: u64,
        dedup_ttl_secs: u64,
    ) -> Self {
        Self {
            conn,
            metrics,
            ring_capacity,
            feed_ttl_secs,
            post_ttl_secs,
            dedup_ttl_secs,
        }
    }

    /// Returns `None` on a cache miss or any Redis failure — both are
    /// equally "go read the store" signals to the caller.
    pub async fn get_feed(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> Option<Vec<CachedEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.get(feed_key(user_id)).await {
            Ok(val) => val,
            Err(err) => {
                tracing::warn!(error = %err, user_id, "feed cache read failed");
                self.metrics.incr("feed.cache.error");
                return None;
            }
        };

        let Some(raw) = raw else {
            self.metrics.incr("feed.cache.miss");
            return None;
        };

        let buffer: RingBuffer<CachedEntry> = match serde_json::from_str(&raw) {
            Ok(buf) => buf,
            Err(err) => {
                tracing::warn!(error = %err, user_id, "feed cache payload corrupt");
                self.metrics.incr("feed.cache.error");
                return None;
            }
        };

        self.metrics.incr("feed.cache.hit");
        let _ = conn
            .zadd::<_, _, _, ()>(ACCESS_KEY, user_id.to_string(), Utc::now().timestamp())
            .await;
        self.mark_hot_user(user_id).await;

        Some(buffer.read(limit, offset))
    }

    pub async fn append_to_feed(&self, user_id: i64, entry: CachedEntry) {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(feed_key(user_id)).await.unwrap_or(None);

        let mut buffer: RingBuffer<CachedEntry> = raw
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_else(|| RingBuffer::new(self.ring_capacity));

        buffer.add(entry);

        let Ok(serialized) = serde_json::to_string(&buffer) else {
            tracing::warn!(user_id, "failed to serialize feed buffer");
            return;
        };

        if let Err(err) = conn
            .set_ex::<_, _, ()>(feed_key(user_id), serialized, self.feed_ttl_secs)
            .await
        {
            tracing::warn!(error = %err, user_id, "feed cache write failed");
            self.metrics.incr("feed.cache.error");
        }
    }

    pub async fn cache_post(&self, post_id: i64, entry: &CachedEntry) {
        let mut conn = self.conn.clone();
        let Ok(serialized) = serde_json::to_string(entry) else {
            return;
        };
        if let Err(err) = conn
            .set_ex::<_, _, ()>(post_key(post_id), serialized, self.post_ttl_secs)
            .await
        {
            tracing::warn!(error = %err, post_id, "post cache write failed");
            self.metrics.incr("feed.cache.error");
        }
    }

    pub async fn get_post(&self, post_id: i64) -> Option<CachedEntry> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(post_key(post_id)).await.ok().flatten();
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    /// `true` if this message has already been processed within the dedup
    /// window. A Redis failure here is treated as "not seen" — the
    /// database's unique constraint is the second line of defense against a
    /// duplicate insert, so a cache miss-due-to-error never causes data
    /// loss, only a possible extra (harmless) insert attempt.
    pub async fn seen_message(&self, message_id: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.exists::<_, bool>(dedup_key(message_id)).await {
            Ok(seen) => seen,
            Err(err) => {
                tracing::warn!(error = %err, message_id, "dedup cache read failed");
                self.metrics.incr("feed.cache.error");
                false
            }
        }
    }

    pub async fn mark_message(&self, message_id: &str) {
        let mut conn = self.conn.clone();
        if let Err(err) = conn
            .set_ex::<_, _, ()>(dedup_key(message_id), "1", self.dedup_ttl_secs)
            .await
        {
            tracing::warn!(error = %err, message_id, "dedup cache write failed");
            self.metrics.incr("feed.cache.error");
        }
    }

    pub async fn invalidate_user(&self, user_id: i64) {
        let mut conn = self.conn.clone();
        if let Err(err) = conn.del::<_, ()>(feed_key(user_id)).await {
            tracing::warn!(error = %err, user_id, "feed cache invalidate failed");
            self.metrics.incr("feed.cache.error");
        }
    }

    /// Pre-populates buffers for a batch of users with the same entry set,
    /// used to pre-warm celebrities/hot users after a rebuild or on a
    /// scheduled sweep.
    pub async fn warm(&self, user_ids: &[i64], entries: &[CachedEntry]) {
        for &user_id in user_ids {
            let mut buffer: RingBuffer<CachedEntry> = RingBuffer::new(self.ring_capacity);
            for entry in entries {
                buffer.add(entry.clone());
            }
            let Ok(serialized) = serde_json::to_string(&buffer) else {
                continue;
            };
            let mut conn = self.conn.clone();
            if let Err(err) = conn
                .set_ex::<_, _, ()>(feed_key(user_id), serialized, self.feed_ttl_secs)
                .await
            {
                tracing::warn!(error = %err, user_id, "feed cache warm failed");
                self.metrics.incr("feed.cache.error");
            }
        }
    }

    async fn mark_hot_user(&self, user_id: i64) {
        let mut conn = self.conn.clone();
        let _ = conn
            .zincr::<_, _, _, ()>(HOT_USERS_KEY, user_id.to_string(), 1)
            .await;
    }

    pub async fn hot_users(&self, limit: isize) -> Vec<i64> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .zrevrange(HOT_USERS_KEY, 0, limit.saturating_sub(1))
            .await
            .unwrap_or_default();
        raw.iter().filter_map(|s| s.parse().ok()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn live_cache() -> TimelineCache {
        let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set for this test");
        let client = redis::Client::open(redis_url).expect("invalid REDIS_URL");
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .expect("failed to connect to redis");
        TimelineCache::new(conn, Metrics::noop(), 4, 3600, 7200, 300)
    }

    fn sample_entry(post_id: i64) -> CachedEntry {
        CachedEntry {
            post_id,
            body: "hi".to_string(),
            author_id: 1,
            author_username: "alice".to_string(),
            ts: Utc::now(),
        }
    }

    /// Exercises the ring buffer's Redis round trip, the dedup marker, and
    /// the hot-user counter against a live instance. Run with:
    /// `REDIS_URL=redis://localhost:6379 cargo test --ignored timeline_cache`.
    #[tokio::test]
    #[ignore]
    async fn append_then_get_feed_round_trips_through_redis() {
        let cache = live_cache().await;
        let user_id = 900_001_i64;
        cache.invalidate_user(user_id).await;

        assert!(cache.get_feed(user_id, 10, 0).await.is_none());

        cache.append_to_feed(user_id, sample_entry(1)).await;
        cache.append_to_feed(user_id, sample_entry(2)).await;
        cache.append_to_feed(user_id, sample_entry(3)).await;

        let page = cache.get_feed(user_id, 10, 0).await.expect("expected a hit");
        assert_eq!(
            page.iter().map(|e| e.post_id).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );

        cache.invalidate_user(user_id).await;
        assert!(cache.get_feed(user_id, 10, 0).await.is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn warm_preloads_a_ring_for_opportunistic_reads() {
        let cache = live_cache().await;
        let user_id = 900_002_i64;

        cache.warm(&[user_id], &[sample_entry(10), sample_entry(11)]).await;
        let page = cache.get_feed(user_id, 10, 0).await.expect("expected a hit");
        assert_eq!(
            page.iter().map(|e| e.post_id).collect::<Vec<_>>(),
            vec![11, 10]
        );

        cache.invalidate_user(user_id).await;
    }

    #[tokio::test]
    #[ignore]
    async fn dedup_marker_prevents_a_second_sighting_within_the_ttl() {
        let cache = live_cache().await;
        let message_id = "redis-itest-batch-0";

        assert!(!cache.seen_message(message_id).await);
        cache.mark_message(message_id).await;
        assert!(cache.seen_message(message_id).await);
    }

    #[tokio::test]
    #[ignore]
    async fn get_feed_hit_increments_the_hot_user_counter() {
        let cache = live_cache().await;
        let user_id = 900_003_i64;
        cache.invalidate_user(user_id).await;

        cache.append_to_feed(user_id, sample_entry(1)).await;
        // A read, not the write above, is what must bump the hot-user score.
        cache.get_feed(user_id, 10, 0).await;
        cache.get_feed(user_id, 10, 0).await;

        let hot = cache.hot_users(50).await;
        assert!(hot.contains(&user_id));

        cache.invalidate_user(user_id).await;
    }
}
