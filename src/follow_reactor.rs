//! Follow-graph reactor (module G): on a follow/unfollow edge change,
//! synchronously invalidate the subscriber's cache then rebuild their
//! stored timeline, so the change is visible on the very next read.

use crate::errors::CoreError;
use crate::metrics::Metrics;
use crate::timeline_cache::TimelineCache;
use crate::timeline_store::TimelineStore;

#[derive(Clone)]
pub struct FollowGraphReactor {
    store: TimelineStore,
    cache: TimelineCache,
    metrics: Metrics,
}

impl FollowGraphReactor {
    pub fn new(store: TimelineStore, cache: TimelineCache, metrics: Metrics) -> Self {
        Self {
            store,
            cache,
            metrics,
        }
    }

    /// The follow edge itself is owned by an external collaborator; this
    /// reacts to it having already been written.
    pub async fn on_follow(&self, subscriber_id: i64) -> Result<u64, CoreError> {
        self.cache.invalidate_user(subscriber_id).await;
        let rebuilt = self.store.rebuild(subscriber_id).await?;
        self.metrics.incr("feed.rebuild.success");
        Ok(rebuilt)
    }

    pub async fn on_unfollow(&self, subscriber_id: i64) -> Result<u64, CoreError> {
        self.cache.invalidate_user(subscriber_id).await;
        let rebuilt = self.store.rebuild(subscriber_id).await?;
        self.metrics.incr("feed.rebuild.success");
        Ok(rebuilt)
    }
}
