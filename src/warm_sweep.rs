//! Opportunistic cache-warming sweep (supplementary to module B): on an
//! interval, re-populate the ring buffers of the users the hot-user tracker
//! says are read most often, straight from the authoritative store.
//!
//! Grounded in the teacher's `CleanTask` background-task skeleton
//! (cancellation-token-gated sleep loop); only the body changed.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::timeline_cache::{CachedEntry, TimelineCache};
use crate::timeline_store::TimelineStore;

pub struct WarmSweepTask {
    store: TimelineStore,
    cache: TimelineCache,
    hot_user_limit: isize,
    cancellation_token: CancellationToken,
}

impl WarmSweepTask {
    pub fn new(
        store: TimelineStore,
        cache: TimelineCache,
        hot_user_limit: isize,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            cache,
            hot_user_limit,
            cancellation_token,
        }
    }

    pub async fn run_background(&self, interval: std::time::Duration) -> Result<()> {
        let sleeper = tokio::time::sleep(interval);
        tokio::pin!(sleeper);

        loop {
            tokio::select! {
                () = self.cancellation_token.cancelled() => {
                    break;
                },
                () = &mut sleeper => {
                    if let Err(err) = self.main().await {
                        tracing::warn!(error = %err, "warm sweep failed");
                    }
                    sleeper.as_mut().reset(tokio::time::Instant::now() + interval);
                }
            }
        }
        Ok(())
    }

    pub async fn main(&self) -> Result<()> {
        for user_id in self.cache.hot_users(self.hot_user_limit).await {
            let page = self.store.read_range(user_id, 1000, 0).await?;
            let entries: Vec<CachedEntry> = page
                .into_iter()
                .map(|e| CachedEntry {
                    post_id: e.post_id,
                    body: e.body,
                    author_id: e.author_id,
                    author_username: e.author_username,
                    ts: e.ts,
                })
                .collect();
            // read_range is newest-first; warm()/add() expects insertion
            // order so the ring's own append semantics produce the same
            // newest-first read, so the entries must be pushed oldest-first.
            let mut oldest_first = entries;
            oldest_first.reverse();
            self.cache.warm(&[user_id], &oldest_first).await;
        }
        Ok(())
    }
}
