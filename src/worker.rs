//! Timeline worker (module F): one process per partition queue, bounded
//! prefetch, cooperative concurrency — up to `PREFETCH_COUNT` deliveries are
//! in flight at once, interleaved on one task rather than queued behind each
//! other. Any step failing before a delivery's ack leaves it unacked so the
//! broker redelivers it; concurrent deliveries for the same user are
//! expected and tolerated by the store's uniqueness constraint and the
//! ring's last-writer-wins append.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::Channel;

use crate::broker::queue_name;
use crate::errors::CoreError;
use crate::message::FanoutMessage;
use crate::metrics::Metrics;
use crate::timeline_cache::CachedEntry;
use crate::timeline_store::TimelineStore;

pub const PREFETCH_COUNT: u16 = 50;

#[async_trait]
pub trait StoreApi: Send + Sync {
    async fn insert_entry(
        &self,
        user_id: i64,
        post_id: i64,
        ts: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    async fn trim(&self, user_id: i64) -> Result<u64, CoreError>;
}

#[async_trait]
impl StoreApi for TimelineStore {
    async fn insert_entry(
        &self,
        user_id: i64,
        post_id: i64,
        ts: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        TimelineStore::insert_entry(self, user_id, post_id, ts).await
    }

    async fn trim(&self, user_id: i64) -> Result<u64, CoreError> {
        TimelineStore::trim(self, user_id).await
    }
}

#[async_trait]
pub trait CacheApi: Send + Sync {
    async fn seen_message(&self, message_id: &str) -> bool;
    async fn mark_message(&self, message_id: &str);
    async fn append_to_feed(&self, user_id: i64, entry: CachedEntry);
}

#[async_trait]
impl CacheApi for crate::timeline_cache::TimelineCache {
    async fn seen_message(&self, message_id: &str) -> bool {
        crate::timeline_cache::TimelineCache::seen_message(self, message_id).await
    }

    async fn mark_message(&self, message_id: &str) {
        crate::timeline_cache::TimelineCache::mark_message(self, message_id).await
    }

    async fn append_to_feed(&self, user_id: i64, entry: CachedEntry) {
        crate::timeline_cache::TimelineCache::append_to_feed(self, user_id, entry).await
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    DedupHit,
    Poison,
}

/// Per-message pipeline, independent of any broker client so it can be
/// exercised against in-memory fakes of the store/cache in tests.
///
/// Metric names are tagged with `worker_id`, per spec.md §6's
/// `worker.<id>.message.received/success/error/duplicate` contract — every
/// worker process writes to its own names, not a name shared across the
/// whole fleet.
pub async fn process_message(
    store: &dyn StoreApi,
    cache: &dyn CacheApi,
    metrics: &Metrics,
    worker_id: u32,
    payload: &[u8],
) -> Result<Outcome, CoreError> {
    metrics.incr(&format!("worker.{worker_id}.message.received"));

    let message = match FanoutMessage::from_json(payload) {
        Ok(m) if m.is_supported_version() => m,
        Ok(_) => {
            metrics.incr(&format!("worker.{worker_id}.message.error"));
            return Ok(Outcome::Poison);
        }
        Err(_) => {
            metrics.incr(&format!("worker.{worker_id}.message.error"));
            return Ok(Outcome::Poison);
        }
    };

    if cache.seen_message(&message.message_id).await {
        metrics.incr(&format!("worker.{worker_id}.message.duplicate"));
        return Ok(Outcome::DedupHit);
    }
    cache.mark_message(&message.message_id).await;

    let inserted = store
        .insert_entry(message.user_id, message.post_id, message.ts)
        .await?;

    if inserted {
        metrics.incr(&format!("worker.{worker_id}.insert.success"));
    } else {
        metrics.incr(&format!("worker.{worker_id}.insert.conflict"));
    }

    cache
        .append_to_feed(
            message.user_id,
            CachedEntry {
                post_id: message.post_id,
                body: message.body.clone(),
                author_id: message.author_id,
                author_username: message.author_username.clone(),
                ts: message.ts,
            },
        )
        .await;

    if inserted {
        let trimmed = store.trim(message.user_id).await?;
        if trimmed > 0 {
            metrics.incr(&format!("worker.{worker_id}.trim.count"));
        }
    }

    metrics.incr(&format!("worker.{worker_id}.message.success"));
    Ok(Outcome::Acked)
}

pub struct TimelineWorker {
    worker_id: u32,
    store: TimelineStore,
    cache: crate::timeline_cache::TimelineCache,
    metrics: Metrics,
}

impl TimelineWorker {
    pub fn new(
        worker_id: u32,
        store: TimelineStore,
        cache: crate::timeline_cache::TimelineCache,
        metrics: Metrics,
    ) -> Self {
        Self {
            worker_id,
            store,
            cache,
            metrics,
        }
    }

    /// Consumes `feed_updates_<worker_id>` until `cancel` fires, processing
    /// up to `PREFETCH_COUNT` deliveries concurrently (spec.md §4.6/§5:
    /// "Prefetch is bounded (50 in-flight messages). The worker processes in
    /// parallel up to that bound using cooperative concurrency"). Manual ack
    /// mode throughout: an error processing a delivery simply skips its ack,
    /// leaving the broker to redeliver after the nack. `take_until` stops
    /// pulling new deliveries once cancelled but lets whatever is already in
    /// flight finish, which is the "drain in-flight deliveries" half of
    /// graceful shutdown.
    pub async fn run(
        &self,
        channel: &Channel,
        cancel: tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<()> {
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;

        let queue = queue_name(self.worker_id);
        let consumer_tag = format!("timeline-worker-{}", self.worker_id);
        let consumer = channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let worker_id = self.worker_id;
        let shutdown_signal = async move {
            cancel.cancelled().await;
            tracing::info!(worker_id, "worker shutting down, draining in-flight deliveries");
        };

        consumer
            .take_until(shutdown_signal)
            .for_each_concurrent(PREFETCH_COUNT as usize, |delivery| async move {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(err) => {
                        tracing::warn!(error = %err, worker_id = self.worker_id, "consumer stream error");
                        return;
                    }
                };

                let started = Instant::now();
                let outcome = process_message(
                    &self.store,
                    &self.cache,
                    &self.metrics,
                    self.worker_id,
                    &delivery.data,
                )
                .await;
                self.metrics
                    .time(&format!("worker.{}.processing_time", self.worker_id), started.elapsed());

                match outcome {
                    Ok(Outcome::Acked) | Ok(Outcome::DedupHit) | Ok(Outcome::Poison) => {
                        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                            tracing::warn!(error = %err, worker_id = self.worker_id, "ack failed");
                        }
                    }
                    Err(err) if err.is_retryable() => {
                        tracing::warn!(error = %err, worker_id = self.worker_id, "transient processing failure, nacking for redelivery");
                        if let Err(nack_err) = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await {
                            tracing::warn!(error = %nack_err, worker_id = self.worker_id, "nack failed");
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, worker_id = self.worker_id, "non-retryable processing failure, dropping");
                        if let Err(nack_err) = delivery.nack(BasicNackOptions::default()).await {
                            tracing::warn!(error = %nack_err, worker_id = self.worker_id, "nack failed");
                        }
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Passive queue-depth check against this worker's own queue, sampled
    /// on an interval so the gauge reflects the broker's own view.
    pub async fn sample_queue_depth(&self, channel: &Channel) -> anyhow::Result<u32> {
        let queue = queue_name(self.worker_id);
        let declared = channel
            .queue_declare(
                &queue,
                lapin::options::QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let depth = declared.message_count();
        self.metrics
            .gauge(&format!("worker.{}.queue_size", self.worker_id), depth as u64);
        Ok(depth)
    }
}
