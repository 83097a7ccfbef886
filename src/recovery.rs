//! Recovery sweep for the fanout publisher (module D, supplementary):
//! publish failures that occur after a post's insert has already committed
//! must not be dropped on the floor, or at-least-once fanout delivery would
//! be violated for that post's followers. Failed batches are queued here
//! and retried on an interval with bounded backoff; batches that exhaust
//! the retry budget are logged and counted so an operator can intervene.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use lapin::Channel;
use tokio_util::sync::CancellationToken;

use crate::broker;
use crate::message::FanoutMessage;
use crate::metrics::Metrics;

const MAX_ATTEMPTS: u32 = 8;

struct PendingBatch {
    messages: Vec<FanoutMessage>,
    attempts: u32,
    next_attempt_at: Instant,
}

/// Shared handle; `FanoutPublisher` pushes a failed batch in, the
/// background sweep drains it.
#[derive(Clone)]
pub struct RecoverySweep {
    queue: std::sync::Arc<Mutex<Vec<PendingBatch>>>,
    metrics: Metrics,
}

impl RecoverySweep {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            queue: std::sync::Arc::new(Mutex::new(Vec::new())),
            metrics,
        }
    }

    pub fn enqueue(&self, messages: Vec<FanoutMessage>) {
        let batch = PendingBatch {
            messages,
            attempts: 0,
            next_attempt_at: Instant::now(),
        };
        self.queue.lock().unwrap().push(batch);
        self.metrics.incr("fanout.recovery.queued");
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Retries every batch whose backoff has elapsed. Batches that
    /// exhaust `MAX_ATTEMPTS` are dropped from the queue and counted as a
    /// permanent failure for an operator to investigate; this is the one
    /// place the at-least-once contract is knowingly given up, after
    /// exhausting retries that normally make it unnecessary.
    pub async fn sweep_once(&self, channel: &Channel) -> anyhow::Result<()> {
        for mut batch in self.drain_due() {
            match broker::publish_batch(channel, &batch.messages).await {
                Ok(()) => {
                    self.metrics.incr("fanout.recovery.succeeded");
                }
                Err(err) => {
                    batch.attempts += 1;
                    if batch.attempts >= MAX_ATTEMPTS {
                        tracing::error!(
                            error = %err,
                            attempts = batch.attempts,
                            batch_size = batch.messages.len(),
                            "fanout recovery batch exhausted retry budget, dropping"
                        );
                        self.metrics.incr("fanout.recovery.abandoned");
                    } else {
                        let backoff = Duration::from_secs(2u64.saturating_pow(batch.attempts));
                        batch.next_attempt_at = Instant::now() + backoff;
                        self.queue.lock().unwrap().push(batch);
                        self.metrics.incr("fanout.recovery.retry");
                    }
                }
            }
        }

        Ok(())
    }

    fn drain_due(&self) -> Vec<PendingBatch> {
        let mut queue = self.queue.lock().unwrap();
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) =
            queue.drain(..).partition(|batch| batch.next_attempt_at <= now);
        *queue = pending;
        due
    }

    pub async fn run_background(
        &self,
        channel: Channel,
        interval: Duration,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let sleeper = tokio::time::sleep(interval);
        tokio::pin!(sleeper);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = &mut sleeper => {
                    if let Err(err) = self.sweep_once(&channel).await {
                        tracing::warn!(error = %err, "recovery sweep pass failed");
                    }
                    sleeper.as_mut().reset(tokio::time::Instant::now() + interval);
                }
            }
        }
        Ok(())
    }
}
