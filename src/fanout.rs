//! Fanout publisher (module D): on post accept, durably insert the post,
//! then emit one message per follower plus the author, batched ~200
//! messages per broker transaction.

use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use lapin::Channel;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::broker;
use crate::message::FanoutMessage;
use crate::metrics::Metrics;
use crate::recovery::RecoverySweep;

#[derive(Debug, Clone, sqlx::FromRow)]
struct AcceptedPost {
    id: i64,
    author_id: i64,
    body: String,
    created_at: chrono::DateTime<Utc>,
}

pub struct FanoutPublisher {
    pool: Pool<Postgres>,
    channel: Channel,
    metrics: Metrics,
    batch_size: usize,
    recovery: RecoverySweep,
}

impl FanoutPublisher {
    pub fn new(
        pool: Pool<Postgres>,
        channel: Channel,
        metrics: Metrics,
        batch_size: usize,
        recovery: RecoverySweep,
    ) -> Self {
        Self {
            pool,
            channel,
            metrics,
            batch_size,
            recovery,
        }
    }

    /// Validates and durably inserts a new post, then fans it out to every
    /// follower plus the author. Returns the new post id.
    pub async fn accept_post(&self, author_id: i64, body: &str) -> Result<i64> {
        let started = Instant::now();
        let result = self.accept_post_inner(author_id, body).await;
        self.metrics.time("tweet.create", started.elapsed());
        result
    }

    async fn accept_post_inner(&self, author_id: i64, body: &str) -> Result<i64> {
        validate_body(body)?;

        let post = sqlx::query_as::<_, AcceptedPost>(
            "INSERT INTO posts (author_id, body, created_at) VALUES ($1, $2, $3)
             RETURNING id, author_id, body, created_at",
        )
        .bind(author_id)
        .bind(body)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to insert post")?;

        let author_username: String =
            sqlx::query_scalar("SELECT username FROM users WHERE id = $1")
                .bind(author_id)
                .fetch_one(&self.pool)
                .await
                .context("failed to look up author username")?;

        let mut recipients: Vec<i64> =
            sqlx::query_scalar("SELECT follower_id FROM follows WHERE followed_id = $1")
                .bind(author_id)
                .fetch_all(&self.pool)
                .await
                .context("failed to look up followers")?;
        recipients.push(author_id);

        // The post is already committed at this point. A publish failure
        // from here on must not fail the caller's request — it is handed
        // to the recovery sweep so at-least-once fanout still holds.
        self.publish_fanout(&post, &author_username, &recipients)
            .await;

        self.metrics.incr("posts.created");
        Ok(post.id)
    }

    async fn publish_fanout(&self, post: &AcceptedPost, author_username: &str, recipients: &[i64]) {
        let batch_id = Uuid::new_v4();
        let messages: Vec<FanoutMessage> = recipients
            .iter()
            .enumerate()
            .map(|(idx, &user_id)| FanoutMessage {
                schema_version: crate::message::CURRENT_SCHEMA_VERSION,
                message_id: FanoutMessage::message_id(&batch_id, idx),
                post_id: post.id,
                author_id: post.author_id,
                body: post.body.clone(),
                author_username: author_username.to_string(),
                ts: post.created_at,
                user_id,
            })
            .collect();

        for chunk in messages.chunks(self.batch_size) {
            match broker::publish_batch(&self.channel, chunk).await {
                Ok(()) => self.metrics.count("fanout.messages.published", chunk.len() as i64),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        post_id = post.id,
                        batch_size = chunk.len(),
                        "fanout batch publish failed, queuing for recovery sweep"
                    );
                    self.recovery.enqueue(chunk.to_vec());
                }
            }
        }
    }
}

fn validate_body(body: &str) -> Result<()> {
    let len = body.chars().count();
    if len == 0 || len > 280 {
        anyhow::bail!("post body must be 1-280 characters, got {len}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_body() {
        assert!(validate_body("").is_err());
    }

    #[test]
    fn rejects_oversized_body() {
        let too_long = "a".repeat(281);
        assert!(validate_body(&too_long).is_err());
    }

    #[test]
    fn accepts_body_at_the_boundary() {
        let exactly_280 = "a".repeat(280);
        assert!(validate_body(&exactly_280).is_ok());
        assert!(validate_body("a").is_ok());
    }
}
