//! Partition router (module E): a consistent-hash exchange fanned out over
//! `W` durable queues, one per worker. The hash header guarantees that for
//! a fixed worker count, every message for one `user_id` lands on the same
//! queue.

use anyhow::{Context, Result};
use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

use crate::message::{priority_for_follower, routing_hash, FanoutMessage};

pub const EXCHANGE_NAME: &str = "feed_updates";
const CONSISTENT_HASH_EXCHANGE_KIND: &str = "x-consistent-hash";

pub fn queue_name(worker_id: u32) -> String {
    format!("feed_updates_{worker_id}")
}

#[derive(Clone)]
pub struct PartitionRouterConfig {
    pub worker_count: u32,
    pub queue_max_length: i64,
    pub queue_ttl_ms: i64,
}

impl Default for PartitionRouterConfig {
    fn default() -> Self {
        Self {
            worker_count: 24,
            queue_max_length: 200_000,
            queue_ttl_ms: 2 * 60 * 60 * 1000,
        }
    }
}

pub async fn connect(amqp_url: &str) -> Result<Connection> {
    Connection::connect(amqp_url, ConnectionProperties::default())
        .await
        .context("failed to connect to broker")
}

/// Declares the consistent-hash exchange and its `W` partition queues, each
/// bound with equal weight. Idempotent: re-declaring with identical
/// arguments on every process start is the expected steady state.
pub async fn declare_topology(channel: &Channel, config: &PartitionRouterConfig) -> Result<()> {
    let mut exchange_args = FieldTable::default();
    exchange_args.insert("hash-header".into(), AMQPValue::LongString("routing_hash".into()));

    channel
        .exchange_declare(
            EXCHANGE_NAME,
            ExchangeKind::Custom(CONSISTENT_HASH_EXCHANGE_KIND.to_string()),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            exchange_args,
        )
        .await
        .context("failed to declare consistent-hash exchange")?;

    for worker_id in 0..config.worker_count {
        let mut queue_args = FieldTable::default();
        queue_args.insert(
            "x-max-length".into(),
            AMQPValue::LongLongInt(config.queue_max_length),
        );
        queue_args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(config.queue_ttl_ms),
        );
        queue_args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(10));

        let name = queue_name(worker_id);
        channel
            .queue_declare(
                &name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_args,
            )
            .await
            .with_context(|| format!("failed to declare queue {name}"))?;

        // Equal weight across all queues divides the hash ring evenly.
        channel
            .queue_bind(
                &name,
                EXCHANGE_NAME,
                "10",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to bind queue {name}"))?;
    }

    Ok(())
}

/// Publishes one batch (all-or-nothing from the caller's perspective: any
/// publish failure mid-batch is returned to the caller, which decides
/// whether to retry the whole batch via the recovery sweep).
pub async fn publish_batch(channel: &Channel, messages: &[FanoutMessage]) -> Result<()> {
    for message in messages {
        let payload = message.to_json().context("failed to serialize fanout message")?;
        let hash = routing_hash(message.user_id, 25);
        let priority = priority_for_follower(message.user_id);

        let mut headers = FieldTable::default();
        headers.insert("routing_hash".into(), AMQPValue::LongString(hash.clone().into()));
        headers.insert(
            "user_id".into(),
            AMQPValue::LongString(message.user_id.to_string().into()),
        );

        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_message_id(message.message_id.clone().into())
            .with_priority(priority)
            .with_headers(headers);

        channel
            .basic_publish(
                EXCHANGE_NAME,
                &hash,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .context("failed to publish fanout message")?
            .await
            .context("broker did not confirm publish")?;
    }

    Ok(())
}
