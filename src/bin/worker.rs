//! Standalone worker process (spec CLI surface): `worker <worker_id>`
//! consumes `feed_updates_<worker_id>` until SIGTERM/SIGINT, then drains
//! in-flight deliveries and exits.

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use feed_fanout::config::Config;
use feed_fanout::metrics::Metrics;
use feed_fanout::timeline_cache::TimelineCache;
use feed_fanout::timeline_store::TimelineStore;
use feed_fanout::worker::TimelineWorker;

#[derive(Parser)]
#[command(name = "worker", version)]
struct Args {
    /// Partition index this process consumes from (`feed_updates_<id>`).
    worker_id: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "feed_fanout=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();

    let config = Config::new()?;
    let metrics = Metrics::new(&config.statsd_host, config.statsd_port)?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect(&config.database_url)
        .await?;
    let store = TimelineStore::new(pool, *config.store_cap.as_ref());

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    let cache = TimelineCache::new(
        redis_conn,
        metrics.clone(),
        *config.ring_capacity.as_ref(),
        config.feed_cache_ttl.as_ref().num_seconds() as u64,
        config.post_cache_ttl.as_ref().num_seconds() as u64,
        config.dedup_ttl.as_ref().num_seconds() as u64,
    );

    let amqp_conn = feed_fanout::broker::connect(&config.amqp_url).await?;
    let channel = amqp_conn.create_channel().await?;

    let worker = TimelineWorker::new(args.worker_id, store, cache, metrics);

    let token = CancellationToken::new();
    {
        let inner_token = token.clone();
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = terminate => {},
                _ = ctrl_c => {},
            }
            inner_token.cancel();
        });
    }

    {
        let worker = &worker;
        let channel = channel.clone();
        let mut interval = tokio::time::interval(
            config.queue_depth_sample_interval.as_ref().to_std()?,
        );
        let sample_token = token.clone();
        let sampler = async move {
            loop {
                tokio::select! {
                    () = sample_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = worker.sample_queue_depth(&channel).await {
                            tracing::warn!(error = %err, "queue depth sample failed");
                        }
                    }
                }
            }
        };

        tokio::select! {
            result = worker.run(&channel, token.clone()) => {
                result?;
            }
            () = sampler => {}
        }
    }

    tracing::info!(worker_id = args.worker_id, "worker exited cleanly");
    Ok(())
}
