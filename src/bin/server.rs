//! Long-running control process: connects to Postgres, Redis, and the AMQP
//! broker, declares the partition topology, exposes a small admin/health
//! router, and runs the recovery-sweep and cache-warming background tasks.
//!
//! The HTTP surface that accepts posts and follow/unfollow changes is an
//! external collaborator (out of scope for this repository); `accept_post`
//! and `on_follow`/`on_unfollow` are exposed here as plain async functions
//! on shared state for that collaborator to call into, not as routed
//! endpoints.

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

use feed_fanout::broker::{self, PartitionRouterConfig};
use feed_fanout::config::Config;
use feed_fanout::fanout::FanoutPublisher;
use feed_fanout::feed::FeedReader;
use feed_fanout::follow_reactor::FollowGraphReactor;
use feed_fanout::http::{admin, context::AdminContext};
use feed_fanout::metrics::Metrics;
use feed_fanout::recovery::RecoverySweep;
use feed_fanout::timeline_cache::TimelineCache;
use feed_fanout::timeline_store::TimelineStore;
use feed_fanout::warm_sweep::WarmSweepTask;

#[derive(Parser)]
#[command(name = "server", version)]
struct Args {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    Args::parse();

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
    sqlx::migrate!().run(&pool).await?;

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

    let store = TimelineStore::new(pool.clone(), *config.store_cap.as_ref());
    let reactor = FollowGraphReactor::new(store.clone(), cache.clone(), metrics.clone());

    let amqp_conn = broker::connect(&config.amqp_url).await?;
    let amqp_channel = amqp_conn.create_channel().await?;
    broker::declare_topology(
        &amqp_channel,
        &PartitionRouterConfig {
            worker_count: *config.worker_count.as_ref(),
            ..Default::default()
        },
    )
    .await?;

    let recovery = RecoverySweep::new(metrics.clone());
    // Entry points for the external HTTP collaborator (accept a post, read a
    // feed); this binary only constructs and holds them ready, it never
    // calls them itself.
    let _publisher = FanoutPublisher::new(
        pool.clone(),
        amqp_channel.clone(),
        metrics.clone(),
        *config.fanout_batch_size.as_ref(),
        recovery.clone(),
    );
    let _feed_reader = FeedReader::new(
        cache.clone(),
        store.clone(),
        metrics.clone(),
        *config.store_cap.as_ref(),
        config.feed_read_timeout.as_ref().to_std()?,
    );

    let admin_context = AdminContext::new(
        store.clone(),
        cache.clone(),
        reactor,
        metrics.clone(),
        &config.version,
    );
    let app = admin::router(admin_context);

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    {
        let tracker = tracker.clone();
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
                () = inner_token.cancelled() => {},
                _ = terminate => {},
                _ = ctrl_c => {},
            }
            tracker.close();
            inner_token.cancel();
        });
    }

    {
        let inner_token = token.clone();
        let interval = config.recovery_task_interval.as_ref().to_std()?;
        let recovery = recovery.clone();
        let channel = amqp_channel.clone();
        if *config.recovery_task_enable.as_ref() {
            tracker.spawn(async move {
                if let Err(err) = recovery.run_background(channel, interval, inner_token.clone()).await {
                    tracing::warn!(error = ?err, "recovery sweep task error");
                }
                inner_token.cancel();
            });
        }
    }

    if *config.warm_sweep_enable.as_ref() {
        let inner_token = token.clone();
        let interval = config.warm_sweep_interval.as_ref().to_std()?;
        let warm_task = WarmSweepTask::new(store, cache, config.hot_user_limit, inner_token.clone());
        tracker.spawn(async move {
            if let Err(err) = warm_task.run_background(interval).await {
                tracing::warn!(error = ?err, "warm sweep task error");
            }
            inner_token.cancel();
        });
    }

    {
        let http_port = *config.http_port.as_ref();
        let inner_token = token.clone();
        tracker.spawn(async move {
            let listener = match TcpListener::bind(&format!("0.0.0.0:{http_port}")).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!(error = %err, "failed to bind admin listener");
                    inner_token.cancel();
                    return;
                }
            };

            let shutdown_token = inner_token.clone();
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_token.cancelled().await;
                })
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "axum task failed");
            }
            inner_token.cancel();
        });
    }

    tracker.wait().await;
    Ok(())
}
