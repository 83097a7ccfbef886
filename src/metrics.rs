//! Thin StatsD handle, wrapping `cadence` the way the teacher wraps other
//! cross-cutting concerns (cache, config) behind a small cloneable type so
//! call sites never touch the underlying client directly.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use cadence::{Counted, CountedExt, Gauged, StatsdClient, Timed, UdpMetricSink};

#[derive(Clone)]
pub struct Metrics {
    client: Arc<StatsdClient>,
}

impl Metrics {
    pub fn new(host: &str, port: u16) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let sink = UdpMetricSink::from((host, port), socket)?;
        let client = StatsdClient::from_sink("feed_fanout", sink);
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// A no-op client used in tests and anywhere metrics aren't wired up.
    pub fn noop() -> Self {
        let client = StatsdClient::from_sink("feed_fanout", cadence::NopMetricSink);
        Self {
            client: Arc::new(client),
        }
    }

    pub fn incr(&self, metric: &str) {
        if let Err(err) = self.client.incr(metric) {
            tracing::debug!(error = %err, metric, "metrics emit failed");
        }
    }

    /// Like `incr`, but for an event that happened `n` times in one batch
    /// (e.g. a fanout batch of several messages published in one publish
    /// call) rather than once.
    pub fn count(&self, metric: &str, n: i64) {
        if let Err(err) = self.client.count(metric, n) {
            tracing::debug!(error = %err, metric, "metrics emit failed");
        }
    }

    pub fn time(&self, metric: &str, duration: Duration) {
        if let Err(err) = self.client.time(metric, duration.as_millis() as u64) {
            tracing::debug!(error = %err, metric, "metrics emit failed");
        }
    }

    pub fn gauge(&self, metric: &str, value: u64) {
        if let Err(err) = self.client.gauge(metric, value) {
            tracing::debug!(error = %err, metric, "metrics emit failed");
        }
    }
}
