//! The Tally statsd aggregation daemon.
//!
//! This crate contains the [`run`] function which starts the daemon. It receives statsd lines
//! over UDP or TCP, aggregates them in memory and periodically flushes the aggregates to the
//! configured backends.
//!
//! See the [`Config`] documentation for more information on configuration options.
//!
//! # Path of a Metric through Tally
//!
//! ```text
//! socket -> read loop -> parser task -> dispatcher -> aggregation worker -> flush -> backends
//!                                           ^
//!                                      cloud cache
//! ```
//!
//!  1. A read loop of the [receiver](services::receiver) collects datagrams or lines into a batch
//!     and hands it to a parser task through a bounded channel.
//!  2. The parser task parses every line. Malformed lines are counted and skipped.
//!  3. The [dispatcher](services::dispatcher) applies cached cloud tags, computes the identity
//!     of each metric and enqueues it for the worker owning that identity. If the worker's queue
//!     is full, the metrics are dropped.
//!  4. The [aggregation worker](services::aggregator) folds the metric into its shard.
//!  5. Every flush interval, the [flush service](services::flush) collects a snapshot from every
//!     worker, computes timer summaries and hands the batch to all
//!     [backends](services::backend) concurrently.
//!
//! # Shutdown
//!
//! On `SIGINT` or `SIGTERM` the read loops stop, parser tasks finish what was already read, and
//! a final flush drains all worker queues. The process exits once the backends have received the
//! final batch or the shutdown timeout has elapsed.
#![warn(missing_docs)]

mod service;
pub mod services;
mod statsd;
mod utils;

use std::sync::Arc;

use anyhow::Context;
use tally_config::Config;
use tally_system::{Controller, Shutdown};

pub use self::service::{ServiceError, ServiceState, create_runtime};

/// Runs the daemon until a shutdown signal is received.
///
/// If `internal_metrics` is given, the daemon's own metrics received on this channel are
/// aggregated and flushed like received metrics.
pub fn run(
    config: Config,
    internal_metrics: Option<crossbeam_channel::Receiver<Vec<u8>>>,
) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let runtime =
        create_runtime("main-rt", config.max_thread_count()).context(ServiceError::Runtime)?;

    runtime.block_on(async {
        Controller::start(config.shutdown_timeout());

        let state = ServiceState::start(config.clone(), internal_metrics)?;
        tally_log::info!("tally started, receiving on {}", state.local_addr());

        let Shutdown { timeout } = Controller::shutdown_handle().notified().await;
        let Some(timeout) = timeout else {
            tally_log::info!("immediate shutdown, skipping final flush");
            return Ok(());
        };

        if tokio::time::timeout(timeout, state.shutdown()).await.is_err() {
            tally_log::warn!("shutdown timed out, metrics of the last flush window may be lost");
        }

        anyhow::Ok(())
    })?;

    tally_log::info!("tally has shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tally_metrics::MetricBatch;
    use tokio::net::UdpSocket;

    use super::*;

    fn counter_delta(batch: &MetricBatch, name: &str) -> Option<f64> {
        let counter = batch.counters.iter().find(|counter| counter.name == name)?;
        Some(counter.delta)
    }

    #[tokio::test]
    async fn test_udp_end_to_end() {
        tally_test::setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.txt");

        let config = Config::from_json_value(serde_json::json!({
            "receiver": { "bind": "127.0.0.1:0", "max_readers": 2, "max_parsers": 2 },
            "aggregator": { "max_workers": 4, "flush_interval_ms": 600000, "percentiles": [90] },
            "backends": [{ "type": "stdout", "path": path }],
        }))
        .unwrap();

        let state = ServiceState::start(Arc::new(config), None).unwrap();
        let addr = state.local_addr();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"foo.bar:1|c\nnot-a-metric\nfoo.bar:1|c", addr)
            .await
            .unwrap();
        client
            .send_to(b"foo.gauge:5|g\nfoo.gauge:9|g", addr)
            .await
            .unwrap();
        let timings: Vec<_> = (1..=100).map(|i| format!("req.time:{i}|ms")).collect();
        client
            .send_to(timings.join("\n").as_bytes(), addr)
            .await
            .unwrap();

        // Each datagram is parsed as a whole, so every check below sees one complete datagram.
        let mut counter = None;
        let mut gauge = None;
        let mut timer = None;
        for _ in 0..100 {
            let batch = state.flush().await.unwrap();
            counter = counter.or(counter_delta(&batch, "foo.bar").filter(|delta| *delta > 0.0));
            gauge = gauge.or(batch.gauges.first().map(|gauge| gauge.value));
            timer = timer.or(batch.timers.first().map(|timer| timer.summary.clone()));

            if counter.is_some() && gauge.is_some() && timer.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(counter, Some(2.0));
        assert_eq!(gauge, Some(9.0));

        let timer = timer.unwrap();
        assert_eq!(timer.count, 100);
        assert_eq!(timer.min, 1.0);
        assert_eq!(timer.max, 100.0);
        assert_eq!(timer.percentiles[0].label(), "upper_90");
        assert_eq!(timer.percentiles[0].bound, 90.0);

        state.shutdown().await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(
            contents
                .lines()
                .any(|line| line.starts_with("stats.counters.foo.bar.count;host=127.0.0.1 2 "))
        );
        assert!(
            contents
                .lines()
                .any(|line| line.starts_with("stats.gauges.foo.gauge;host=127.0.0.1 9 "))
        );
    }
}
