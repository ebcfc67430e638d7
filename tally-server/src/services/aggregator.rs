//! Aggregation workers, each owning one shard of the metric state.
use std::time::Duration;

use tally_metrics::{AggregateError, AggregatorConfig, MetricCounters, Shard, Snapshot};
use tally_statsd::metric;
use tally_system::{AsyncResponse, FromMessage, Interface, Receiver, Sender, Service};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::services::dispatcher::WorkerBatch;

/// Requests a snapshot of a worker's shard.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlushShard {
    /// Folds all queued batches into the shard before taking the snapshot.
    ///
    /// Used for the final flush on shutdown.
    pub drain: bool,
}

/// The answer of an aggregation worker to [`FlushShard`].
#[derive(Debug, Default)]
pub struct FlushedShard {
    /// The snapshot of the flush window.
    pub snapshot: Snapshot,
    /// Number of identities left in the shard after the flush.
    pub identities: usize,
}

/// The control interface of the [`AggregatorService`].
///
/// Data does not go through this interface but through the bounded queue created with
/// [`worker_queues`](crate::services::dispatcher::worker_queues).
#[derive(Debug)]
pub enum Aggregator {
    /// Takes a snapshot and resets the shard for the next window.
    Flush(FlushShard, Sender<FlushedShard>),
}

impl Interface for Aggregator {}

impl FromMessage<FlushShard> for Aggregator {
    type Response = AsyncResponse<FlushedShard>;

    fn from_message(message: FlushShard, sender: Sender<FlushedShard>) -> Self {
        Self::Flush(message, sender)
    }
}

/// An aggregation worker owning one shard of the metric state.
///
/// The worker folds batches from its ingestion queue in the order they were enqueued. Between
/// batches it answers flush requests and runs expiry scans in chunks, so a scan over a large
/// shard never blocks a flush.
pub struct AggregatorService {
    worker: usize,
    shard: Shard,
    queue: mpsc::Receiver<WorkerBatch>,
    expiry_check_interval: Duration,
    expiry_scan_chunk: usize,
    scanning: bool,
}

impl AggregatorService {
    /// Creates a worker consuming the given ingestion queue.
    pub fn new(
        worker: usize,
        config: &AggregatorConfig,
        queue: mpsc::Receiver<WorkerBatch>,
    ) -> Self {
        Self {
            worker,
            shard: Shard::new(config),
            queue,
            expiry_check_interval: config.expiry_check_interval(),
            expiry_scan_chunk: config.expiry_scan_chunk,
            scanning: false,
        }
    }

    fn handle_batch(&mut self, batch: WorkerBatch) {
        let now = Instant::now();

        for metric in batch.metrics {
            if let Err(error) = self.shard.merge(metric, now) {
                let AggregateError::TypeMismatch { aggregate, .. } = &error;
                tally_log::debug!(
                    error = &error as &dyn std::error::Error,
                    worker = self.worker,
                    "failed to merge metric"
                );
                metric!(
                    counter(MetricCounters::MergeFailed) += 1,
                    kind = aggregate.name()
                );
            }
        }

        for event in batch.events {
            self.shard.add_event(event);
        }
    }

    fn handle_flush(&mut self, message: FlushShard, sender: Sender<FlushedShard>) {
        if message.drain {
            while let Ok(batch) = self.queue.try_recv() {
                self.handle_batch(batch);
            }
        }

        let snapshot = self.shard.snapshot(Instant::now());
        sender.send(FlushedShard {
            snapshot,
            identities: self.shard.len(),
        });
    }

    fn handle_message(&mut self, message: Aggregator) {
        match message {
            Aggregator::Flush(message, sender) => self.handle_flush(message, sender),
        }
    }

    fn expire_step(&mut self) {
        let step = self
            .shard
            .expire_chunk(Instant::now(), self.expiry_scan_chunk);
        if step.finished {
            self.scanning = false;
        }
    }
}

impl Service for AggregatorService {
    type Interface = Aggregator;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        let start = Instant::now() + self.expiry_check_interval;
        let mut expiry = tokio::time::interval_at(start, self.expiry_check_interval);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                message = rx.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                _ = expiry.tick(), if !self.scanning => self.scanning = true,
                Some(batch) = self.queue.recv() => self.handle_batch(batch),
                _ = std::future::ready(()), if self.scanning => {
                    self.expire_step();
                    tokio::task::yield_now().await;
                }
            }
        }

        tally_log::debug!(worker = self.worker, "aggregation worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use tally_metrics::{Event, KeyedMetric, MetricKey, MetricType, MetricValue, Tags};
    use tally_system::Addr;

    use super::*;
    use crate::services::dispatcher::worker_queues;

    fn counter(name: &str, value: f64) -> KeyedMetric {
        KeyedMetric {
            key: MetricKey::new(MetricType::Counter, name.to_owned(), Tags::new()),
            value: MetricValue::Counter(value),
            sample_rate: 1.0,
        }
    }

    fn start(config: &AggregatorConfig) -> (Addr<Aggregator>, mpsc::Sender<WorkerBatch>) {
        let (mut queues, mut receivers) = worker_queues(1, 16);
        let service = AggregatorService::new(0, config, receivers.remove(0));
        (service.start_detached(), queues.remove(0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_after_batches() {
        tally_test::setup();
        let (addr, queue) = start(&AggregatorConfig::default());

        queue
            .send(WorkerBatch {
                metrics: vec![counter("foo.bar", 1.0), counter("foo.bar", 1.0)],
                events: vec![Event::new("deploy", "done")],
            })
            .await
            .unwrap();

        let flushed = addr.send(FlushShard { drain: true }).await.unwrap();
        assert_eq!(flushed.identities, 1);
        assert_eq!(flushed.snapshot.counters.len(), 1);
        assert_eq!(flushed.snapshot.counters[0].delta, 2.0);
        assert_eq!(flushed.snapshot.events.len(), 1);

        let flushed = addr.send(FlushShard::default()).await.unwrap();
        assert_eq!(flushed.snapshot.counters[0].delta, 0.0);
        assert_eq!(flushed.snapshot.counters[0].total, 2.0);
        assert!(flushed.snapshot.events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_on_final_flush() {
        tally_test::setup();
        let (addr, queue) = start(&AggregatorConfig::default());

        // Queue both batches before the worker had a chance to run.
        for _ in 0..2 {
            queue
                .try_send(WorkerBatch {
                    metrics: vec![counter("foo", 3.0)],
                    events: vec![],
                })
                .unwrap();
        }

        let flushed = addr.send(FlushShard { drain: true }).await.unwrap();
        assert_eq!(flushed.snapshot.counters[0].delta, 6.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_scan_removes_idle() {
        tally_test::setup();
        let config = AggregatorConfig {
            expiry_interval: 10,
            expiry_check_interval_ms: Some(1000),
            expiry_scan_chunk: 1,
            ..Default::default()
        };
        let (addr, queue) = start(&config);

        queue
            .send(WorkerBatch {
                metrics: vec![counter("a", 1.0), counter("b", 1.0), counter("c", 1.0)],
                events: vec![],
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        queue
            .send(WorkerBatch {
                metrics: vec![counter("b", 1.0)],
                events: vec![],
            })
            .await
            .unwrap();

        // `a` and `c` were last seen 12s ago, `b` 7s ago. Expiry scans run every second.
        tokio::time::sleep(Duration::from_secs(7)).await;

        let flushed = addr.send(FlushShard::default()).await.unwrap();
        assert_eq!(flushed.snapshot.expired, 0);
        assert_eq!(flushed.identities, 1);
        assert_eq!(flushed.snapshot.counters[0].name, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_addr_dropped() {
        tally_test::setup();
        let (mut queues, mut receivers) = worker_queues(1, 1);
        let service = AggregatorService::new(0, &AggregatorConfig::default(), receivers.remove(0));
        let (addr, handle) = service.start_joinable();

        drop(addr);
        handle.await.unwrap();
        assert!(queues.remove(0).is_closed());
    }
}
