//! The periodic flush of aggregated metrics to the backends.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tally_config::Config;
use tally_metrics::MetricBatch;
use tally_statsd::metric;
use tally_system::{
    Addr, AsyncResponse, FromMessage, Interface, Receiver, Request, Sender, Service,
};
use tokio::time::{Instant, MissedTickBehavior};

use crate::services::aggregator::{Aggregator, FlushShard, FlushedShard};
use crate::services::backend::Backend;
use crate::services::dispatcher::Dispatcher;
use crate::services::stats::PipelineStats;
use crate::statsd::{TallyCounters, TallyGauges, TallyTimers};

/// Requests an immediate flush outside of the regular interval.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlushNow {
    /// Performs the final flush.
    ///
    /// Workers fold all queued batches first, and the response is sent only after every backend
    /// has finished with the batch.
    pub drain: bool,
}

/// The interface of the [`FlushService`].
#[derive(Debug)]
pub enum Flush {
    /// Flushes all workers and responds with the batch handed to the backends.
    Now(FlushNow, Sender<Arc<MetricBatch>>),
}

impl Interface for Flush {}

impl FromMessage<FlushNow> for Flush {
    type Response = AsyncResponse<Arc<MetricBatch>>;

    fn from_message(message: FlushNow, sender: Sender<Arc<MetricBatch>>) -> Self {
        Self::Now(message, sender)
    }
}

/// Periodically collects snapshots from all aggregation workers and submits them to backends.
///
/// Every flush interval, each worker is asked for a snapshot and has `flush_timeout` to answer.
/// Workers that miss the deadline are skipped for the cycle. Their request stays outstanding and
/// the late snapshot is merged into the batch of the next cycle. The merged batch is submitted to
/// all backends concurrently, each bounded by the backend timeout, and the next cycle does not
/// wait for slow backends.
pub struct FlushService {
    workers: Vec<Addr<Aggregator>>,
    outstanding: Vec<VecDeque<Request<FlushedShard>>>,
    backends: Vec<Arc<dyn Backend>>,
    dispatcher: Dispatcher,
    stats: Arc<PipelineStats>,
    interval: Duration,
    worker_timeout: Duration,
    backend_timeout: Duration,
    percentiles: Vec<f64>,
    heartbeat: bool,
    pending: FuturesUnordered<BoxFuture<'static, ()>>,
}

impl FlushService {
    /// Creates the service for the given workers and backends.
    pub fn new(
        config: &Config,
        workers: Vec<Addr<Aggregator>>,
        backends: Vec<Arc<dyn Backend>>,
        dispatcher: Dispatcher,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let aggregator = config.aggregator();

        Self {
            outstanding: workers.iter().map(|_| VecDeque::new()).collect(),
            workers,
            backends,
            dispatcher,
            stats,
            interval: aggregator.flush_interval(),
            worker_timeout: aggregator.flush_timeout(),
            backend_timeout: config.backend_timeout(),
            percentiles: aggregator.percentiles.clone(),
            heartbeat: config.heartbeat_enabled(),
            pending: FuturesUnordered::new(),
        }
    }

    async fn flush(&mut self, drain: bool) -> Arc<MetricBatch> {
        let start = Instant::now();
        let deadline = start + self.worker_timeout;

        for (addr, requests) in self.workers.iter().zip(&mut self.outstanding) {
            requests.push_back(addr.send(FlushShard { drain }));
        }

        let replies = futures::future::join_all(
            self.outstanding
                .iter_mut()
                .map(|requests| collect_replies(requests, deadline)),
        )
        .await;
        metric!(timer(TallyTimers::FlushSnapshots) = start.elapsed());

        let mut identities = 0;
        let mut snapshots = Vec::with_capacity(replies.len());

        for (worker, (flushed, status)) in replies.into_iter().enumerate() {
            match status {
                ReplyStatus::Complete => (),
                ReplyStatus::Closed => {
                    tally_log::error!(worker, "aggregation worker is not running");
                }
                ReplyStatus::Late => {
                    tally_log::warn!(worker, "aggregation worker did not respond to flush in time");
                    metric!(
                        counter(TallyCounters::FlushTimeout) += 1,
                        worker = &worker.to_string()
                    );
                }
            }

            if let Some(flushed) = flushed {
                identities += flushed.identities;
                snapshots.push(flushed.snapshot);
            }
        }

        let batch = Arc::new(MetricBatch::from_snapshots(
            snapshots,
            &self.percentiles,
            self.interval,
            unix_timestamp(),
        ));

        self.submit(&batch);
        self.emit_stats(identities);

        metric!(timer(TallyTimers::FlushDuration) = start.elapsed());
        tally_log::trace!(
            metrics = batch.len(),
            events = batch.events.len(),
            "flushed aggregated metrics"
        );

        batch
    }

    fn submit(&mut self, batch: &Arc<MetricBatch>) {
        for backend in &self.backends {
            let name = backend.name();
            let send = backend.send(batch.clone());
            let timeout = self.backend_timeout;

            let future = async move {
                let start = Instant::now();
                let result = match tokio::time::timeout(timeout, send).await {
                    Ok(Ok(())) => "success",
                    Ok(Err(error)) => {
                        tally_log::error!(
                            error = &error as &dyn std::error::Error,
                            tags.backend = name,
                            "failed to send metrics to backend"
                        );
                        "error"
                    }
                    Err(_) => {
                        tally_log::error!(tags.backend = name, "timed out sending metrics to backend");
                        "timeout"
                    }
                };

                metric!(
                    timer(TallyTimers::BackendSendDuration) = start.elapsed(),
                    backend = name
                );
                metric!(
                    counter(TallyCounters::BackendSend) += 1,
                    backend = name,
                    result = result
                );
            };

            self.pending.push(future.boxed());
        }
    }

    fn emit_stats(&self, identities: usize) {
        self.stats.emit();

        for (worker, depth) in self.dispatcher.queue_depths().enumerate() {
            metric!(
                gauge(TallyGauges::QueueDepth) = depth as u64,
                worker = &worker.to_string()
            );
        }

        metric!(gauge(TallyGauges::AggregatedIdentities) = identities as u64);

        if self.heartbeat {
            metric!(
                gauge(TallyGauges::Heartbeat) = 1u64,
                version = env!("CARGO_PKG_VERSION")
            );
        }
    }

    async fn handle_message(&mut self, message: Flush) {
        match message {
            Flush::Now(FlushNow { drain }, sender) => {
                let batch = self.flush(drain).await;
                if drain {
                    self.finish_pending().await;
                }
                sender.send(batch);
            }
        }
    }

    async fn finish_pending(&mut self) {
        while self.pending.next().await.is_some() {}
    }
}

impl Service for FlushService {
    type Interface = Flush;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                Some(()) = self.pending.next() => (),
                message = rx.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    self.flush(false).await;
                }
            }
        }

        self.finish_pending().await;
        tally_log::debug!("flush service stopped");
    }
}

/// Outcome of waiting for a worker's flush replies.
enum ReplyStatus {
    /// All outstanding requests were answered.
    Complete,
    /// The deadline passed. The remaining requests are kept for the next cycle.
    Late,
    /// The worker dropped a request without answering.
    Closed,
}

/// Awaits the outstanding requests of one worker in order until `deadline`.
///
/// Answered requests are removed and their snapshots merged into one. A worker answers
/// requests in the order they were sent, so a late reply of an earlier cycle always comes first.
async fn collect_replies(
    requests: &mut VecDeque<Request<FlushedShard>>,
    deadline: Instant,
) -> (Option<FlushedShard>, ReplyStatus) {
    let mut merged: Option<FlushedShard> = None;

    while let Some(request) = requests.front_mut() {
        let reply = tokio::time::timeout_at(deadline, request).await;
        let flushed = match reply {
            Ok(Ok(flushed)) => flushed,
            Ok(Err(_)) => {
                requests.clear();
                return (merged, ReplyStatus::Closed);
            }
            Err(_) => return (merged, ReplyStatus::Late),
        };

        requests.pop_front();
        merged = Some(match merged {
            Some(mut previous) => {
                previous.snapshot.merge(flushed.snapshot);
                previous.identities = flushed.identities;
                previous
            }
            None => flushed,
        });
    }

    (merged, ReplyStatus::Complete)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use similar_asserts::assert_eq;
    use tally_metrics::{Metric, MetricValue, Snapshot, SnapshotCounter};

    use super::*;
    use crate::services::aggregator::{AggregatorService, FlushedShard};
    use crate::services::backend::BackendError;
    use crate::services::dispatcher::worker_queues;

    #[derive(Debug, Default)]
    struct CapturingBackend {
        batches: Mutex<Vec<Arc<MetricBatch>>>,
    }

    impl Backend for CapturingBackend {
        fn name(&self) -> &'static str {
            "capture"
        }

        fn send(&self, batch: Arc<MetricBatch>) -> BoxFuture<'static, Result<(), BackendError>> {
            self.batches.lock().push(batch);
            futures::future::ready(Ok(())).boxed()
        }
    }

    /// A backend that never finishes sending.
    #[derive(Debug)]
    struct StuckBackend;

    impl Backend for StuckBackend {
        fn name(&self) -> &'static str {
            "stuck"
        }

        fn send(&self, _batch: Arc<MetricBatch>) -> BoxFuture<'static, Result<(), BackendError>> {
            futures::future::pending().boxed()
        }
    }

    fn config() -> Config {
        Config::from_json_value(serde_json::json!({
            "aggregator": {
                "flush_interval_ms": 1000,
                "flush_timeout_ms": 100,
                "percentiles": [90.0],
            },
            "limits": { "backend_timeout_ms": 500 },
            "internal": { "heartbeat_enabled": true },
        }))
        .unwrap()
    }

    fn counter(name: &str, value: f64) -> Metric {
        Metric {
            name: name.to_owned(),
            value: MetricValue::Counter(value),
            sample_rate: 1.0,
            tags: Default::default(),
            source: None,
        }
    }

    struct Setup {
        flush: Addr<Flush>,
        dispatcher: Dispatcher,
        stats: Arc<PipelineStats>,
    }

    fn setup(config: &Config, backends: Vec<Arc<dyn Backend>>) -> Setup {
        let stats = Arc::new(PipelineStats::default());
        let (queues, receivers) = worker_queues(2, 100);
        let workers = receivers
            .into_iter()
            .enumerate()
            .map(|(worker, queue)| {
                AggregatorService::new(worker, config.aggregator(), queue).start_detached()
            })
            .collect();

        let dispatcher = Dispatcher::new(queues, None, stats.clone());
        let service = FlushService::new(config, workers, backends, dispatcher.clone(), stats.clone());

        Setup {
            flush: service.start_detached(),
            dispatcher,
            stats,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush() {
        tally_test::setup();
        let backend = Arc::new(CapturingBackend::default());
        let setup = setup(&config(), vec![backend.clone()]);

        setup.dispatcher.dispatch(
            vec![counter("foo.bar", 1.0), counter("foo.bar", 1.0), counter("baz", 3.0)],
            vec![],
        );

        let batch = setup.flush.send(FlushNow { drain: true }).await.unwrap();
        let counters: Vec<_> = batch
            .counters
            .iter()
            .map(|counter| (counter.name.as_str(), counter.delta))
            .collect();
        assert_eq!(counters, vec![("baz", 3.0), ("foo.bar", 2.0)]);

        let sent = backend.batches.lock();
        assert_eq!(sent.len(), 1);
        assert!(Arc::ptr_eq(&sent[0], &batch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_interval() {
        tally_test::setup();
        let backend = Arc::new(CapturingBackend::default());
        let setup = setup(&config(), vec![backend.clone()]);

        setup.dispatcher.dispatch(vec![counter("foo", 1.0)], vec![]);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        {
            let sent = backend.batches.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].counters[0].delta, 1.0);
        }

        // The counter persists at zero until it expires.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let sent = backend.batches.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].counters[0].delta, 0.0);
        assert_eq!(sent[1].counters[0].total, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_worker_skipped() {
        tally_test::setup();
        let config = config();
        let stats = Arc::new(PipelineStats::default());
        let (queues, mut receivers) = worker_queues(2, 100);

        let healthy =
            AggregatorService::new(0, config.aggregator(), receivers.remove(0)).start_detached();
        // Holds on to the response senders without ever answering.
        let (stuck, _handle) = tally_test::mock_service(
            "stuck_worker",
            Vec::<Sender<FlushedShard>>::new(),
            |senders, message: Aggregator| {
                let Aggregator::Flush(_, sender) = message;
                senders.push(sender);
            },
        );

        let dispatcher = Dispatcher::new(queues, None, stats.clone());
        let service = FlushService::new(
            &config,
            vec![healthy, stuck],
            vec![],
            dispatcher.clone(),
            stats,
        );
        let flush = service.start_detached();

        dispatcher.dispatch(
            (0..20).map(|i| counter(&format!("metric.{i}"), 1.0)).collect(),
            vec![],
        );

        let start = Instant::now();
        let batch = flush.send(FlushNow::default()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(!batch.counters.is_empty());
        assert!(batch.counters.len() < 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_snapshot_in_next_flush() {
        tally_test::setup();
        let config = config();
        let stats = Arc::new(PipelineStats::default());
        let (queues, _receivers) = worker_queues(1, 100);

        // Answers the first flush only when the second one arrives.
        let (slow, _handle) = tally_test::mock_service(
            "slow_worker",
            None::<Sender<FlushedShard>>,
            |held, message: Aggregator| {
                let Aggregator::Flush(_, sender) = message;
                match held.take() {
                    None => *held = Some(sender),
                    Some(late) => {
                        late.send(FlushedShard {
                            snapshot: Snapshot {
                                counters: vec![SnapshotCounter {
                                    name: "tracked".to_owned(),
                                    tags: Default::default(),
                                    delta: 1.0,
                                    total: 1.0,
                                }],
                                ..Default::default()
                            },
                            identities: 1,
                        });
                        sender.send(FlushedShard::default());
                    }
                }
            },
        );

        let dispatcher = Dispatcher::new(queues, None, stats.clone());
        let service = FlushService::new(&config, vec![slow], vec![], dispatcher, stats);
        let flush = service.start_detached();

        let first = flush.send(FlushNow::default()).await.unwrap();
        assert!(first.counters.is_empty());

        let second = flush.send(FlushNow::default()).await.unwrap();
        assert_eq!(second.counters.len(), 1);
        assert_eq!(second.counters[0].name, "tracked");
        assert_eq!(second.counters[0].delta, 1.0);
        assert_eq!(second.counters[0].total, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_does_not_block() {
        tally_test::setup();
        let backend = Arc::new(CapturingBackend::default());
        let setup = setup(&config(), vec![Arc::new(StuckBackend), backend.clone()]);

        setup.dispatcher.dispatch(vec![counter("foo", 1.0)], vec![]);
        setup.flush.send(FlushNow::default()).await.unwrap();
        setup.flush.send(FlushNow::default()).await.unwrap();
        assert_eq!(backend.batches.lock().len(), 2);

        // The final flush waits for the stuck backend until its timeout.
        let start = Instant::now();
        setup.flush.send(FlushNow { drain: true }).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(backend.batches.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_pipeline_stats() {
        tally_test::setup();
        let setup = setup(&config(), vec![]);
        setup.stats.bad_line("missing_value");

        let batch = setup.flush.send(FlushNow::default()).await.unwrap();
        assert!(batch.is_empty());
        // Taken by the flush.
        assert_eq!(setup.stats.take().total_bad_lines(), 0);
    }
}
