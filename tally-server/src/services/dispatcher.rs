//! Routing of parsed records to the aggregation workers.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tally_metrics::{Event, KeyedMetric, Metric, Tags};
use tokio::sync::mpsc;

use crate::services::cloud::{CacheStatus, CloudHandle};
use crate::services::stats::{PipelineStats, incr};

/// Records destined to a single aggregation worker.
#[derive(Debug, Default)]
pub struct WorkerBatch {
    /// Metrics with their identities computed.
    pub metrics: Vec<KeyedMetric>,
    /// Events to buffer until the next flush.
    pub events: Vec<Event>,
}

impl WorkerBatch {
    fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.events.is_empty()
    }
}

/// Creates the bounded ingestion queues, one per aggregation worker.
pub fn worker_queues(
    workers: usize,
    capacity: usize,
) -> (Vec<mpsc::Sender<WorkerBatch>>, Vec<mpsc::Receiver<WorkerBatch>>) {
    (0..workers).map(|_| mpsc::channel(capacity.max(1))).unzip()
}

/// Distributes parsed records to the aggregation workers.
///
/// Metrics are routed by the hash of their identity, so every identity is owned by exactly one
/// worker. Events carry no identity and are spread round-robin. Enqueueing never blocks: if a
/// worker's queue is full, the batch for that worker is dropped and counted.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    queues: Arc<[mpsc::Sender<WorkerBatch>]>,
    cloud: Option<CloudHandle>,
    stats: Arc<PipelineStats>,
    next_event_worker: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Creates a dispatcher for the given worker queues.
    pub fn new(
        queues: Vec<mpsc::Sender<WorkerBatch>>,
        cloud: Option<CloudHandle>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            queues: queues.into(),
            cloud,
            stats,
            next_event_worker: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns a dispatcher for the same workers that counts into separate stats.
    pub fn with_stats(&self, stats: Arc<PipelineStats>) -> Self {
        Self {
            stats,
            ..self.clone()
        }
    }

    /// Returns the number of aggregation workers.
    pub fn workers(&self) -> usize {
        self.queues.len()
    }

    /// Returns the number of batches waiting in each worker's queue.
    pub fn queue_depths(&self) -> impl Iterator<Item = usize> + '_ {
        self.queues
            .iter()
            .map(|queue| queue.max_capacity() - queue.capacity())
    }

    fn enrich(&self, source: Option<&str>, tags: &mut Tags) {
        let (Some(cloud), Some(source)) = (&self.cloud, source) else {
            return;
        };

        match cloud.apply(source, tags) {
            CacheStatus::Hit | CacheStatus::Negative => incr(&self.stats.cache_hits, 1),
            CacheStatus::Miss => incr(&self.stats.cache_misses, 1),
        }
    }

    /// Routes metrics and events of one parsed buffer to the workers.
    pub fn dispatch(&self, metrics: Vec<Metric>, events: Vec<Event>) {
        let workers = self.workers();
        if workers == 0 {
            return;
        }

        let mut batches: Vec<_> = (0..workers).map(|_| WorkerBatch::default()).collect();

        for mut metric in metrics {
            // Cloud tags are part of the identity, apply them before hashing.
            self.enrich(metric.source.as_deref(), &mut metric.tags);
            let keyed = metric.into_keyed();
            batches[keyed.key.shard(workers)].metrics.push(keyed);
        }

        for mut event in events {
            self.enrich(event.source.as_deref(), &mut event.tags);
            let worker = self.next_event_worker.fetch_add(1, Ordering::Relaxed) % workers;
            batches[worker].events.push(event);
        }

        for (queue, batch) in self.queues.iter().zip(batches) {
            if batch.is_empty() {
                continue;
            }

            if let Err(error) = queue.try_send(batch) {
                let batch = match error {
                    mpsc::error::TrySendError::Full(batch) => batch,
                    mpsc::error::TrySendError::Closed(batch) => batch,
                };
                incr(&self.stats.metrics_dropped, batch.metrics.len() as u64);
                incr(&self.stats.events_dropped, batch.events.len() as u64);
            }
        }
    }
}
