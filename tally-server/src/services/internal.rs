//! Aggregation of the daemon's own metrics.
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use tally_metrics::{Parser, ParserConfig, Record};
use tally_statsd::metric;

use crate::services::dispatcher::Dispatcher;
use crate::services::stats::PipelineStats;
use crate::statsd::TallyCounters;

/// Feeds the daemon's own metrics into the aggregation pipeline.
///
/// The internal statsd client renders every metric into a channel. This service drains the
/// channel on a dedicated thread, parses the packets and dispatches them like received metrics.
/// Internal metrics bypass the receiver, so they are not included in the pipeline counters.
/// Internal metrics dropped on full worker queues are reported as `internal.metrics_dropped`.
pub struct InternalMetricsService {
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    parser: Parser,
    dispatcher: Dispatcher,
    stats: Arc<PipelineStats>,
}

impl InternalMetricsService {
    /// Creates the service for the receiving end of the statsd channel sink.
    pub fn new(rx: crossbeam_channel::Receiver<Vec<u8>>, dispatcher: Dispatcher) -> Self {
        // Internal metrics carry the host in their default tags already.
        let parser = Parser::new(&ParserConfig {
            ignore_host: true,
            ..Default::default()
        });

        let stats = Arc::new(PipelineStats::default());

        Self {
            rx,
            parser,
            dispatcher: dispatcher.with_stats(stats.clone()),
            stats,
        }
    }

    /// Spawns the drain thread.
    ///
    /// The thread stops when all senders of the channel have been dropped.
    pub fn start(self) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("internal-metrics".to_owned())
            .spawn(move || self.run())
    }

    fn run(self) {
        for packet in &self.rx {
            self.handle_packet(&packet);
        }

        tally_log::debug!("internal metrics drain stopped");
    }

    fn handle_packet(&self, packet: &[u8]) {
        let mut metrics = Vec::new();
        let mut events = Vec::new();

        for result in self.parser.parse_all(packet, None) {
            match result {
                Ok(Record::Metric(metric)) => metrics.push(metric),
                Ok(Record::Event(event)) => events.push(event),
                Err(error) => tally_log::debug!(
                    error = &error as &dyn std::error::Error,
                    "failed to parse internal metric"
                ),
            }
        }

        self.dispatcher.dispatch(metrics, events);

        let dropped = self.stats.metrics_dropped.swap(0, Ordering::Relaxed)
            + self.stats.events_dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            metric!(counter(TallyCounters::InternalMetricsDropped) += dropped as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tally_metrics::MetricValue;

    use super::*;
    use crate::services::dispatcher::worker_queues;
    use crate::services::stats::PipelineStats;

    #[test]
    fn test_drain_until_disconnected() {
        tally_test::setup();
        let stats = Arc::new(PipelineStats::default());
        let (queues, mut receivers) = worker_queues(1, 10);
        let dispatcher = Dispatcher::new(queues, None, stats.clone());

        let (tx, rx) = crossbeam_channel::bounded(10);
        let handle = InternalMetricsService::new(rx, dispatcher).start().unwrap();

        tx.send(b"statsd.parser.metrics:3|c|#host:a".to_vec()).unwrap();
        tx.send(b"statsd.heartbeat:1|g".to_vec()).unwrap();
        drop(tx);
        handle.join().unwrap();

        let first = receivers[0].try_recv().unwrap();
        assert_eq!(first.metrics[0].key.name(), "statsd.parser.metrics");
        assert_eq!(first.metrics[0].key.tags().len(), 1);

        let second = receivers[0].try_recv().unwrap();
        assert_eq!(second.metrics[0].value, MetricValue::Gauge(1.0));

        // Internal metrics do not count as received traffic.
        assert_eq!(stats.take().metrics_parsed, 0);
    }

    #[test]
    fn test_drops_counted_separately() {
        tally_test::setup();
        let stats = Arc::new(PipelineStats::default());
        let (queues, _receivers) = worker_queues(1, 1);
        let dispatcher = Dispatcher::new(queues, None, stats.clone());

        let (_tx, rx) = crossbeam_channel::bounded(10);
        let service = InternalMetricsService::new(rx, dispatcher);

        let captures = tally_statsd::with_capturing_test_client(|| {
            service.handle_packet(b"statsd.a:1|c");
            service.handle_packet(b"statsd.b:1|c\nstatsd.c:1|c");
        });

        assert_eq!(captures, vec!["internal.metrics_dropped:2|c".to_owned()]);
        assert_eq!(stats.take().metrics_dropped, 0);
    }
}
