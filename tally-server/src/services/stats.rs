//! Counters of the ingestion pipeline.
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tally_statsd::metric;

use crate::statsd::TallyCounters;

/// Counters shared by the ingestion stages of the pipeline.
///
/// Hot paths only increment atomics. The flush service takes the accumulated values once per
/// flush window with [`PipelineStats::emit`] and reports them through the internal statser.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub(crate) packets_received: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) lines_received: AtomicU64,
    pub(crate) metrics_parsed: AtomicU64,
    pub(crate) events_parsed: AtomicU64,
    pub(crate) read_errors: AtomicU64,
    pub(crate) truncated: AtomicU64,
    pub(crate) metrics_dropped: AtomicU64,
    pub(crate) events_dropped: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    bad_lines: Mutex<HashMap<&'static str, u64>>,
}

/// Values of [`PipelineStats`] accumulated over one flush window.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Datagrams or TCP lines read.
    pub packets_received: u64,
    /// Bytes read from the network.
    pub bytes_received: u64,
    /// Non-empty lines handed to the parser.
    pub lines_received: u64,
    /// Metrics parsed successfully.
    pub metrics_parsed: u64,
    /// Events parsed successfully.
    pub events_parsed: u64,
    /// Failed socket reads.
    pub read_errors: u64,
    /// Datagrams or lines dropped for exceeding the size limit.
    pub truncated: u64,
    /// Metrics dropped on full worker queues.
    pub metrics_dropped: u64,
    /// Events dropped on full worker queues.
    pub events_dropped: u64,
    /// Cloud cache hits, including negative entries.
    pub cache_hits: u64,
    /// Cloud cache misses.
    pub cache_misses: u64,
    /// Bad lines per parse error kind, sorted by kind.
    pub bad_lines: Vec<(&'static str, u64)>,
}

impl StatsSnapshot {
    /// Total number of bad lines across all error kinds.
    pub fn total_bad_lines(&self) -> u64 {
        self.bad_lines.iter().map(|(_, count)| count).sum()
    }
}

pub(crate) fn incr(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

fn take(counter: &AtomicU64) -> u64 {
    counter.swap(0, Ordering::Relaxed)
}

impl PipelineStats {
    /// Counts a line that failed to parse.
    pub fn bad_line(&self, kind: &'static str) {
        *self.bad_lines.lock().entry(kind).or_default() += 1;
    }

    /// Returns the accumulated values and resets all counters to zero.
    pub fn take(&self) -> StatsSnapshot {
        let mut bad_lines: Vec<_> = self.bad_lines.lock().drain().collect();
        bad_lines.sort_unstable();

        StatsSnapshot {
            packets_received: take(&self.packets_received),
            bytes_received: take(&self.bytes_received),
            lines_received: take(&self.lines_received),
            metrics_parsed: take(&self.metrics_parsed),
            events_parsed: take(&self.events_parsed),
            read_errors: take(&self.read_errors),
            truncated: take(&self.truncated),
            metrics_dropped: take(&self.metrics_dropped),
            events_dropped: take(&self.events_dropped),
            cache_hits: take(&self.cache_hits),
            cache_misses: take(&self.cache_misses),
            bad_lines,
        }
    }

    /// Takes the accumulated values and emits them as internal metrics.
    pub fn emit(&self) -> StatsSnapshot {
        let stats = self.take();

        let counters = [
            (TallyCounters::PacketsReceived, stats.packets_received),
            (TallyCounters::BytesReceived, stats.bytes_received),
            (TallyCounters::LinesReceived, stats.lines_received),
            (TallyCounters::MetricsParsed, stats.metrics_parsed),
            (TallyCounters::EventsParsed, stats.events_parsed),
            (TallyCounters::ReadErrors, stats.read_errors),
            (TallyCounters::Truncated, stats.truncated),
            (TallyCounters::MetricsDropped, stats.metrics_dropped),
            (TallyCounters::EventsDropped, stats.events_dropped),
            (TallyCounters::CloudCacheHit, stats.cache_hits),
            (TallyCounters::CloudCacheMiss, stats.cache_misses),
        ];

        for (name, value) in counters {
            metric!(counter(name) += value as i64);
        }

        for &(kind, value) in &stats.bad_lines {
            metric!(counter(TallyCounters::BadLines) += value as i64, kind = kind);
        }

        stats
    }
}
