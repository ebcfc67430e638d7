use tally_statsd::{CounterMetric, TimerMetric};

/// Counter metrics for the aggregation shards.
pub enum MetricCounters {
    /// Incremented for every value that could not be folded into an existing aggregate.
    ///
    /// Tagged by `kind`, the metric type of the aggregate.
    MergeFailed,

    /// Incremented for every event dropped because the shard's event buffer was full.
    EventsDropped,

    /// Incremented for every identity removed because it was idle for longer than its expiry
    /// interval.
    ///
    /// Tagged by `kind`, the metric type.
    Expired,
}

impl CounterMetric for MetricCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::MergeFailed => "aggregator.merge_failed",
            Self::EventsDropped => "aggregator.events_dropped",
            Self::Expired => "aggregator.expired",
        }
    }
}

/// Timer metrics for the aggregation shards.
pub enum MetricTimers {
    /// Time in milliseconds spent merging shard snapshots and computing timer summaries.
    BatchMerge,

    /// Time in milliseconds spent producing a snapshot of one shard.
    Snapshot,
}

impl TimerMetric for MetricTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::BatchMerge => "aggregator.batch_merge",
            Self::Snapshot => "aggregator.snapshot",
        }
    }
}
