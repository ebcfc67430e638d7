use tally_statsd::{CounterMetric, GaugeMetric, TimerMetric};

/// Gauge metrics used by the Tally server.
pub enum TallyGauges {
    /// Number of batches waiting in a worker's ingestion queue at flush time.
    ///
    /// This metric is tagged with:
    /// - `worker`: the index of the aggregation worker.
    QueueDepth,
    /// Number of identities held by all aggregation workers after a flush.
    AggregatedIdentities,
    /// Number of hosts in the cloud metadata cache.
    CloudCacheSize,
    /// Number of cloud lookups currently in flight.
    CloudLookupsInFlight,
    /// Emitted once per flush with the value `1` when the heartbeat is enabled.
    ///
    /// This metric is tagged with:
    /// - `version`: the version of the daemon.
    Heartbeat,
}

impl GaugeMetric for TallyGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::QueueDepth => "dispatcher.queue_depth",
            Self::AggregatedIdentities => "aggregator.identities",
            Self::CloudCacheSize => "cloud.cache_size",
            Self::CloudLookupsInFlight => "cloud.lookups_in_flight",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Counter metrics used by the Tally server.
///
/// Pipeline counters are accumulated in memory and emitted once per flush, so their values are
/// the totals of one flush window.
pub enum TallyCounters {
    /// Number of datagrams or TCP lines read.
    PacketsReceived,
    /// Number of bytes read from the network.
    BytesReceived,
    /// Number of non-empty lines handed to the parser.
    LinesReceived,
    /// Number of metrics parsed successfully.
    MetricsParsed,
    /// Number of events parsed successfully.
    EventsParsed,
    /// Number of lines that failed to parse.
    ///
    /// This metric is tagged with:
    /// - `kind`: the kind of parse error.
    BadLines,
    /// Number of failed socket reads.
    ReadErrors,
    /// Number of datagrams or lines dropped because they exceeded the size limit.
    Truncated,
    /// Number of metrics dropped because a worker's ingestion queue was full.
    MetricsDropped,
    /// Number of events dropped because a worker's ingestion queue was full.
    EventsDropped,
    /// Number of metrics whose source was found in the cloud cache.
    CloudCacheHit,
    /// Number of metrics whose source was not in the cloud cache.
    CloudCacheMiss,
    /// Number of lookups that could not be queued because the lookup queue was full.
    CloudLookupsDropped,
    /// Number of finished cloud lookups.
    ///
    /// This metric is tagged with:
    /// - `result`: `found`, `not_found`, `error` or `timeout`.
    CloudLookup,
    /// Number of the daemon's own metrics and events dropped because a worker's queue was full.
    ///
    /// These drops are not included in `dispatcher.metrics_dropped`.
    InternalMetricsDropped,
    /// Number of workers that did not answer a flush request in time.
    FlushTimeout,
    /// Number of batches submitted to backends.
    ///
    /// This metric is tagged with:
    /// - `backend`: the name of the backend.
    /// - `result`: `success`, `error` or `timeout`.
    BackendSend,
}

impl CounterMetric for TallyCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::PacketsReceived => "receiver.packets",
            Self::BytesReceived => "receiver.bytes",
            Self::LinesReceived => "parser.lines",
            Self::MetricsParsed => "parser.metrics",
            Self::EventsParsed => "parser.events",
            Self::BadLines => "parser.bad_lines",
            Self::ReadErrors => "receiver.read_errors",
            Self::Truncated => "receiver.truncated",
            Self::MetricsDropped => "dispatcher.metrics_dropped",
            Self::EventsDropped => "dispatcher.events_dropped",
            Self::CloudCacheHit => "cloud.cache_hit",
            Self::CloudCacheMiss => "cloud.cache_miss",
            Self::CloudLookupsDropped => "cloud.lookups_dropped",
            Self::CloudLookup => "cloud.lookup",
            Self::InternalMetricsDropped => "internal.metrics_dropped",
            Self::FlushTimeout => "flush.worker_timeout",
            Self::BackendSend => "backend.send",
        }
    }
}

/// Timer metrics used by the Tally server.
pub enum TallyTimers {
    /// Time from the flush tick until all workers answered or timed out.
    FlushSnapshots,
    /// Total time of one flush cycle, until the batch is handed to all backends.
    FlushDuration,
    /// Time a backend took to accept a batch.
    ///
    /// This metric is tagged with:
    /// - `backend`: the name of the backend.
    BackendSendDuration,
    /// Duration of a single cloud metadata lookup.
    CloudLookupDuration,
}

impl TimerMetric for TallyTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::FlushSnapshots => "flush.snapshots",
            Self::FlushDuration => "flush.duration",
            Self::BackendSendDuration => "backend.send_duration",
            Self::CloudLookupDuration => "cloud.lookup_duration",
        }
    }
}
