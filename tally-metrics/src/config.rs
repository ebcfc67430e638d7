use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::MetricType;

/// An error returned by [`AggregatorConfig::validate`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum AggregatorConfigError {
    /// A percentile threshold is zero, not finite or outside of `[-100, 100]`.
    #[error("invalid percentile threshold {0}")]
    InvalidPercentile(f64),
    /// The number of workers is zero.
    #[error("at least one aggregation worker is required")]
    NoWorkers,
    /// The flush interval is zero.
    #[error("flush interval must not be zero")]
    ZeroFlushInterval,
}

/// Parameters of the aggregation workers and the flush cycle.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Number of aggregation workers, each owning one shard of the metric state.
    ///
    /// Defaults to the number of CPUs.
    pub max_workers: usize,

    /// Capacity of each worker's ingestion queue, counted in batches.
    ///
    /// When a queue is full, new batches for that worker are dropped. Defaults to `10000`.
    pub max_queue_size: usize,

    /// Maximum number of events buffered per worker in one flush window.
    ///
    /// Defaults to `1024`.
    pub max_pending_events: usize,

    /// Interval between two flushes in milliseconds.
    ///
    /// Defaults to `1000`.
    pub flush_interval_ms: u64,

    /// Maximum time to wait for a single worker to respond to a flush in milliseconds.
    ///
    /// Defaults to `1000`.
    pub flush_timeout_ms: u64,

    /// Percentile thresholds computed for timers.
    ///
    /// Positive values produce upper percentiles (`upper_90`), negative values lower
    /// percentiles (`lower_10`). Defaults to `[90]`.
    pub percentiles: Vec<f64>,

    /// Time in seconds after which an idle metric is removed.
    ///
    /// Zero means that metrics do not persist past a flush. Defaults to 5 minutes.
    pub expiry_interval: u64,

    /// Overrides [`expiry_interval`](Self::expiry_interval) for counters.
    pub expiry_interval_counter: Option<u64>,

    /// Overrides [`expiry_interval`](Self::expiry_interval) for gauges.
    pub expiry_interval_gauge: Option<u64>,

    /// Overrides [`expiry_interval`](Self::expiry_interval) for sets.
    pub expiry_interval_set: Option<u64>,

    /// Overrides [`expiry_interval`](Self::expiry_interval) for timers.
    pub expiry_interval_timer: Option<u64>,

    /// Interval between expiry scans in milliseconds.
    ///
    /// Defaults to the flush interval. The effective interval never exceeds the smallest non-zero
    /// expiry interval.
    pub expiry_check_interval_ms: Option<u64>,

    /// Number of entries inspected per expiry step before yielding to other work.
    ///
    /// Defaults to `1000`.
    pub expiry_scan_chunk: usize,

    /// Timer sub-metrics left out when rendering flushed timers.
    pub disabled_sub_metrics: DisabledSubMetrics,
}

/// Switches to leave out individual sub-metrics of flushed timers.
///
/// The `*_pct` switches apply to the values computed per percentile threshold, such as
/// `count_90` or `mean_lower_10`. All sub-metrics are enabled by default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DisabledSubMetrics {
    /// Smallest sample (`lower`).
    pub lower: bool,
    /// Bound of lower percentiles (`lower_10`).
    pub lower_pct: bool,
    /// Largest sample (`upper`).
    pub upper: bool,
    /// Bound of upper percentiles (`upper_90`).
    pub upper_pct: bool,
    /// Number of samples (`count`).
    pub count: bool,
    /// Number of samples inside a percentile (`count_90`).
    pub count_pct: bool,
    /// Sampled count per second (`count_ps`).
    pub count_per_second: bool,
    /// Mean of all samples (`mean`).
    pub mean: bool,
    /// Mean inside a percentile (`mean_90`).
    pub mean_pct: bool,
    /// Median of all samples (`median`).
    pub median: bool,
    /// Standard deviation (`std`).
    pub std: bool,
    /// Sum of all samples (`sum`).
    pub sum: bool,
    /// Sum inside a percentile (`sum_90`).
    pub sum_pct: bool,
    /// Sum of squares of all samples (`sum_squares`).
    pub sum_squares: bool,
    /// Sum of squares inside a percentile (`sum_squares_90`).
    pub sum_squares_pct: bool,
}

impl AggregatorConfig {
    /// Returns the flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Returns the per-worker flush timeout.
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Returns the expiry interval that applies to the given metric type.
    pub fn expiry_interval(&self, ty: MetricType) -> Duration {
        let secs = match ty {
            MetricType::Counter => self.expiry_interval_counter,
            MetricType::Gauge => self.expiry_interval_gauge,
            MetricType::Set => self.expiry_interval_set,
            MetricType::Timer => self.expiry_interval_timer,
        };

        Duration::from_secs(secs.unwrap_or(self.expiry_interval))
    }

    /// Returns the effective interval between expiry scans.
    pub fn expiry_check_interval(&self) -> Duration {
        let configured = self
            .expiry_check_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.flush_interval());

        let smallest = [
            MetricType::Counter,
            MetricType::Gauge,
            MetricType::Set,
            MetricType::Timer,
        ]
        .into_iter()
        .map(|ty| self.expiry_interval(ty))
        .filter(|interval| !interval.is_zero())
        .min();

        let interval = match smallest {
            Some(smallest) => configured.min(smallest),
            None => configured,
        };

        interval.max(Duration::from_millis(1))
    }

    /// Checks the configuration for values that cannot be used.
    pub fn validate(&self) -> Result<(), AggregatorConfigError> {
        if self.max_workers == 0 {
            return Err(AggregatorConfigError::NoWorkers);
        }

        if self.flush_interval_ms == 0 {
            return Err(AggregatorConfigError::ZeroFlushInterval);
        }

        for &percentile in &self.percentiles {
            if !percentile.is_finite() || percentile == 0.0 || percentile.abs() > 100.0 {
                return Err(AggregatorConfigError::InvalidPercentile(percentile));
            }
        }

        Ok(())
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get(),
            max_queue_size: 10_000,
            max_pending_events: 1024,
            flush_interval_ms: 1000,
            flush_timeout_ms: 1000,
            percentiles: vec![90.0],
            expiry_interval: 5 * 60, // 5 minutes
            expiry_interval_counter: None,
            expiry_interval_gauge: None,
            expiry_interval_set: None,
            expiry_interval_timer: None,
            expiry_check_interval_ms: None,
            expiry_scan_chunk: 1000,
            disabled_sub_metrics: DisabledSubMetrics::default(),
        }
    }
}

/// Parameters of the statsd line parser.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Prefix prepended to every metric name, separated by a dot.
    pub namespace: Option<String>,

    /// Tags added to every metric and event.
    pub default_tags: Vec<String>,

    /// Disables adding a `host:<source>` tag to metrics.
    pub ignore_host: bool,

    /// Maximum number of malformed lines logged per minute. Zero disables logging.
    ///
    /// Malformed lines are always counted, regardless of this limit.
    pub bad_lines_per_minute: u32,

    /// Logs every parsed metric at info level.
    pub log_raw_metric: bool,

    /// Expected number of tags per metric, used to size allocations.
    pub estimated_tags: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            default_tags: Vec::new(),
            ignore_host: false,
            bad_lines_per_minute: 0,
            log_raw_metric: false,
            estimated_tags: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_override() {
        let config = AggregatorConfig {
            expiry_interval: 60,
            expiry_interval_gauge: Some(0),
            ..Default::default()
        };

        assert_eq!(config.expiry_interval(MetricType::Counter), Duration::from_secs(60));
        assert_eq!(config.expiry_interval(MetricType::Gauge), Duration::ZERO);
    }

    #[test]
    fn test_check_interval_clamped() {
        let config = AggregatorConfig {
            flush_interval_ms: 10_000,
            expiry_interval: 300,
            expiry_interval_timer: Some(2),
            ..Default::default()
        };

        assert_eq!(config.expiry_check_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_check_interval_all_zero() {
        let config = AggregatorConfig {
            flush_interval_ms: 500,
            expiry_interval: 0,
            ..Default::default()
        };

        assert_eq!(config.expiry_check_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_disabled_sub_metrics() {
        let config: AggregatorConfig = serde_json::from_value(serde_json::json!({
            "disabled_sub_metrics": { "count_per_second": true, "sum_squares_pct": true },
        }))
        .unwrap();

        let disabled = config.disabled_sub_metrics;
        assert!(disabled.count_per_second);
        assert!(disabled.sum_squares_pct);
        assert!(!disabled.upper);
    }

    #[test]
    fn test_validate_percentiles() {
        let mut config = AggregatorConfig::default();
        assert_eq!(config.validate(), Ok(()));

        for invalid in [0.0, 101.0, -100.5, f64::NAN, f64::INFINITY] {
            config.percentiles = vec![invalid];
            assert!(config.validate().is_err(), "{invalid} must be rejected");
        }

        config.percentiles = vec![-10.0, 99.9, 100.0];
        assert_eq!(config.validate(), Ok(()));
    }
}
