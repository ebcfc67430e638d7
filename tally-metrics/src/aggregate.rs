use std::time::Duration;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::protocol::{CounterType, GaugeType, MetricType, MetricValue, TimerType};

/// An error returned when a value cannot be folded into an aggregate.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum AggregateError {
    /// The value's type does not match the aggregate.
    #[error("cannot merge {value} value into {aggregate} aggregate")]
    TypeMismatch {
        /// The type of the existing aggregate.
        aggregate: MetricType,
        /// The type of the submitted value.
        value: MetricType,
    },
}

/// Aggregated state of a counter.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CounterValue {
    /// Sum of increments since the last flush, scaled by the inverse sample rate.
    pub value: CounterType,
    /// Sum of all flushed values since the counter was created.
    pub total: CounterType,
}

/// Aggregated state of a timer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimerValue {
    /// Samples observed since the last flush.
    pub values: Vec<TimerType>,
    /// Estimated number of samples taken by clients, the sum of `1 / sample_rate`.
    pub sampled_count: f64,
}

/// The aggregated state of one metric identity within a shard.
#[derive(Clone, Debug, PartialEq)]
pub enum AggregateValue {
    /// See [`MetricType::Counter`].
    Counter(CounterValue),
    /// See [`MetricType::Gauge`].
    Gauge(GaugeType),
    /// See [`MetricType::Set`].
    Set(HashSet<String>),
    /// See [`MetricType::Timer`].
    Timer(TimerValue),
}

impl AggregateValue {
    /// Creates a new aggregate from a single value.
    pub fn new(value: MetricValue, sample_rate: f64) -> Self {
        match value {
            MetricValue::Counter(value) => Self::Counter(CounterValue {
                value: value / sample_rate,
                total: 0.0,
            }),
            MetricValue::Gauge(value) => Self::Gauge(value),
            MetricValue::Set(value) => Self::Set(HashSet::from_iter([value])),
            MetricValue::Timer(value) => Self::Timer(TimerValue {
                values: vec![value],
                sampled_count: 1.0 / sample_rate,
            }),
        }
    }

    /// Returns the type of this aggregate.
    pub fn ty(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Gauge(_) => MetricType::Gauge,
            Self::Set(_) => MetricType::Set,
            Self::Timer(_) => MetricType::Timer,
        }
    }

    /// Folds a value into this aggregate.
    ///
    /// Counters sum, gauges replace, sets insert and timers append.
    pub fn insert(&mut self, value: MetricValue, sample_rate: f64) -> Result<(), AggregateError> {
        match (self, value) {
            (Self::Counter(counter), MetricValue::Counter(value)) => {
                counter.value += value / sample_rate;
            }
            (Self::Gauge(gauge), MetricValue::Gauge(value)) => *gauge = value,
            (Self::Set(set), MetricValue::Set(value)) => {
                set.insert(value);
            }
            (Self::Timer(timer), MetricValue::Timer(value)) => {
                timer.values.push(value);
                timer.sampled_count += 1.0 / sample_rate;
            }
            (this, value) => {
                return Err(AggregateError::TypeMismatch {
                    aggregate: this.ty(),
                    value: value.ty(),
                });
            }
        }

        Ok(())
    }
}

/// A percentile cut of a timer's samples.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Percentile {
    /// The configured threshold, negative for lower percentiles.
    pub threshold: f64,
    /// The upper bound (or lower bound for negative thresholds) of the values inside the cut.
    pub bound: f64,
    /// Number of values inside the cut.
    pub count: usize,
    /// Mean of the values inside the cut.
    pub mean: f64,
    /// Sum of the values inside the cut.
    pub sum: f64,
    /// Sum of squares of the values inside the cut.
    pub sum_squares: f64,
}

impl Percentile {
    /// Returns the label of the bound, such as `upper_90`, `lower_10` or `upper_99_9`.
    pub fn label(&self) -> String {
        let direction = if self.threshold < 0.0 { "lower" } else { "upper" };
        format!("{direction}_{}", self.suffix())
    }

    /// Returns the threshold formatted for metric names, such as `90` or `99_9`.
    pub fn suffix(&self) -> String {
        self.threshold.abs().to_string().replace('.', "_")
    }
}

/// Statistical summary of a timer's samples within one flush window.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TimerSummary {
    /// Number of samples received.
    pub count: usize,
    /// Estimated number of samples taken by clients.
    pub sampled_count: f64,
    /// Sampled count per second of the flush interval.
    pub per_second: f64,
    /// Sum of all samples.
    pub sum: f64,
    /// Sum of squares of all samples.
    pub sum_squares: f64,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Median, the mean of the two middle samples for even counts.
    pub median: f64,
    /// Population standard deviation.
    pub stddev: f64,
    /// Configured percentiles.
    pub percentiles: Vec<Percentile>,
}

impl TimerSummary {
    /// Computes the summary of a timer.
    ///
    /// Percentiles use the nearest rank: for a threshold `p` the cut contains the
    /// `n = round(|p| / 100 * count)` smallest values (or largest for negative `p`). Thresholds
    /// with `n == 0` are skipped. A single sample always has rank 1, so every threshold reports
    /// it. Returns `None` if there are no samples.
    pub fn compute(
        mut values: Vec<TimerType>,
        sampled_count: f64,
        percentiles: &[f64],
        interval: Duration,
    ) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        values.sort_unstable_by(f64::total_cmp);

        let count = values.len();
        let sum: f64 = values.iter().sum();
        let sum_squares: f64 = values.iter().map(|v| v * v).sum();
        let mean = sum / count as f64;

        let median = if count % 2 == 0 {
            (values[count / 2 - 1] + values[count / 2]) / 2.0
        } else {
            values[count / 2]
        };

        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        let interval_secs = interval.as_secs_f64();
        let per_second = if interval_secs > 0.0 {
            sampled_count / interval_secs
        } else {
            0.0
        };

        let percentiles = percentiles
            .iter()
            .filter_map(|&threshold| percentile(&values, threshold))
            .collect();

        Some(Self {
            count,
            sampled_count,
            per_second,
            sum,
            sum_squares,
            min: values[0],
            max: values[count - 1],
            mean,
            median,
            stddev: variance.sqrt(),
            percentiles,
        })
    }
}

/// Computes the nearest-rank percentile cut over sorted values.
fn percentile(sorted: &[f64], threshold: f64) -> Option<Percentile> {
    let count = sorted.len();
    let rank = if count == 1 {
        1
    } else {
        ((threshold.abs() / 100.0 * count as f64).round() as usize).min(count)
    };

    if rank == 0 {
        return None;
    }

    let (bound, cut) = if threshold >= 0.0 {
        (sorted[rank - 1], &sorted[..rank])
    } else {
        (sorted[count - rank], &sorted[count - rank..])
    };

    let sum: f64 = cut.iter().sum();
    Some(Percentile {
        threshold,
        bound,
        count: rank,
        mean: sum / rank as f64,
        sum,
        sum_squares: cut.iter().map(|v| v * v).sum(),
    })
}
