use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tally_config::{GraphiteConfig, TagStyle};
use tally_metrics::{DisabledSubMetrics, MetricBatch, Tags};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::services::backend::{Backend, BackendError};
use crate::utils::{sanitize_path, sanitize_tag};

/// Renders batches in the graphite plaintext format, one `path value timestamp` line per value.
///
/// Paths are composed of the global prefix, the per-type prefix and the metric name:
///
/// ```text
/// stats.counters.api.requests.count 12 1700000000
/// stats.counters.api.requests.rate 1.2 1700000000
/// stats.gauges.queue.size;env=prod 4 1700000000
/// stats.timers.api.latency.upper_90 81 1700000000
/// ```
#[derive(Clone, Debug)]
pub struct LineFormat {
    global_prefix: String,
    prefix_counter: String,
    prefix_gauge: String,
    prefix_set: String,
    prefix_timer: String,
    tag_style: TagStyle,
    disabled: DisabledSubMetrics,
}

impl Default for LineFormat {
    fn default() -> Self {
        Self {
            global_prefix: "stats".to_owned(),
            prefix_counter: "counters".to_owned(),
            prefix_gauge: "gauges".to_owned(),
            prefix_set: "sets".to_owned(),
            prefix_timer: "timers".to_owned(),
            tag_style: TagStyle::Graphite,
            disabled: DisabledSubMetrics::default(),
        }
    }
}

impl LineFormat {
    /// Creates a format with the prefixes and tag style of a graphite backend.
    pub fn from_config(config: &GraphiteConfig, disabled: DisabledSubMetrics) -> Self {
        Self {
            disabled,
            global_prefix: config.global_prefix.clone(),
            prefix_counter: config.prefix_counter.clone(),
            prefix_gauge: config.prefix_gauge.clone(),
            prefix_set: config.prefix_set.clone(),
            prefix_timer: config.prefix_timer.clone(),
            tag_style: config.tag_style,
        }
    }

    /// Leaves out the given timer sub-metrics.
    pub fn with_disabled(mut self, disabled: DisabledSubMetrics) -> Self {
        self.disabled = disabled;
        self
    }

    /// Renders all metrics of the batch. Events are not part of the graphite format.
    pub fn render(&self, batch: &MetricBatch) -> String {
        let mut out = String::with_capacity(batch.len() * 64);
        let ts = batch.timestamp;

        for counter in &batch.counters {
            let base = self.path(&self.prefix_counter, &counter.name);
            self.line(&mut out, &base, "count", &counter.tags, counter.delta, ts);
            self.line(&mut out, &base, "rate", &counter.tags, counter.per_second, ts);
        }

        for gauge in &batch.gauges {
            let base = self.path(&self.prefix_gauge, &gauge.name);
            self.line(&mut out, &base, "", &gauge.tags, gauge.value, ts);
        }

        for set in &batch.sets {
            let base = self.path(&self.prefix_set, &set.name);
            self.line(&mut out, &base, "count", &set.tags, set.cardinality as f64, ts);
        }

        for timer in &batch.timers {
            let base = self.path(&self.prefix_timer, &timer.name);
            let summary = &timer.summary;
            let tags = &timer.tags;
            let disabled = &self.disabled;

            let values = [
                ("lower", disabled.lower, summary.min),
                ("upper", disabled.upper, summary.max),
                ("count", disabled.count, summary.count as f64),
                ("count_ps", disabled.count_per_second, summary.per_second),
                ("mean", disabled.mean, summary.mean),
                ("median", disabled.median, summary.median),
                ("std", disabled.std, summary.stddev),
                ("sum", disabled.sum, summary.sum),
                ("sum_squares", disabled.sum_squares, summary.sum_squares),
            ];
            for (suffix, skip, value) in values {
                if !skip {
                    self.line(&mut out, &base, suffix, tags, value, ts);
                }
            }

            for pct in &summary.percentiles {
                let (suffix, bound_disabled) = if pct.threshold < 0.0 {
                    (format!("lower_{}", pct.suffix()), disabled.lower_pct)
                } else {
                    (pct.suffix(), disabled.upper_pct)
                };

                let values = [
                    (pct.label(), bound_disabled, pct.bound),
                    (format!("count_{suffix}"), disabled.count_pct, pct.count as f64),
                    (format!("mean_{suffix}"), disabled.mean_pct, pct.mean),
                    (format!("sum_{suffix}"), disabled.sum_pct, pct.sum),
                    (format!("sum_squares_{suffix}"), disabled.sum_squares_pct, pct.sum_squares),
                ];
                for (name, skip, value) in values {
                    if !skip {
                        self.line(&mut out, &base, &name, tags, value, ts);
                    }
                }
            }
        }

        out
    }

    fn path(&self, type_prefix: &str, name: &str) -> String {
        let name = sanitize_path(name);
        [self.global_prefix.as_str(), type_prefix, &name]
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join(".")
    }

    fn line(&self, out: &mut String, base: &str, suffix: &str, tags: &Tags, value: f64, ts: u64) {
        out.push_str(base);
        if !suffix.is_empty() {
            out.push('.');
            out.push_str(suffix);
        }

        if self.tag_style == TagStyle::Graphite {
            for tag in tags.iter() {
                let (key, value) = tag.split_once(':').unwrap_or((tag, "true"));
                write!(out, ";{}={}", sanitize_tag(key), sanitize_tag(value)).ok();
            }
        }

        writeln!(out, " {value} {ts}").ok();
    }
}

/// Sends batches to a carbon listener using the plaintext protocol.
///
/// A new connection is opened for every flush.
#[derive(Debug)]
pub struct GraphiteBackend {
    address: SocketAddr,
    format: Arc<LineFormat>,
}

impl GraphiteBackend {
    /// Creates a backend from its configuration.
    pub fn new(config: &GraphiteConfig, disabled: DisabledSubMetrics) -> Self {
        Self {
            address: config.address,
            format: Arc::new(LineFormat::from_config(config, disabled)),
        }
    }
}

impl Backend for GraphiteBackend {
    fn name(&self) -> &'static str {
        "graphite"
    }

    fn send(&self, batch: Arc<MetricBatch>) -> BoxFuture<'static, Result<(), BackendError>> {
        let address = self.address;
        let format = self.format.clone();

        async move {
            let payload = format.render(&batch);
            if payload.is_empty() {
                return Ok(());
            }

            let mut stream = TcpStream::connect(address).await?;
            stream.write_all(payload.as_bytes()).await?;
            stream.shutdown().await?;
            Ok(())
        }
        .boxed()
    }
}
