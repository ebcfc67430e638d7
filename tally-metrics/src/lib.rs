//! Statsd protocol parsing and in-memory aggregation for Tally.
//!
//! Metrics are submitted as plain text lines over UDP or TCP. Each line carries a single data
//! point or an event:
//!
//! ```text
//! endpoint.hits:1|c|@0.5|#route:user_index,environment:production
//! endpoint.response_time:57|ms
//! queue.size:14|g
//! users.online:user_4711|s
//! _e{6,11}:deploy|new release|t:success|#service:api
//! ```
//!
//! # Metric Types
//!
//! - **Counters** (`c`) sum up increments within a flush window. Increments are scaled by the
//!   inverse sample rate. A counter keeps its running total across flushes and reports a zero
//!   delta until it expires.
//! - **Gauges** (`g`) store the last reported value, which persists across flushes.
//! - **Sets** (`s`) count distinct values within a flush window.
//! - **Timers** (`ms`, `h`, `d`) collect samples and report a statistical summary on flush,
//!   including nearest-rank percentiles.
//!
//! # Aggregation
//!
//! Parsed metrics are keyed by their [`MetricKey`], the combination of type, name and canonical
//! tag set. The key's hash selects one of a fixed number of [`Shard`]s, each owned by a single
//! aggregation worker. On flush, each shard produces a [`Snapshot`] and the snapshots are merged
//! into a [`MetricBatch`] for the backends.
//!
//! ```
//! use tally_metrics::{AggregatorConfig, MetricBatch, Parser, Record, Shard};
//! use tokio::time::Instant;
//!
//! let config = AggregatorConfig::default();
//! let mut shard = Shard::new(&config);
//!
//! for result in Parser::default().parse_all(b"foo.bar:1|c\nfoo.bar:1|c", None) {
//!     if let Ok(Record::Metric(metric)) = result {
//!         shard.merge(metric.into_keyed(), Instant::now()).unwrap();
//!     }
//! }
//!
//! let snapshot = shard.snapshot(Instant::now());
//! let batch = MetricBatch::from_snapshots([snapshot], &config.percentiles, config.flush_interval(), 0);
//! assert_eq!(batch.counters[0].delta, 2.0);
//! ```
#![warn(missing_docs)]

mod aggregate;
mod config;
mod event;
mod parser;
mod protocol;
mod shard;
mod snapshot;
mod statsd;

pub use aggregate::*;
pub use config::*;
pub use event::*;
pub use parser::*;
pub use protocol::*;
pub use shard::*;
pub use snapshot::*;
pub use statsd::MetricCounters;
