use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::aggregate::TimerSummary;
use crate::event::Event;
use crate::protocol::{CounterType, GaugeType, Tags, TimerType};
use crate::statsd::MetricTimers;

/// A counter taken out of a shard on flush.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotCounter {
    /// Metric name.
    pub name: String,
    /// Canonical tags.
    pub tags: Tags,
    /// Sum since the previous flush.
    pub delta: CounterType,
    /// Sum of all deltas including this one.
    pub total: CounterType,
}

/// Raw timer samples moved out of a shard on flush.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotTimer {
    /// Metric name.
    pub name: String,
    /// Canonical tags.
    pub tags: Tags,
    /// Samples since the previous flush, unsorted.
    pub values: Vec<TimerType>,
    /// Estimated number of samples taken by clients.
    pub sampled_count: f64,
}

/// Immutable point-in-time copy of one shard.
///
/// Counters, gauges and sets are already final. Timers carry their raw samples, summaries are
/// computed when snapshots are merged into a [`MetricBatch`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    /// Counters with their deltas.
    pub counters: Vec<SnapshotCounter>,
    /// Gauges with their current values.
    pub gauges: Vec<FlushedGauge>,
    /// Sets with their cardinality.
    pub sets: Vec<FlushedSet>,
    /// Timers with their raw samples.
    pub timers: Vec<SnapshotTimer>,
    /// Events buffered since the previous flush.
    pub events: Vec<Event>,
    /// Number of identities removed without being flushed because they were idle.
    pub expired: usize,
}

impl Snapshot {
    /// Returns `true` if the snapshot contains neither metrics nor events.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
            && self.gauges.is_empty()
            && self.sets.is_empty()
            && self.timers.is_empty()
            && self.events.is_empty()
    }

    /// Folds a later snapshot of the same shard into this one.
    ///
    /// Counter deltas add up and totals are taken from `later`. Gauges take the later value.
    /// Timer samples are concatenated. Set cardinalities are summed, since the members are no
    /// longer known, so a value seen in both windows counts twice.
    pub fn merge(&mut self, later: Snapshot) {
        merge_by_key(
            &mut self.counters,
            later.counters,
            |counter| (&counter.name, &counter.tags),
            |counter, later| {
                counter.delta += later.delta;
                counter.total = later.total;
            },
        );
        merge_by_key(
            &mut self.gauges,
            later.gauges,
            |gauge| (&gauge.name, &gauge.tags),
            |gauge, later| gauge.value = later.value,
        );
        merge_by_key(
            &mut self.sets,
            later.sets,
            |set| (&set.name, &set.tags),
            |set, later| set.cardinality += later.cardinality,
        );
        merge_by_key(
            &mut self.timers,
            later.timers,
            |timer| (&timer.name, &timer.tags),
            |timer, later| {
                timer.values.extend(later.values);
                timer.sampled_count += later.sampled_count;
            },
        );

        self.events.extend(later.events);
        self.expired += later.expired;
    }
}

fn merge_by_key<T>(
    items: &mut Vec<T>,
    later: Vec<T>,
    key: impl Fn(&T) -> (&String, &Tags),
    mut fold: impl FnMut(&mut T, T),
) {
    if later.is_empty() {
        return;
    }

    let mut index: HashMap<(String, Tags), usize> = items
        .iter()
        .enumerate()
        .map(|(position, item)| {
            let (name, tags) = key(item);
            ((name.clone(), tags.clone()), position)
        })
        .collect();

    for item in later {
        let (name, tags) = key(&item);
        let lookup = (name.clone(), tags.clone());
        match index.get(&lookup) {
            Some(&position) => fold(&mut items[position], item),
            None => {
                index.insert(lookup, items.len());
                items.push(item);
            }
        }
    }
}

/// A flushed counter.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FlushedCounter {
    /// Metric name.
    pub name: String,
    /// Canonical tags.
    pub tags: Tags,
    /// Sum within the flush window.
    pub delta: CounterType,
    /// Delta per second of the flush interval.
    pub per_second: f64,
    /// Sum of all deltas since the counter was created.
    pub total: CounterType,
}

/// A flushed gauge.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FlushedGauge {
    /// Metric name.
    pub name: String,
    /// Canonical tags.
    pub tags: Tags,
    /// The most recent value.
    pub value: GaugeType,
}

/// A flushed set.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FlushedSet {
    /// Metric name.
    pub name: String,
    /// Canonical tags.
    pub tags: Tags,
    /// Number of distinct values within the flush window.
    pub cardinality: usize,
}

/// A flushed timer.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FlushedTimer {
    /// Metric name.
    pub name: String,
    /// Canonical tags.
    pub tags: Tags,
    /// Summary of the samples within the flush window.
    #[serde(flatten)]
    pub summary: TimerSummary,
}

/// The merged result of one flush, handed to every backend.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct MetricBatch {
    /// Unix timestamp in seconds at which the flush started.
    pub timestamp: u64,
    /// Flushed counters.
    pub counters: Vec<FlushedCounter>,
    /// Flushed gauges.
    pub gauges: Vec<FlushedGauge>,
    /// Flushed sets.
    pub sets: Vec<FlushedSet>,
    /// Flushed timers.
    pub timers: Vec<FlushedTimer>,
    /// Flushed events.
    pub events: Vec<Event>,
}

impl MetricBatch {
    /// Merges shard snapshots into a batch.
    ///
    /// Computes per-second rates based on `interval` and timer summaries with the given
    /// percentile thresholds. The result is sorted by name and tags.
    pub fn from_snapshots(
        snapshots: impl IntoIterator<Item = Snapshot>,
        percentiles: &[f64],
        interval: Duration,
        timestamp: u64,
    ) -> Self {
        tally_statsd::metric!(timer(MetricTimers::BatchMerge), {
            let interval_secs = interval.as_secs_f64();
            let mut batch = Self {
                timestamp,
                ..Default::default()
            };

            for snapshot in snapshots {
                batch
                    .counters
                    .extend(snapshot.counters.into_iter().map(|counter| FlushedCounter {
                        per_second: if interval_secs > 0.0 {
                            counter.delta / interval_secs
                        } else {
                            0.0
                        },
                        name: counter.name,
                        tags: counter.tags,
                        delta: counter.delta,
                        total: counter.total,
                    }));

                batch.gauges.extend(snapshot.gauges);
                batch.sets.extend(snapshot.sets);

                batch
                    .timers
                    .extend(snapshot.timers.into_iter().filter_map(|timer| {
                        let summary = TimerSummary::compute(
                            timer.values,
                            timer.sampled_count,
                            percentiles,
                            interval,
                        )?;
                        Some(FlushedTimer {
                            name: timer.name,
                            tags: timer.tags,
                            summary,
                        })
                    }));

                batch.events.extend(snapshot.events);
            }

            batch.sort();
            batch
        })
    }

    /// Returns the number of metrics in the batch, excluding events.
    pub fn len(&self) -> usize {
        self.counters.len() + self.gauges.len() + self.sets.len() + self.timers.len()
    }

    /// Returns `true` if the batch contains neither metrics nor events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.events.is_empty()
    }

    fn sort(&mut self) {
        self.counters
            .sort_unstable_by(|a, b| (&a.name, &a.tags).cmp(&(&b.name, &b.tags)));
        self.gauges
            .sort_unstable_by(|a, b| (&a.name, &a.tags).cmp(&(&b.name, &b.tags)));
        self.sets
            .sort_unstable_by(|a, b| (&a.name, &a.tags).cmp(&(&b.name, &b.tags)));
        self.timers
            .sort_unstable_by(|a, b| (&a.name, &a.tags).cmp(&(&b.name, &b.tags)));
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn counter(name: &str, delta: f64) -> SnapshotCounter {
        SnapshotCounter {
            name: name.to_owned(),
            tags: Tags::new(),
            delta,
            total: delta,
        }
    }

    #[test]
    fn test_merge_snapshots() {
        let first = Snapshot {
            counters: vec![counter("b", 4.0)],
            timers: vec![SnapshotTimer {
                name: "t".to_owned(),
                tags: Tags::new(),
                values: vec![3.0, 1.0, 2.0],
                sampled_count: 3.0,
            }],
            ..Default::default()
        };
        let second = Snapshot {
            counters: vec![counter("a", 2.0)],
            gauges: vec![FlushedGauge {
                name: "g".to_owned(),
                tags: Tags::new(),
                value: 9.0,
            }],
            ..Default::default()
        };

        let batch =
            MetricBatch::from_snapshots([first, second], &[90.0], Duration::from_secs(2), 4711);

        assert_eq!(batch.len(), 4);
        assert_eq!(batch.counters[0].name, "a");
        assert_eq!(batch.counters[0].per_second, 1.0);
        assert_eq!(batch.counters[1].name, "b");
        assert_eq!(batch.timers[0].summary.max, 3.0);
        assert_eq!(batch.timers[0].summary.percentiles[0].bound, 3.0);
    }

    #[test]
    fn test_merge_later_snapshot() {
        let mut snapshot = Snapshot {
            counters: vec![counter("hits", 2.0)],
            gauges: vec![FlushedGauge {
                name: "g".to_owned(),
                tags: Tags::new(),
                value: 1.0,
            }],
            expired: 1,
            ..Default::default()
        };
        let later = Snapshot {
            counters: vec![
                SnapshotCounter {
                    name: "hits".to_owned(),
                    tags: Tags::new(),
                    delta: 3.0,
                    total: 5.0,
                },
                counter("misses", 1.0),
            ],
            gauges: vec![FlushedGauge {
                name: "g".to_owned(),
                tags: Tags::new(),
                value: 7.0,
            }],
            timers: vec![SnapshotTimer {
                name: "t".to_owned(),
                tags: Tags::new(),
                values: vec![1.0],
                sampled_count: 1.0,
            }],
            ..Default::default()
        };

        snapshot.merge(later);

        assert_eq!(snapshot.counters.len(), 2);
        assert_eq!(snapshot.counters[0].delta, 5.0);
        assert_eq!(snapshot.counters[0].total, 5.0);
        assert_eq!(snapshot.counters[1].name, "misses");
        assert_eq!(snapshot.gauges[0].value, 7.0);
        assert_eq!(snapshot.timers[0].values, vec![1.0]);
        assert_eq!(snapshot.expired, 1);
    }

    #[test]
    fn test_batch_json() {
        let snapshot = Snapshot {
            counters: vec![counter("hits", 2.0)],
            sets: vec![FlushedSet {
                name: "users".to_owned(),
                tags: vec!["env:prod".to_owned()].into(),
                cardinality: 3,
            }],
            ..Default::default()
        };

        let batch = MetricBatch::from_snapshots([snapshot], &[], Duration::from_secs(1), 10);
        insta::assert_snapshot!(serde_json::to_string_pretty(&batch).unwrap(), @r###"
        {
          "timestamp": 10,
          "counters": [
            {
              "name": "hits",
              "tags": [],
              "delta": 2.0,
              "per_second": 2.0,
              "total": 2.0
            }
          ],
          "gauges": [],
          "sets": [
            {
              "name": "users",
              "tags": [
                "env:prod"
              ],
              "cardinality": 3
            }
          ],
          "timers": [],
          "events": []
        }
        "###);
    }
}
