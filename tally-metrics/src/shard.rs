use std::mem;
use std::time::Duration;

use indexmap::IndexMap;
use indexmap::map::Entry as MapEntry;
use tokio::time::Instant;

use crate::aggregate::{AggregateError, AggregateValue};
use crate::config::AggregatorConfig;
use crate::event::Event;
use crate::protocol::{KeyedMetric, MetricKey, MetricType};
use crate::snapshot::{FlushedGauge, FlushedSet, Snapshot, SnapshotCounter, SnapshotTimer};
use crate::statsd::{MetricCounters, MetricTimers};

/// Expiry intervals resolved per metric type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryIntervals {
    counter: Duration,
    gauge: Duration,
    set: Duration,
    timer: Duration,
}

impl ExpiryIntervals {
    /// Resolves intervals and their per-type overrides from the configuration.
    pub fn from_config(config: &AggregatorConfig) -> Self {
        Self {
            counter: config.expiry_interval(MetricType::Counter),
            gauge: config.expiry_interval(MetricType::Gauge),
            set: config.expiry_interval(MetricType::Set),
            timer: config.expiry_interval(MetricType::Timer),
        }
    }

    /// Returns the interval for the given type. Zero means the metric does not outlive a flush.
    pub fn get(&self, ty: MetricType) -> Duration {
        match ty {
            MetricType::Counter => self.counter,
            MetricType::Gauge => self.gauge,
            MetricType::Set => self.set,
            MetricType::Timer => self.timer,
        }
    }

    fn is_idle(&self, ty: MetricType, last_seen: Instant, now: Instant) -> bool {
        let interval = self.get(ty);
        !interval.is_zero() && now.saturating_duration_since(last_seen) > interval
    }
}

#[derive(Debug)]
struct Entry {
    value: AggregateValue,
    last_seen: Instant,
}

/// Outcome of [`Shard::expire_chunk`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpireStep {
    /// Number of identities removed in this step.
    pub removed: usize,
    /// `true` if the scan reached the end of the shard and starts over on the next step.
    pub finished: bool,
}

/// The aggregation state owned by a single worker.
///
/// Each [`MetricKey`] maps to exactly one shard, so a shard is never shared between workers.
/// Entries are kept in insertion order, which allows expiry scans to be split into chunks that
/// resume at the last position.
#[derive(Debug)]
pub struct Shard {
    entries: IndexMap<MetricKey, Entry>,
    events: Vec<Event>,
    max_pending_events: usize,
    expiry: ExpiryIntervals,
    cursor: usize,
}

impl Shard {
    /// Creates an empty shard.
    pub fn new(config: &AggregatorConfig) -> Self {
        Self {
            entries: IndexMap::new(),
            events: Vec::new(),
            max_pending_events: config.max_pending_events,
            expiry: ExpiryIntervals::from_config(config),
            cursor: 0,
        }
    }

    /// Returns the number of identities in the shard.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the shard holds no identities.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of buffered events.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Folds a metric into the shard and marks its identity as seen at `now`.
    pub fn merge(&mut self, metric: KeyedMetric, now: Instant) -> Result<(), AggregateError> {
        let KeyedMetric {
            key,
            value,
            sample_rate,
        } = metric;

        match self.entries.entry(key) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.value.insert(value, sample_rate)?;
                entry.last_seen = now;
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: AggregateValue::new(value, sample_rate),
                    last_seen: now,
                });
            }
        }

        Ok(())
    }

    /// Buffers an event for the next flush.
    ///
    /// Returns `false` if the buffer is full and the event was dropped.
    pub fn add_event(&mut self, event: Event) -> bool {
        if self.events.len() >= self.max_pending_events {
            tally_statsd::metric!(counter(MetricCounters::EventsDropped) += 1);
            return false;
        }

        self.events.push(event);
        true
    }

    /// Takes a snapshot of the shard and resets its state for the next window.
    ///
    /// - Identities idle for longer than their expiry interval are removed instead of flushed.
    /// - Counters report their delta and reset to zero. Gauges keep their value.
    /// - Sets and timers are reported if they received values, then cleared.
    /// - Identities with a zero expiry interval are removed after being flushed.
    pub fn snapshot(&mut self, now: Instant) -> Snapshot {
        tally_statsd::metric!(timer(MetricTimers::Snapshot), {
            let mut snapshot = Snapshot::default();
            let expiry = self.expiry;

            self.entries.retain(|key, entry| {
                if expiry.is_idle(key.ty(), entry.last_seen, now) {
                    snapshot.expired += 1;
                    return false;
                }

                match &mut entry.value {
                    AggregateValue::Counter(counter) => {
                        counter.total += counter.value;
                        snapshot.counters.push(SnapshotCounter {
                            name: key.name().to_owned(),
                            tags: key.tags().clone(),
                            delta: counter.value,
                            total: counter.total,
                        });
                        counter.value = 0.0;
                    }
                    AggregateValue::Gauge(value) => {
                        snapshot.gauges.push(FlushedGauge {
                            name: key.name().to_owned(),
                            tags: key.tags().clone(),
                            value: *value,
                        });
                    }
                    AggregateValue::Set(set) => {
                        if !set.is_empty() {
                            snapshot.sets.push(FlushedSet {
                                name: key.name().to_owned(),
                                tags: key.tags().clone(),
                                cardinality: set.len(),
                            });
                            set.clear();
                        }
                    }
                    AggregateValue::Timer(timer) => {
                        if !timer.values.is_empty() {
                            snapshot.timers.push(SnapshotTimer {
                                name: key.name().to_owned(),
                                tags: key.tags().clone(),
                                values: mem::take(&mut timer.values),
                                sampled_count: mem::take(&mut timer.sampled_count),
                            });
                        }
                    }
                }

                !expiry.get(key.ty()).is_zero()
            });

            snapshot.events = mem::take(&mut self.events);
            self.cursor = 0;

            if snapshot.expired > 0 {
                tally_statsd::metric!(
                    counter(MetricCounters::Expired) += snapshot.expired as i64,
                    stage = "flush",
                );
            }

            snapshot
        })
    }

    /// Inspects up to `chunk` entries, removing those idle for longer than their expiry interval.
    ///
    /// The scan resumes where the previous step stopped. Entries with a zero expiry interval are
    /// left to the next [`snapshot`](Self::snapshot).
    pub fn expire_chunk(&mut self, now: Instant, chunk: usize) -> ExpireStep {
        let mut removed = 0;
        let mut inspected = 0;

        while inspected < chunk.max(1) {
            let Some((key, entry)) = self.entries.get_index(self.cursor) else {
                break;
            };

            inspected += 1;
            if self.expiry.is_idle(key.ty(), entry.last_seen, now) {
                // The last entry moves into the cursor position and is inspected next.
                self.entries.swap_remove_index(self.cursor);
                removed += 1;
            } else {
                self.cursor += 1;
            }
        }

        let finished = self.cursor >= self.entries.len();
        if finished {
            self.cursor = 0;
        }

        if removed > 0 {
            tally_statsd::metric!(
                counter(MetricCounters::Expired) += removed as i64,
                stage = "scan",
            );
        }

        ExpireStep { removed, finished }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use crate::protocol::{Metric, MetricValue, Tags};

    use super::*;

    fn keyed(name: &str, value: MetricValue) -> KeyedMetric {
        Metric {
            name: name.to_owned(),
            value,
            sample_rate: 1.0,
            tags: Tags::new(),
            source: None,
        }
        .into_keyed()
    }

    fn config(expiry_interval: u64) -> AggregatorConfig {
        AggregatorConfig {
            expiry_interval,
            max_pending_events: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_counter_delta_and_total() {
        let mut shard = Shard::new(&config(300));
        let now = Instant::now();

        shard.merge(keyed("foo.bar", MetricValue::Counter(1.0)), now).unwrap();
        shard.merge(keyed("foo.bar", MetricValue::Counter(1.0)), now).unwrap();

        let snapshot = shard.snapshot(now);
        assert_eq!(snapshot.counters.len(), 1);
        assert_eq!(snapshot.counters[0].delta, 2.0);
        assert_eq!(snapshot.counters[0].total, 2.0);

        shard.merge(keyed("foo.bar", MetricValue::Counter(3.0)), now).unwrap();
        let snapshot = shard.snapshot(now);
        assert_eq!(snapshot.counters[0].delta, 3.0);
        assert_eq!(snapshot.counters[0].total, 5.0);

        // Counters persist at zero until they expire.
        let snapshot = shard.snapshot(now);
        assert_eq!(snapshot.counters[0].delta, 0.0);
        assert_eq!(snapshot.counters[0].total, 5.0);
    }

    #[test]
    fn test_gauge_last_value_persists() {
        let mut shard = Shard::new(&config(300));
        let now = Instant::now();

        shard.merge(keyed("foo.gauge", MetricValue::Gauge(5.0)), now).unwrap();
        shard.merge(keyed("foo.gauge", MetricValue::Gauge(9.0)), now).unwrap();

        assert_eq!(shard.snapshot(now).gauges[0].value, 9.0);
        assert_eq!(shard.snapshot(now).gauges[0].value, 9.0);
    }

    #[test]
    fn test_set_and_timer_clear() {
        let mut shard = Shard::new(&config(300));
        let now = Instant::now();

        for user in ["a", "b", "a"] {
            let value = MetricValue::Set(user.to_owned());
            shard.merge(keyed("users", value), now).unwrap();
        }
        shard.merge(keyed("latency", MetricValue::Timer(4.0)), now).unwrap();

        let snapshot = shard.snapshot(now);
        assert_eq!(snapshot.sets[0].cardinality, 2);
        assert_eq!(snapshot.timers[0].values, vec![4.0]);

        let snapshot = shard.snapshot(now);
        assert!(snapshot.sets.is_empty());
        assert!(snapshot.timers.is_empty());
        assert_eq!(shard.len(), 2);
    }

    #[test]
    fn test_zero_expiry_does_not_persist() {
        let mut shard = Shard::new(&config(0));
        let now = Instant::now();

        shard.merge(keyed("foo", MetricValue::Counter(1.0)), now).unwrap();
        shard.merge(keyed("bar", MetricValue::Gauge(1.0)), now).unwrap();

        let snapshot = shard.snapshot(now + Duration::from_secs(1));
        assert_eq!(snapshot.counters.len(), 1);
        assert_eq!(snapshot.gauges.len(), 1);
        assert!(shard.is_empty());
    }

    #[test]
    fn test_idle_removed_at_flush() {
        let mut shard = Shard::new(&config(10));
        let now = Instant::now();

        shard.merge(keyed("idle", MetricValue::Gauge(1.0)), now).unwrap();
        shard.merge(keyed("busy", MetricValue::Gauge(2.0)), now).unwrap();
        shard
            .merge(keyed("busy", MetricValue::Gauge(3.0)), now + Duration::from_secs(8))
            .unwrap();

        let snapshot = shard.snapshot(now + Duration::from_secs(11));
        assert_eq!(snapshot.expired, 1);
        assert_eq!(snapshot.gauges.len(), 1);
        assert_eq!(snapshot.gauges[0].name, "busy");
    }

    #[test]
    fn test_expire_chunks() {
        let mut shard = Shard::new(&config(10));
        let now = Instant::now();

        for index in 0..5 {
            let name = format!("m{index}");
            shard.merge(keyed(&name, MetricValue::Gauge(1.0)), now).unwrap();
        }
        // Activity resets the clock.
        shard
            .merge(keyed("m1", MetricValue::Gauge(2.0)), now + Duration::from_secs(5))
            .unwrap();

        let later = now + Duration::from_secs(11);
        let first = shard.expire_chunk(later, 2);
        assert!(!first.finished);

        let mut removed = first.removed;
        loop {
            let step = shard.expire_chunk(later, 2);
            removed += step.removed;
            if step.finished {
                break;
            }
        }

        assert_eq!(removed, 4);
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.snapshot(later).gauges[0].name, "m1");
    }

    #[test]
    fn test_event_buffer_bounded() {
        let mut shard = Shard::new(&config(10));

        assert!(shard.add_event(Event::new("a", "")));
        assert!(shard.add_event(Event::new("b", "")));
        assert!(!shard.add_event(Event::new("c", "")));

        let snapshot = shard.snapshot(Instant::now());
        assert_eq!(snapshot.events.len(), 2);
        assert_eq!(shard.pending_events(), 0);
    }

    #[test]
    fn test_merge_type_mismatch_keeps_state() {
        let mut shard = Shard::new(&config(10));
        let now = Instant::now();

        let gauge = keyed("x", MetricValue::Gauge(1.0));
        let key = gauge.key.clone();
        shard.merge(gauge, now).unwrap();

        // Identities include the type, so a mismatch can only be provoked with a forged key.
        let forged = KeyedMetric {
            key,
            value: MetricValue::Counter(1.0),
            sample_rate: 1.0,
        };
        assert!(shard.merge(forged, now).is_err());
        assert_eq!(shard.snapshot(now).gauges[0].value, 1.0);
    }
}
