use std::fmt;
use std::hash::{Hash, Hasher as _};

use hash32::{FnvHasher, Hasher};
use serde::{Deserialize, Serialize};

/// Type used for counter increments.
pub type CounterType = f64;

/// Type used for gauge values.
pub type GaugeType = f64;

/// Type used for timer samples, usually milliseconds.
pub type TimerType = f64;

/// The type of a metric, determining how its values are aggregated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Sums up increments within a flush window.
    ///
    /// Counter increments are divided by their sample rate. After a flush, the counter resets to
    /// zero but keeps a running total since the identity was first seen.
    Counter,
    /// Stores the most recently reported value.
    Gauge,
    /// Counts the number of distinct values reported within a flush window.
    Set,
    /// Collects individual samples and reports a statistical summary on flush.
    ///
    /// Submitted with the `ms`, `h` or `d` type codes.
    Timer,
}

impl MetricType {
    /// Returns the shortcode for this metric type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "c",
            MetricType::Gauge => "g",
            MetricType::Set => "s",
            MetricType::Timer => "ms",
        }
    }

    /// Returns a human readable name used for tagging internal metrics.
    pub fn name(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Set => "set",
            MetricType::Timer => "timer",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error returned when parsing an unknown [`MetricType`] shortcode.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unknown metric type `{0}`")]
pub struct UnknownMetricType(pub String);

impl std::str::FromStr for MetricType {
    type Err = UnknownMetricType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "c" => Self::Counter,
            "g" => Self::Gauge,
            "s" => Self::Set,
            "ms" | "h" | "d" => Self::Timer,
            _ => return Err(UnknownMetricType(s.to_owned())),
        })
    }
}

/// The typed value of a single [`Metric`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MetricValue {
    /// An increment. See [`MetricType::Counter`].
    Counter(CounterType),
    /// An absolute value. See [`MetricType::Gauge`].
    Gauge(GaugeType),
    /// A set member. Members are kept verbatim. See [`MetricType::Set`].
    Set(String),
    /// A single timing sample. See [`MetricType::Timer`].
    Timer(TimerType),
}

impl MetricValue {
    /// Returns the type of this value.
    pub fn ty(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Gauge(_) => MetricType::Gauge,
            Self::Set(_) => MetricType::Set,
            Self::Timer(_) => MetricType::Timer,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter(value) => value.fmt(f),
            Self::Gauge(value) => value.fmt(f),
            Self::Set(value) => value.fmt(f),
            Self::Timer(value) => value.fmt(f),
        }
    }
}

/// A canonical set of tags.
///
/// Tags are either `key:value` pairs or bare `key` strings. The collection is always sorted and
/// free of duplicates, so two tag sets compare equal regardless of the order in which the tags
/// were submitted.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct Tags(Vec<String>);

impl Tags {
    /// Creates an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty tag set with room for `capacity` tags.
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Inserts a tag at its sorted position unless it is already present.
    pub fn insert(&mut self, tag: String) {
        if let Err(index) = self.0.binary_search(&tag) {
            self.0.insert(index, tag);
        }
    }

    /// Returns `true` if a tag with the given key exists, with or without a value.
    pub fn has_key(&self, key: &str) -> bool {
        self.iter().any(|tag| tag_key(tag) == key)
    }

    /// Returns the value of the first tag with the given key.
    ///
    /// Returns `Some("")` for a bare tag.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|tag| tag_key(tag) == key)
            .map(|tag| tag.split_once(':').map_or("", |(_, value)| value))
    }

    /// Iterates over all tags in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Returns the number of tags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn tag_key(tag: &str) -> &str {
    tag.split_once(':').map_or(tag, |(key, _)| key)
}

impl From<Vec<String>> for Tags {
    fn from(mut tags: Vec<String>) -> Self {
        tags.sort_unstable();
        tags.dedup();
        Self(tags)
    }
}

impl FromIterator<String> for Tags {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl Extend<String> for Tags {
    fn extend<T: IntoIterator<Item = String>>(&mut self, iter: T) {
        self.0.extend(iter);
        self.0.sort_unstable();
        self.0.dedup();
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, tag) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            f.write_str(tag)?;
        }
        Ok(())
    }
}

/// The identity of an aggregated metric.
///
/// Two keys are equal if their type, name and canonical tag set are equal. The key caches a
/// 32-bit FNV hash of its canonical form which is used both for hashing in maps and for
/// selecting the aggregation shard.
#[derive(Clone, Debug)]
pub struct MetricKey {
    ty: MetricType,
    name: String,
    tags: Tags,
    hash: u32,
}

impl MetricKey {
    /// Creates a new key and computes its hash.
    pub fn new(ty: MetricType, name: String, tags: Tags) -> Self {
        let mut hasher = FnvHasher::default();
        hasher.write(name.as_bytes());
        hasher.write(&[0]);
        for tag in tags.iter() {
            hasher.write(tag.as_bytes());
            hasher.write(&[0]);
        }
        hasher.write(ty.as_str().as_bytes());
        let hash = hasher.finish32();

        Self {
            ty,
            name,
            tags,
            hash,
        }
    }

    /// The metric type.
    pub fn ty(&self) -> MetricType {
        self.ty
    }

    /// The full metric name including the namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical tag set.
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Returns the cached 32-bit hash of this key.
    pub fn hash32(&self) -> u32 {
        self.hash
    }

    /// Returns the index of the shard owning this key out of `shards` shards.
    pub fn shard(&self, shards: usize) -> usize {
        self.hash as usize % shards.max(1)
    }

    /// Splits the key into its name and tags.
    pub fn into_parts(self) -> (String, Tags) {
        (self.name, self.tags)
    }
}

impl PartialEq for MetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.ty == other.ty
            && self.name == other.name
            && self.tags == other.tags
    }
}

impl Eq for MetricKey {}

impl Hash for MetricKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

/// A single data point parsed from the statsd protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// The full metric name including the namespace.
    pub name: String,
    /// The typed value.
    pub value: MetricValue,
    /// The client-side sample rate in `(0, 1]`.
    pub sample_rate: f64,
    /// Explicit tags merged with the configured default tags.
    pub tags: Tags,
    /// The host or address that sent this metric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Metric {
    /// Returns the type of the metric.
    pub fn ty(&self) -> MetricType {
        self.value.ty()
    }

    /// Computes the identity of this metric.
    pub fn key(&self) -> MetricKey {
        MetricKey::new(self.ty(), self.name.clone(), self.tags.clone())
    }

    /// Consumes the metric and computes its identity.
    ///
    /// The source is dropped, it must be applied to the tags before.
    pub fn into_keyed(self) -> KeyedMetric {
        KeyedMetric {
            key: MetricKey::new(self.value.ty(), self.name, self.tags),
            value: self.value,
            sample_rate: self.sample_rate,
        }
    }
}

/// A [`Metric`] with its identity computed, ready to be folded into a shard.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedMetric {
    /// The identity of the metric.
    pub key: MetricKey,
    /// The typed value.
    pub value: MetricValue,
    /// The client-side sample rate in `(0, 1]`.
    pub sample_rate: f64,
}
