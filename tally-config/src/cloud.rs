use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// The source of host metadata used to enrich metrics.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CloudProviderConfig {
    /// Looks up hosts in a fixed map.
    Static {
        /// Tags per host, keyed by the source address or host name.
        #[serde(default)]
        hosts: BTreeMap<String, Vec<String>>,
    },
    /// Looks up hosts with `GET {url}/{host}`, expecting a JSON list of tags.
    ///
    /// A `404` response means the host is not known.
    Http {
        /// Base URL of the metadata service.
        url: Url,
    },
}

/// Configuration of the cloud tag enricher.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CloudConfig {
    /// The metadata provider.
    pub provider: CloudProviderConfig,

    /// Seconds a successful lookup is cached before it is refreshed.
    #[serde(default = "default_cache_refresh")]
    pub cache_refresh: u64,

    /// Seconds a failed or empty lookup is cached before it is retried.
    #[serde(default = "default_cache_negative_ttl")]
    pub cache_negative_ttl: u64,

    /// Seconds after which an entry that has not been used is removed.
    #[serde(default = "default_cache_evict")]
    pub cache_evict: u64,

    /// Maximum number of lookups in flight.
    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,

    /// Maximum number of hosts waiting for a lookup. Further misses are not queued.
    #[serde(default = "default_max_pending_lookups")]
    pub max_pending_lookups: usize,

    /// Timeout of a single lookup in milliseconds.
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

impl CloudConfig {
    /// Creates a configuration with default limits for the given provider.
    pub fn new(provider: CloudProviderConfig) -> Self {
        Self {
            provider,
            cache_refresh: default_cache_refresh(),
            cache_negative_ttl: default_cache_negative_ttl(),
            cache_evict: default_cache_evict(),
            max_concurrent_lookups: default_max_concurrent_lookups(),
            max_pending_lookups: default_max_pending_lookups(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }

    /// Time-to-live of positive cache entries.
    pub fn cache_refresh(&self) -> Duration {
        Duration::from_secs(self.cache_refresh)
    }

    /// Time-to-live of negative cache entries.
    pub fn cache_negative_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_negative_ttl)
    }

    /// Idle time after which cache entries are evicted.
    pub fn cache_evict(&self) -> Duration {
        Duration::from_secs(self.cache_evict)
    }

    /// Timeout of a single lookup.
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

fn default_cache_refresh() -> u64 {
    5 * 60 // 5 minutes
}

fn default_cache_negative_ttl() -> u64 {
    60
}

fn default_cache_evict() -> u64 {
    60 * 60 // 1 hour
}

fn default_max_concurrent_lookups() -> usize {
    32
}

fn default_max_pending_lookups() -> usize {
    10_000
}

fn default_lookup_timeout_ms() -> u64 {
    5000
}
