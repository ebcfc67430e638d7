//! Enrichment of metrics with tags of the host that sent them.
//!
//! The [`CloudService`] owns a [`CloudProvider`] and writes its results into a shared
//! [`CloudCache`]. Ingestion reads the cache through a [`CloudHandle`] and never waits for a
//! lookup: a host that is not cached yet is queued for lookup and its metrics pass through with
//! their original tags. Enrichment applies to metrics received after the lookup completed.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use tally_config::CloudConfig;
use tally_metrics::Tags;
use tally_statsd::metric;
use tally_system::{Addr, FromMessage, Interface, NoResponse, Receiver, Service};
use tokio::time::Instant;

use crate::statsd::{TallyCounters, TallyGauges, TallyTimers};

mod provider;

pub use self::provider::*;

#[derive(Debug)]
struct CacheEntry {
    /// Tags of the host, `None` for negative entries.
    tags: Option<Tags>,
    /// Instant after which the entry is looked up again.
    expires_at: Instant,
    /// Milliseconds since the cache epoch at which the entry was last read.
    last_used: AtomicU64,
}

/// Result of a cache read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Tags were found and applied.
    Hit,
    /// The host is known to have no tags.
    Negative,
    /// The host has not been looked up yet.
    Miss,
}

/// Host metadata shared between ingestion and the [`CloudService`].
///
/// Readers only take the read lock. Entries are written exclusively by the service.
#[derive(Debug)]
pub struct CloudCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    epoch: Instant,
}

impl CloudCache {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Returns the number of cached hosts.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if no host is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extends `tags` with the cached tags of `host`.
    ///
    /// The second value is `true` if the entry is missing or expired and should be looked up.
    fn apply(&self, host: &str, tags: &mut Tags, now: Instant) -> (CacheStatus, bool) {
        let entries = self.entries.read();
        let Some(entry) = entries.get(host) else {
            return (CacheStatus::Miss, true);
        };

        entry
            .last_used
            .store(self.millis_since_epoch(now), Ordering::Relaxed);

        let status = match entry.tags {
            Some(ref cached) => {
                tags.extend(cached.iter().map(str::to_owned));
                CacheStatus::Hit
            }
            None => CacheStatus::Negative,
        };

        (status, entry.expires_at <= now)
    }

    fn insert(&self, host: String, tags: Option<Tags>, expires_at: Instant, now: Instant) {
        let last_used = self.millis_since_epoch(now);
        let mut entries = self.entries.write();
        match entries.get_mut(&host) {
            Some(entry) => {
                entry.tags = tags;
                entry.expires_at = expires_at;
            }
            None => {
                entries.insert(
                    host,
                    CacheEntry {
                        tags,
                        expires_at,
                        last_used: AtomicU64::new(last_used),
                    },
                );
            }
        }
    }

    fn evict(&self, max_idle: Duration, now: Instant) -> usize {
        let threshold = self.millis_since_epoch(now).saturating_sub(max_idle.as_millis() as u64);
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.last_used.load(Ordering::Relaxed) >= threshold);
        before - entries.len()
    }
}

/// Requests a lookup of a host's metadata.
#[derive(Debug)]
pub struct LookupHost(pub String);

/// The interface of the [`CloudService`].
#[derive(Debug)]
pub enum CloudLookup {
    /// Looks up a host and caches the result.
    Lookup(LookupHost),
}

impl Interface for CloudLookup {}

impl FromMessage<LookupHost> for CloudLookup {
    type Response = NoResponse;

    fn from_message(message: LookupHost, _: ()) -> Self {
        Self::Lookup(message)
    }
}

/// Read access to the cloud cache for ingestion.
#[derive(Clone, Debug)]
pub struct CloudHandle {
    cache: Arc<CloudCache>,
    pending: Arc<Mutex<HashSet<String>>>,
    max_pending: usize,
    service: Addr<CloudLookup>,
}

impl CloudHandle {
    /// Applies cached tags of `host` and queues a lookup if the host is unknown or stale.
    ///
    /// Never blocks on the lookup.
    pub fn apply(&self, host: &str, tags: &mut Tags) -> CacheStatus {
        let (status, lookup) = self.cache.apply(host, tags, Instant::now());
        if lookup {
            self.request_lookup(host);
        }
        status
    }

    /// Returns the shared cache.
    pub fn cache(&self) -> &CloudCache {
        &self.cache
    }

    /// Queues a lookup unless one is already pending for the host.
    ///
    /// Returns `false` if the lookup queue is full.
    fn request_lookup(&self, host: &str) -> bool {
        {
            let mut pending = self.pending.lock();
            if pending.contains(host) {
                return true;
            }
            if pending.len() >= self.max_pending {
                metric!(counter(TallyCounters::CloudLookupsDropped) += 1);
                return false;
            }
            pending.insert(host.to_owned());
        }

        self.service.send(LookupHost(host.to_owned()));
        true
    }
}

type LookupResult = (String, Result<Option<Vec<String>>, LookupError>);

#[derive(Debug, thiserror::Error)]
enum LookupError {
    #[error("lookup timed out")]
    Timeout,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Service resolving host metadata through a [`CloudProvider`].
///
/// Runs at most `max_concurrent_lookups` lookups at a time. Further requests wait in the service
/// queue, which is bounded by the de-duplicated set of pending hosts.
pub struct CloudService {
    provider: Arc<dyn CloudProvider>,
    config: CloudConfig,
    cache: Arc<CloudCache>,
    pending: Arc<Mutex<HashSet<String>>>,
    lookups: FuturesUnordered<BoxFuture<'static, LookupResult>>,
}

impl CloudService {
    /// Creates the service for a provider.
    pub fn new(provider: Arc<dyn CloudProvider>, config: CloudConfig) -> Self {
        Self {
            provider,
            config,
            cache: Arc::new(CloudCache::new()),
            pending: Arc::new(Mutex::new(HashSet::new())),
            lookups: FuturesUnordered::new(),
        }
    }

    /// Starts the service and returns a handle for ingestion.
    pub fn start(self) -> CloudHandle {
        let cache = self.cache.clone();
        let pending = self.pending.clone();
        let max_pending = self.config.max_pending_lookups;
        let service = self.start_detached();

        CloudHandle {
            cache,
            pending,
            max_pending,
            service,
        }
    }

    fn handle_message(&mut self, message: CloudLookup) {
        let CloudLookup::Lookup(LookupHost(host)) = message;
        let lookup = self.provider.lookup(&host);
        let timeout = self.config.lookup_timeout();

        self.lookups.push(
            async move {
                let start = Instant::now();
                let result = match tokio::time::timeout(timeout, lookup).await {
                    Ok(result) => result.map_err(LookupError::from),
                    Err(_) => Err(LookupError::Timeout),
                };
                metric!(timer(TallyTimers::CloudLookupDuration) = start.elapsed());
                (host, result)
            }
            .boxed(),
        );
    }

    fn handle_result(&mut self, (host, result): LookupResult) {
        let now = Instant::now();
        let (tags, ttl, outcome) = match result {
            Ok(Some(tags)) => (
                Some(tags.into_iter().collect()),
                self.config.cache_refresh(),
                "found",
            ),
            Ok(None) => (None, self.config.cache_negative_ttl(), "not_found"),
            Err(error) => {
                tally_log::warn!(
                    error = &error as &dyn std::error::Error,
                    tags.host = host.as_str(),
                    tags.provider = self.provider.name(),
                    "cloud lookup failed"
                );
                let outcome = match error {
                    LookupError::Timeout => "timeout",
                    LookupError::Provider(_) => "error",
                };
                (None, self.config.cache_negative_ttl(), outcome)
            }
        };

        metric!(counter(TallyCounters::CloudLookup) += 1, result = outcome);
        self.pending.lock().remove(&host);
        self.cache.insert(host, tags, now + ttl, now);
    }

    fn handle_tick(&mut self) {
        let evicted = self.cache.evict(self.config.cache_evict(), Instant::now());
        if evicted > 0 {
            tally_log::debug!("evicted {evicted} hosts from the cloud cache");
        }

        metric!(gauge(TallyGauges::CloudCacheSize) = self.cache.len() as u64);
        metric!(gauge(TallyGauges::CloudLookupsInFlight) = self.lookups.len() as u64);
    }
}

impl Service for CloudService {
    type Interface = CloudLookup;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        let max_concurrent = self.config.max_concurrent_lookups.max(1);
        let mut ticker = tokio::time::interval(self.config.cache_refresh());

        tally_log::info!(provider = self.provider.name(), "cloud enricher started");

        loop {
            tokio::select! {
                // Bias towards finished lookups to make room for queued requests.
                biased;

                Some(result) = self.lookups.next() => self.handle_result(result),
                message = rx.recv(), if self.lookups.len() < max_concurrent => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                _ = ticker.tick() => self.handle_tick(),
            }
        }

        tally_log::info!("cloud enricher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tally_config::CloudProviderConfig;

    use super::*;

    fn config() -> CloudConfig {
        let mut config = CloudConfig::new(CloudProviderConfig::Static {
            hosts: BTreeMap::new(),
        });
        config.cache_refresh = 60;
        config.cache_negative_ttl = 10;
        config.cache_evict = 600;
        config
    }

    fn handle(hosts: &[(&str, &[&str])], config: CloudConfig) -> CloudHandle {
        let hosts = hosts
            .iter()
            .map(|&(host, tags)| {
                let tags = tags.iter().map(|&tag| tag.to_owned()).collect();
                (host.to_owned(), tags)
            })
            .collect();
        CloudService::new(Arc::new(StaticProvider::new(hosts)), config).start()
    }

    /// Lets the service process queued lookups.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrich_after_lookup() {
        tally_test::setup();
        let handle = handle(&[("10.0.0.1", &["region:eu"])], config());

        let mut tags = Tags::from(vec!["env:prod".to_owned()]);
        assert_eq!(handle.apply("10.0.0.1", &mut tags), CacheStatus::Miss);
        assert_eq!(tags.len(), 1);

        settle().await;

        assert_eq!(handle.apply("10.0.0.1", &mut tags), CacheStatus::Hit);
        assert_eq!(tags.to_string(), "env:prod,region:eu");
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_entry_retried_after_ttl() {
        tally_test::setup();
        let handle = handle(&[], config());

        let mut tags = Tags::new();
        assert_eq!(handle.apply("10.0.0.9", &mut tags), CacheStatus::Miss);
        settle().await;

        assert_eq!(handle.apply("10.0.0.9", &mut tags), CacheStatus::Negative);
        assert!(handle.pending.lock().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(handle.apply("10.0.0.9", &mut tags), CacheStatus::Negative);
        assert!(handle.pending.lock().contains("10.0.0.9"));
        assert!(tags.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_lookups_bounded() {
        tally_test::setup();
        let mut config = config();
        config.max_pending_lookups = 1;
        let handle = handle(&[], config);

        assert!(handle.request_lookup("10.0.0.1"));
        // De-duplicated while pending.
        assert!(handle.request_lookup("10.0.0.1"));
        assert!(!handle.request_lookup("10.0.0.2"));
    }

    #[test]
    fn test_evict_unused() {
        let cache = CloudCache::new();
        let start = cache.epoch;
        cache.insert("a".to_owned(), None, start, start);
        cache.insert("b".to_owned(), None, start, start);

        let mut tags = Tags::new();
        cache.apply("b", &mut tags, start + Duration::from_secs(50));

        assert_eq!(cache.evict(Duration::from_secs(30), start + Duration::from_secs(60)), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.entries.read().contains_key("b"));
    }
}
