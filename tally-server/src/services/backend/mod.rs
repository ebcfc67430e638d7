//! Sinks receiving the aggregated batch once per flush.
//!
//! Every backend gets the same [`MetricBatch`] behind an [`Arc`]. Submissions are best effort:
//! the flush service bounds each call with the configured backend timeout and a failing backend
//! never affects the others or the next flush.
use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tally_config::{BackendConfig, Config};
use tally_metrics::MetricBatch;

mod graphite;
mod http;
mod stdout;

pub use self::graphite::*;
pub use self::http::*;
pub use self::stdout::*;

/// An error returned by a [`Backend`] when a batch could not be submitted.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Writing to a file, stream or socket failed.
    #[error("failed to write batch")]
    Io(#[from] io::Error),

    /// The batch could not be serialized.
    #[error("failed to serialize batch")]
    Serialize(#[from] serde_json::Error),

    /// The HTTP request failed.
    #[error("failed to send request")]
    Request(#[from] reqwest::Error),

    /// The endpoint responded with an error status.
    #[error("endpoint responded with status {0}")]
    Status(reqwest::StatusCode),
}

/// A sink for aggregated metric batches.
pub trait Backend: Send + Sync + 'static {
    /// The name of the backend, used in logs and internal metrics.
    fn name(&self) -> &'static str;

    /// Submits a batch.
    ///
    /// The returned future must not borrow from the backend, as it is driven concurrently with
    /// the submissions of other backends.
    fn send(&self, batch: Arc<MetricBatch>) -> BoxFuture<'static, Result<(), BackendError>>;
}

/// A backend that discards all batches.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlackholeBackend;

impl Backend for BlackholeBackend {
    fn name(&self) -> &'static str {
        "blackhole"
    }

    fn send(&self, _batch: Arc<MetricBatch>) -> BoxFuture<'static, Result<(), BackendError>> {
        futures::future::ready(Ok(())).boxed()
    }
}

/// Creates all backends listed in the configuration.
pub fn create_backends(config: &Config) -> Result<Vec<Arc<dyn Backend>>, BackendError> {
    let mut backends: Vec<Arc<dyn Backend>> = Vec::with_capacity(config.backends().len());
    let disabled = config.aggregator().disabled_sub_metrics;

    for backend in config.backends() {
        tally_log::debug!(backend = backend.name(), "creating backend");
        backends.push(match backend {
            BackendConfig::Stdout { path } => {
                Arc::new(StdoutBackend::new(path.clone(), disabled))
            }
            BackendConfig::Graphite(graphite) => {
                Arc::new(GraphiteBackend::new(graphite, disabled))
            }
            BackendConfig::Http(http) => Arc::new(HttpBackend::new(http)?),
            BackendConfig::Blackhole => Arc::new(BlackholeBackend),
        });
    }

    Ok(backends)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_backends() {
        let config = Config::from_json_value(serde_json::json!({
            "backends": [
                {"type": "stdout"},
                {"type": "graphite", "address": "127.0.0.1:2003"},
                {"type": "http", "url": "http://127.0.0.1:8080/ingest"},
                {"type": "null"},
            ]
        }))
        .unwrap();

        let backends = create_backends(&config).unwrap();
        let names: Vec<_> = backends.iter().map(|backend| backend.name()).collect();
        assert_eq!(names, ["stdout", "graphite", "http", "blackhole"]);
    }
}
