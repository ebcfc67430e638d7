use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tally_config::HttpBackendConfig;
use tally_metrics::MetricBatch;
use url::Url;

use crate::services::backend::{Backend, BackendError};

/// Posts batches as JSON to an HTTP endpoint.
#[derive(Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    url: Url,
    skip_empty: bool,
}

impl HttpBackend {
    /// Creates a backend and its HTTP client.
    pub fn new(config: &HttpBackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            skip_empty: config.skip_empty,
        })
    }
}

impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send(&self, batch: Arc<MetricBatch>) -> BoxFuture<'static, Result<(), BackendError>> {
        if self.skip_empty && batch.is_empty() {
            return futures::future::ready(Ok(())).boxed();
        }

        let request = self.client.post(self.url.clone()).json(&*batch);

        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(BackendError::Status(status));
            }
            Ok(())
        }
        .boxed()
    }
}
