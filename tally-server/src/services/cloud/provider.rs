use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::StatusCode;
use tally_config::CloudProviderConfig;
use url::Url;

/// An error returned by a [`CloudProvider`] lookup.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The request to the metadata service failed.
    #[error("failed to send lookup request")]
    Request(#[from] reqwest::Error),

    /// The metadata service responded with an unexpected status.
    #[error("metadata service responded with status {0}")]
    Status(StatusCode),
}

/// A source of host metadata.
///
/// Lookups may run concurrently. The returned future must not borrow from the provider.
pub trait CloudProvider: Send + Sync + 'static {
    /// The name of the provider, used in logs.
    fn name(&self) -> &'static str;

    /// Looks up the tags of a host.
    ///
    /// Returns `Ok(None)` if the provider does not know the host.
    fn lookup(&self, host: &str) -> BoxFuture<'static, Result<Option<Vec<String>>, ProviderError>>;
}

/// Looks up hosts in a fixed map from the configuration.
#[derive(Debug)]
pub struct StaticProvider {
    hosts: BTreeMap<String, Vec<String>>,
}

impl StaticProvider {
    /// Creates a provider for the given host map.
    pub fn new(hosts: BTreeMap<String, Vec<String>>) -> Self {
        Self { hosts }
    }
}

impl CloudProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    fn lookup(&self, host: &str) -> BoxFuture<'static, Result<Option<Vec<String>>, ProviderError>> {
        futures::future::ready(Ok(self.hosts.get(host).cloned())).boxed()
    }
}

/// Looks up hosts with `GET {url}/{host}`.
///
/// The service responds with a JSON list of tags, or with `404` if the host is unknown.
#[derive(Debug)]
pub struct HttpProvider {
    client: reqwest::Client,
    base: String,
}

impl HttpProvider {
    /// Creates a provider and its HTTP client.
    pub fn new(url: &Url) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base: url.as_str().trim_end_matches('/').to_owned(),
        })
    }
}

impl CloudProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    fn lookup(&self, host: &str) -> BoxFuture<'static, Result<Option<Vec<String>>, ProviderError>> {
        let request = self.client.get(format!("{}/{host}", self.base));

        async move {
            let response = request.send().await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => Ok(Some(response.json().await?)),
                status => Err(ProviderError::Status(status)),
            }
        }
        .boxed()
    }
}

/// Creates the provider selected in the configuration.
pub fn create_provider(config: &CloudProviderConfig) -> Result<Arc<dyn CloudProvider>, ProviderError> {
    Ok(match config {
        CloudProviderConfig::Static { hosts } => Arc::new(StaticProvider::new(hosts.clone())),
        CloudProviderConfig::Http { url } => Arc::new(HttpProvider::new(url)?),
    })
}
