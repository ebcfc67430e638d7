use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

/// Controls how tags are rendered in the graphite plaintext protocol.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStyle {
    /// Appends tags as `;key=value` to the metric path.
    #[default]
    Graphite,
    /// Drops all tags.
    None,
}

/// Configuration of a graphite backend.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GraphiteConfig {
    /// Address of the carbon plaintext listener.
    pub address: SocketAddr,
    /// Prefix prepended to counter paths.
    #[serde(default = "default_counter_prefix")]
    pub prefix_counter: String,
    /// Prefix prepended to gauge paths.
    #[serde(default = "default_gauge_prefix")]
    pub prefix_gauge: String,
    /// Prefix prepended to set paths.
    #[serde(default = "default_set_prefix")]
    pub prefix_set: String,
    /// Prefix prepended to timer paths.
    #[serde(default = "default_timer_prefix")]
    pub prefix_timer: String,
    /// Global prefix prepended before the per-type prefix.
    #[serde(default = "default_global_prefix")]
    pub global_prefix: String,
    /// Rendering of tags.
    #[serde(default)]
    pub tag_style: TagStyle,
}

fn default_counter_prefix() -> String {
    "counters".to_owned()
}

fn default_gauge_prefix() -> String {
    "gauges".to_owned()
}

fn default_set_prefix() -> String {
    "sets".to_owned()
}

fn default_timer_prefix() -> String {
    "timers".to_owned()
}

fn default_global_prefix() -> String {
    "stats".to_owned()
}

/// Configuration of an HTTP backend.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HttpBackendConfig {
    /// Endpoint receiving the JSON encoded batch with a `POST` request.
    pub url: Url,
    /// Skips flushes that contain neither metrics nor events.
    #[serde(default)]
    pub skip_empty: bool,
}

/// Configuration of a backend the aggregated batches are flushed to.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Writes batches as text lines to stdout or a file.
    Stdout {
        /// Appends to this file instead of writing to stdout.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    /// Sends batches with the graphite plaintext protocol.
    Graphite(GraphiteConfig),
    /// Posts batches as JSON to an HTTP endpoint.
    Http(HttpBackendConfig),
    /// Discards all batches.
    #[serde(alias = "null")]
    Blackhole,
}

impl BackendConfig {
    /// Returns the name of the backend type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stdout { .. } => "stdout",
            Self::Graphite(_) => "graphite",
            Self::Http(_) => "http",
            Self::Blackhole => "blackhole",
        }
    }
}
