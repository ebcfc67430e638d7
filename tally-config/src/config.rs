use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tally_metrics::{AggregatorConfig, ParserConfig};

use crate::backend::BackendConfig;
use crate::cloud::CloudConfig;

type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Defines the source of a config error.
#[derive(Debug)]
enum ConfigErrorSource {
    /// An error occurring independently.
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<BoxError>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            inner: Some(inner.into()),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: &'static str) -> Self
    where
        E: Into<BoxError>,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => self.kind.fmt(f),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

trait ConfigObject: DeserializeOwned + Serialize {
    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.yml", Self::name()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))
    }
}

/// Structure used to hold information about configuration overrides via CLI parameters or
/// environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The receiver mode, `udp` or `tcp`.
    pub mode: Option<String>,
    /// The address to receive metrics on.
    pub bind: Option<String>,
    /// The flush interval in milliseconds.
    pub flush_interval: Option<String>,
    /// The log level.
    pub log_level: Option<String>,
    /// The log format.
    pub log_format: Option<String>,
    /// The shutdown timeout in seconds.
    pub shutdown_timeout: Option<String>,
}

/// The transport used to receive metrics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverMode {
    /// Datagrams, each containing one or more lines.
    #[default]
    Udp,
    /// A stream listener reading newline delimited lines per connection.
    Tcp,
}

/// The error returned when parsing a [`ReceiverMode`] fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid receiver mode")]
pub struct ParseReceiverModeError;

impl FromStr for ReceiverMode {
    type Err = ParseReceiverModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            _ => Err(ParseReceiverModeError),
        }
    }
}

impl fmt::Display for ReceiverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("udp"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

/// Ingestion settings.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Receiver {
    mode: ReceiverMode,
    bind: SocketAddr,
    max_readers: usize,
    receive_batch_size: usize,
    conn_per_reader: bool,
    max_packet_size: usize,
    max_line_length: usize,
    max_parsers: usize,
    parser_queue_size: usize,
}

impl Default for Receiver {
    fn default() -> Self {
        Self {
            mode: ReceiverMode::default(),
            bind: SocketAddr::from(([0, 0, 0, 0], 8125)),
            max_readers: num_cpus::get().min(8),
            receive_batch_size: 50,
            conn_per_reader: false,
            max_packet_size: 65535,
            max_line_length: 65536,
            max_parsers: num_cpus::get(),
            parser_queue_size: 1000,
        }
    }
}

/// Where internal metrics are sent.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Statser {
    /// Feeds internal metrics into the daemon's own pipeline.
    #[default]
    Internal,
    /// Logs internal metrics at info level.
    Logging,
    /// Discards internal metrics.
    Null,
}

/// Internal metrics settings.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Internal {
    statser: Statser,
    namespace: String,
    tags: Vec<String>,
    hostname: Option<String>,
    heartbeat_enabled: bool,
    sample_rate: f64,
    queue_size: usize,
}

impl Default for Internal {
    fn default() -> Self {
        Self {
            statser: Statser::default(),
            namespace: "statsd".to_owned(),
            tags: Vec::new(),
            hostname: None,
            heartbeat_enabled: false,
            sample_rate: 1.0,
            queue_size: 10_000,
        }
    }
}

/// Process limits.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Limits {
    shutdown_timeout: u64,
    max_thread_count: usize,
    backend_timeout_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            shutdown_timeout: 10,
            max_thread_count: num_cpus::get(),
            backend_timeout_ms: 5000,
        }
    }
}

fn default_backends() -> Vec<BackendConfig> {
    vec![BackendConfig::Stdout { path: None }]
}

#[derive(Serialize, Deserialize, Debug)]
struct ConfigValues {
    #[serde(default)]
    receiver: Receiver,
    #[serde(default)]
    parser: ParserConfig,
    #[serde(default)]
    aggregator: AggregatorConfig,
    #[serde(default = "default_backends")]
    backends: Vec<BackendConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cloud: Option<CloudConfig>,
    #[serde(default)]
    internal: Internal,
    #[serde(default)]
    limits: Limits,
    #[serde(default)]
    logging: tally_log::LogConfig,
}

impl Default for ConfigValues {
    fn default() -> Self {
        Self {
            receiver: Receiver::default(),
            parser: ParserConfig::default(),
            aggregator: AggregatorConfig::default(),
            backends: default_backends(),
            cloud: None,
            internal: Internal::default(),
            limits: Limits::default(),
            logging: tally_log::LogConfig::default(),
        }
    }
}

impl ConfigObject for ConfigValues {
    fn name() -> &'static str {
        "config"
    }
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// If the folder does not contain a `config.yml`, the default configuration is used.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let values = if Self::config_exists(&path) {
            ConfigValues::load(&path)?
        } else {
            ConfigValues::default()
        };

        Ok(Config { values, path })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let receiver = &mut self.values.receiver;

        if let Some(mode) = overrides.mode {
            receiver.mode = mode
                .parse()
                .map_err(|err| ConfigError::for_field(err, "mode"))?;
        }

        if let Some(bind) = overrides.bind {
            receiver.bind = bind
                .parse()
                .map_err(|err| ConfigError::for_field(err, "bind"))?;
        }

        if let Some(flush_interval) = overrides.flush_interval {
            self.values.aggregator.flush_interval_ms = flush_interval
                .parse()
                .map_err(|err| ConfigError::for_field(err, "flush_interval"))?;
        }

        let logging = &mut self.values.logging;
        if let Some(level) = overrides.log_level {
            logging.level = level
                .parse()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        if let Some(format) = overrides.log_format {
            logging.format = format
                .parse()
                .map_err(|err| ConfigError::for_field(err, "log_format"))?;
        }

        if let Some(shutdown_timeout) = overrides.shutdown_timeout {
            self.values.limits.shutdown_timeout = shutdown_timeout
                .parse()
                .map_err(|err| ConfigError::for_field(err, "shutdown_timeout"))?;
        }

        Ok(self)
    }

    /// Checks the configuration for values that cannot be used to start the server.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.values
            .aggregator
            .validate()
            .map_err(|err| ConfigError::for_field(err, "aggregator"))?;

        let receiver = &self.values.receiver;
        if receiver.max_readers == 0 {
            return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("max_readers"));
        }
        if receiver.max_parsers == 0 {
            return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("max_parsers"));
        }
        if receiver.receive_batch_size == 0 {
            return Err(
                ConfigError::new(ConfigErrorKind::InvalidValue).field("receive_batch_size")
            );
        }

        let sample_rate = self.values.internal.sample_rate;
        if !(sample_rate > 0.0 && sample_rate <= 1.0) {
            return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("sample_rate"));
        }

        Ok(())
    }

    /// Checks if the config is already initialized.
    pub fn config_exists<P: AsRef<Path>>(path: P) -> bool {
        fs::metadata(ConfigValues::path(path.as_ref())).is_ok()
    }

    /// Returns the filename of the config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the receiver mode.
    pub fn receiver_mode(&self) -> ReceiverMode {
        self.values.receiver.mode
    }

    /// Returns the address to receive metrics on.
    pub fn bind_addr(&self) -> SocketAddr {
        self.values.receiver.bind
    }

    /// Returns the number of concurrent read loops.
    pub fn max_readers(&self) -> usize {
        self.values.receiver.max_readers
    }

    /// Returns the maximum number of datagrams read into one batch.
    pub fn receive_batch_size(&self) -> usize {
        self.values.receiver.receive_batch_size
    }

    /// Returns `true` if every read loop binds its own socket with `SO_REUSEPORT`.
    pub fn conn_per_reader(&self) -> bool {
        self.values.receiver.conn_per_reader
    }

    /// Returns the size of the datagram receive buffer.
    pub fn max_packet_size(&self) -> usize {
        self.values.receiver.max_packet_size
    }

    /// Returns the maximum length of a line received over TCP.
    pub fn max_line_length(&self) -> usize {
        self.values.receiver.max_line_length
    }

    /// Returns the number of parser tasks.
    pub fn max_parsers(&self) -> usize {
        self.values.receiver.max_parsers
    }

    /// Returns the capacity of the channel between readers and parsers, counted in batches.
    pub fn parser_queue_size(&self) -> usize {
        self.values.receiver.parser_queue_size
    }

    /// Returns the parser configuration.
    pub fn parser(&self) -> &ParserConfig {
        &self.values.parser
    }

    /// Returns the aggregator configuration.
    pub fn aggregator(&self) -> &AggregatorConfig {
        &self.values.aggregator
    }

    /// Returns the configured backends.
    pub fn backends(&self) -> &[BackendConfig] {
        &self.values.backends
    }

    /// Returns the timeout for submitting one batch to a backend.
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.values.limits.backend_timeout_ms)
    }

    /// Returns the cloud enricher configuration, if enabled.
    pub fn cloud(&self) -> Option<&CloudConfig> {
        self.values.cloud.as_ref()
    }

    /// Returns where internal metrics are sent.
    pub fn statser(&self) -> Statser {
        self.values.internal.statser
    }

    /// Returns the prefix for internal metrics.
    pub fn internal_namespace(&self) -> &str {
        &self.values.internal.namespace
    }

    /// Returns the default tags of internal metrics.
    ///
    /// Tags without a value map to an empty string.
    pub fn internal_tags(&self) -> BTreeMap<String, String> {
        self.values
            .internal
            .tags
            .iter()
            .map(|tag| match tag.split_once(':') {
                Some((key, value)) => (key.to_owned(), value.to_owned()),
                None => (tag.clone(), String::new()),
            })
            .collect()
    }

    /// Returns the hostname reported with internal metrics.
    ///
    /// Defaults to the hostname of the machine.
    pub fn hostname(&self) -> Option<String> {
        self.values.internal.hostname.clone().or_else(|| {
            hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
        })
    }

    /// Returns `true` if a heartbeat gauge is emitted on every flush.
    pub fn heartbeat_enabled(&self) -> bool {
        self.values.internal.heartbeat_enabled
    }

    /// Returns the sample rate of internal metrics.
    pub fn internal_sample_rate(&self) -> f64 {
        self.values.internal.sample_rate
    }

    /// Returns the capacity of the internal metrics queue, counted in packets.
    pub fn internal_queue_size(&self) -> usize {
        self.values.internal.queue_size
    }

    /// Returns the maximum time to wait for a graceful shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }

    /// Returns the maximum number of worker threads of the runtime.
    pub fn max_thread_count(&self) -> usize {
        self.values.limits.max_thread_count.max(1)
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &tally_log::LogConfig {
        &self.values.logging
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            values: ConfigValues::default(),
            path: PathBuf::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tally_log::{Level, LogFormat};

    use crate::backend::{GraphiteConfig, TagStyle};
    use crate::cloud::CloudProviderConfig;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:8125".parse().unwrap());
        assert_eq!(config.receiver_mode(), ReceiverMode::Udp);
        assert_eq!(config.receive_batch_size(), 50);
        assert_eq!(config.aggregator().percentiles, vec![90.0]);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.internal_namespace(), "statsd");
        assert!(matches!(config.backends(), [BackendConfig::Stdout { path: None }]));
        assert!(config.cloud().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_path_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.max_line_length(), 65536);
    }

    #[test]
    fn test_from_path_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("config.yml")).unwrap();
        file.write_all(
            br#"
receiver:
  mode: tcp
  bind: 127.0.0.1:9125
aggregator:
  flush_interval_ms: 10000
  percentiles: [90, 99.9, -10]
  expiry_interval_gauge: 0
backends:
  - type: graphite
    address: 127.0.0.1:2003
  - type: "null"
cloud:
  provider:
    type: static
    hosts:
      10.0.0.1: ["region:eu"]
  cache_refresh: 30
"#,
        )
        .unwrap();

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.receiver_mode(), ReceiverMode::Tcp);
        assert_eq!(config.bind_addr(), "127.0.0.1:9125".parse().unwrap());
        assert_eq!(config.aggregator().flush_interval(), Duration::from_secs(10));
        assert_eq!(config.aggregator().percentiles, vec![90.0, 99.9, -10.0]);

        match config.backends() {
            [BackendConfig::Graphite(GraphiteConfig {
                tag_style,
                global_prefix,
                ..
            }), BackendConfig::Blackhole] => {
                assert_eq!(*tag_style, TagStyle::Graphite);
                assert_eq!(global_prefix, "stats");
            }
            other => panic!("unexpected backends {other:?}"),
        }

        let cloud = config.cloud().unwrap();
        assert_eq!(cloud.cache_refresh(), Duration::from_secs(30));
        assert_eq!(cloud.cache_negative_ttl(), Duration::from_secs(60));
        assert!(matches!(cloud.provider, CloudProviderConfig::Static { .. }));
    }

    #[test]
    fn test_from_path_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yml"), "receiver: [").unwrap();

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
        assert!(error.to_string().contains("(file "));
        assert!(error.source().is_some());
    }

    #[test]
    fn test_apply_override() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                mode: Some("tcp".to_owned()),
                bind: Some("127.0.0.1:1234".to_owned()),
                flush_interval: Some("250".to_owned()),
                log_level: Some("debug".to_owned()),
                log_format: Some("json".to_owned()),
                shutdown_timeout: Some("3".to_owned()),
            })
            .unwrap();

        assert_eq!(config.receiver_mode(), ReceiverMode::Tcp);
        assert_eq!(config.bind_addr(), "127.0.0.1:1234".parse().unwrap());
        assert_eq!(config.aggregator().flush_interval_ms, 250);
        assert_eq!(config.logging().level, Level::Debug);
        assert_eq!(config.logging().format, LogFormat::Json);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_apply_override_invalid() {
        let mut config = Config::default();
        let error = config
            .apply_override(OverridableConfig {
                bind: Some("not an address".to_owned()),
                ..Default::default()
            })
            .unwrap_err();

        insta::assert_snapshot!(error, @"invalid config value (field bind)");
    }

    #[test]
    fn test_validate_percentiles() {
        let config = Config::from_json_value(serde_json::json!({
            "aggregator": {"percentiles": [150]}
        }))
        .unwrap();

        let error = config.validate().unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
    }

    #[test]
    fn test_internal_tags() {
        let config = Config::from_json_value(serde_json::json!({
            "internal": {"tags": ["env:prod", "canary"]}
        }))
        .unwrap();

        let tags = config.internal_tags();
        assert_eq!(tags["env"], "prod");
        assert_eq!(tags["canary"], "");
    }

    #[test]
    fn test_yaml_roundtrip_defaults() {
        let config = Config::default();
        let yaml = config.to_yaml_string().unwrap();
        assert!(yaml.contains("receiver:"));
        assert!(yaml.contains("type: stdout"));
    }
}
