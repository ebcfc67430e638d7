use tally_config::{Config, Statser};
use tally_statsd::{ChannelSink, LogSink, MetricsClientConfig};

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        tally_log::info!("launching tally without config folder");
    } else {
        tally_log::info!(
            "launching tally from config folder {}",
            config.path().display()
        );
    }
    tally_log::info!("  receiver: {} on {}", config.receiver_mode(), config.bind_addr());
    tally_log::info!("  flush interval: {:?}", config.aggregator().flush_interval());

    let backends: Vec<_> = config.backends().iter().map(|b| b.name()).collect();
    tally_log::info!("  backends: {}", backends.join(", "));
    tally_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the internal metric system.
///
/// Returns the receiving end of the internal metrics channel if internal metrics are fed back
/// into the pipeline.
pub fn init_metrics(config: &Config) -> Option<crossbeam_channel::Receiver<Vec<u8>>> {
    let mut default_tags = config.internal_tags();
    if let Some(hostname) = config.hostname() {
        default_tags.insert("host".to_owned(), hostname);
    }

    let metrics_config = MetricsClientConfig {
        prefix: config.internal_namespace(),
        default_tags,
        default_sample_rate: config.internal_sample_rate().into(),
    };

    match config.statser() {
        Statser::Internal => {
            let (sink, rx) = ChannelSink::new(config.internal_queue_size());
            tally_statsd::init(metrics_config, sink);
            Some(rx)
        }
        Statser::Logging => {
            tally_statsd::init(metrics_config, LogSink);
            None
        }
        Statser::Null => None,
    }
}
