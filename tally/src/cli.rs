use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tally_config::{Config, OverridableConfig};

use crate::setup;

/// A statsd metrics aggregation daemon.
#[derive(Debug, Parser)]
#[command(name = "tally", version, propagate_version = true)]
struct Cli {
    /// The path to the config folder.
    #[arg(short, long, global = true, value_name = "DIR", env = "TALLY_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon.
    Run(RunArgs),
    /// Manage the configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Dump the effective configuration as YAML.
    Show,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// The address to receive metrics on.
    #[arg(short, long, value_name = "ADDR", env = "TALLY_BIND")]
    bind: Option<String>,

    /// The transport to receive metrics with.
    #[arg(long, value_parser = ["udp", "tcp"], env = "TALLY_MODE")]
    mode: Option<String>,

    /// The flush interval in milliseconds.
    #[arg(long, value_name = "MS", env = "TALLY_FLUSH_INTERVAL")]
    flush_interval: Option<String>,

    /// The maximum time to wait for the final flush on shutdown, in seconds.
    #[arg(long, value_name = "SECS", env = "TALLY_SHUTDOWN_TIMEOUT")]
    shutdown_timeout: Option<String>,

    /// Enable debug logging.
    #[arg(short, long, env = "TALLY_VERBOSE")]
    verbose: bool,

    /// Log in JSON format.
    #[arg(long, env = "TALLY_LOG_JSON")]
    json: bool,
}

impl RunArgs {
    fn into_overrides(self) -> OverridableConfig {
        OverridableConfig {
            mode: self.mode,
            bind: self.bind,
            flush_interval: self.flush_interval,
            log_level: self.verbose.then(|| "debug".to_owned()),
            log_format: self.json.then(|| "json".to_owned()),
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(|| PathBuf::from(".tally"));
    Config::from_path(&path)
        .with_context(|| format!("could not load config from {}", path.display()))
}

/// Runs the command line interface.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config)?;

    match cli.command {
        Command::Run(args) => {
            config.apply_override(args.into_overrides())?;
            run(config)
        }
        Command::Config {
            command: ConfigCommand::Show,
        } => show_config(&config),
    }
}

fn run(config: Config) -> Result<()> {
    // Initialize the logger first, so that config errors are logged in the configured format.
    tally_log::init(config.logging());
    config.validate().context("invalid configuration")?;

    let internal_metrics = setup::init_metrics(&config);
    setup::dump_spawn_infos(&config);

    tally_server::run(config, internal_metrics)
}

fn show_config(config: &Config) -> Result<()> {
    let yaml = config.to_yaml_string()?;
    io::stdout()
        .lock()
        .write_all(yaml.as_bytes())
        .context("could not write config")?;
    Ok(())
}
