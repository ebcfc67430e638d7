//! The Tally statsd aggregation daemon.
//!
//! Tally receives metrics in the statsd line protocol over UDP or TCP, aggregates them in memory
//! and periodically flushes the aggregates to one or more backends. Start it with:
//!
//! ```text
//! tally run --config ./config --bind 0.0.0.0:8125
//! ```
//!
//! The configuration is read from `config.yml` in the config folder. Without a config file, the
//! defaults apply. Use `tally config show` to print the effective configuration.

mod cli;
mod setup;

use std::process;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            tally_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
