//! Configuration for the Tally CLI and server.
//!
//! The configuration is loaded from `config.yml` in a configuration folder. Every section is
//! optional and falls back to defaults, so a missing file is equivalent to an empty one:
//!
//! ```yaml
//! receiver:
//!   bind: 0.0.0.0:8125
//!   mode: udp
//! aggregator:
//!   flush_interval_ms: 10000
//!   percentiles: [90, 99]
//! backends:
//!   - type: graphite
//!     address: 127.0.0.1:2003
//! logging:
//!   level: info
//! ```
//!
//! Individual values can be overridden from the command line or environment with
//! [`Config::apply_override`].
#![warn(missing_docs)]

mod backend;
mod cloud;
mod config;

pub use backend::*;
pub use cloud::*;
pub use config::*;
