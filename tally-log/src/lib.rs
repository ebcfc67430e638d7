//! Error reporting and logging for Tally.
//!
//! # Setup
//!
//! To enable logging, invoke the [`init`] function with a [`LogConfig`]. The configuration
//! implements `serde` traits, so it can be obtained from configuration files.
//!
//! ```
//! let log_config = tally_log::LogConfig {
//!     enable_backtraces: true,
//!     ..Default::default()
//! };
//!
//! tally_log::init(&log_config);
//! ```
//!
//! # Logging
//!
//! The basic use of the log crate is through the five logging macros: [`error!`], [`warn!`],
//! [`info!`], [`debug!`] and [`trace!`] where `error!` represents the highest-priority log
//! messages and `trace!` the lowest.
//!
//! Structured fields are passed before the message. Errors should be attached as a field
//! instead of being formatted into the message, so that their causes remain inspectable:
//!
//! ```
//! # let error = std::io::Error::other("oops");
//! tally_log::error!(
//!     error = &error as &dyn std::error::Error,
//!     tags.backend = "graphite",
//!     "failed to submit metrics",
//! );
//! ```
//!
//! # Testing
//!
//! For unit testing, there is a separate initialization macro [`init_test!`] that should be
//! called at the beginning of a test method. It enables test mode of the logger and customizes
//! log levels for the current crate.
//!
//! ```no_run
//! #[test]
//! fn test_something() {
//!     tally_log::init_test!();
//! }
//! ```

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
mod test;
#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{debug, enabled, error, info, trace, warn};
