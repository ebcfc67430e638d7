//! Foundational system components for Tally's services.
//!
//! Tally is made of services: units of work that own their state exclusively and communicate
//! through message channels. This crate provides the [`Service`] trait, addresses to send
//! messages with, and the [`Controller`] which propagates the process-wide shutdown signal.
#![warn(missing_docs)]

mod controller;
mod service;
mod statsd;

pub use self::controller::*;
pub use self::service::*;
