pub mod aggregator;
pub mod backend;
pub mod cloud;
pub mod dispatcher;
pub mod flush;
pub mod internal;
pub mod receiver;
pub mod stats;
