//! Serial-port sensor ingestion, aggregation, and CSV logging.
//!
//! One reader thread per serial port parses line-oriented records into typed
//! samples and pushes them onto a shared queue. A timer-driven aggregator
//! drains the queue on a fixed interval, collapses each sensor's burst into a
//! representative sample, derives configured aggregate channels, and fans the
//! results out to the latest-value [`feed::LiveFeed`] and an append-only CSV
//! log.

pub mod agent;
pub mod config;
pub mod feed;
pub mod reader;
pub mod sensor;
pub mod sink;
