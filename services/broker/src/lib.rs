//! Broker service library crate.
//!
//! Exposes the daemon's configuration and relay wiring for the `pylon-broker`
//! binary and its integration tests.
pub mod config;
pub mod relay;
