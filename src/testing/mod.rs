//! Testing utilities and mock implementations
//!
//! An in-process MQTT broker plus QUIC and TCP connectors that talk to it, so
//! the connection manager can be exercised without a network.

pub mod mocks;

pub use mocks::*;
