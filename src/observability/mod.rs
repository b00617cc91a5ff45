//! Observability for the MQTT-over-QUIC client
//!
//! Structured logging setup and span helpers. Connection statistics live in
//! [`crate::manager::stats`].

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, parse_level, parse_spans, LogFormat};

// Span macros for structured logging
pub use logging::{connection_span, publish_span};
