//! MQTT over QUIC client
//!
//! An MQTT 3.1.1 client for constrained devices that prefers QUIC and falls
//! back to TLS over TCP when UDP is blocked.
//!
//! # Overview
//!
//! - QUIC transport with a control stream plus one stream per topic, so a
//!   slow topic never blocks another
//! - 0-RTT resumption from a persisted session ticket
//! - Automatic TCP+TLS fallback and reconnection with jittered backoff
//! - QoS 0 and QoS 1 publish, parallel publish, subscribe
//! - Lock-free connection statistics
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_quic_client::{ConnectionConfig, ConnectionManager, PublishRequest, QoS};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfig::new("broker.example.com", "sensor-42");
//! let manager = ConnectionManager::new(config)?;
//! manager.connect().await?;
//!
//! manager
//!     .publish("sensors/42/temperature", "21.5", QoS::AtLeastOnce)
//!     .await?;
//!
//! let results = manager
//!     .publish_parallel(vec![
//!         PublishRequest::new("sensors/42/humidity", "40", QoS::AtLeastOnce),
//!         PublishRequest::new("sensors/42/pressure", "1013", QoS::AtLeastOnce),
//!     ])
//!     .await;
//! assert!(results.values().all(|r| r.is_ok()));
//!
//! println!("{:?}", manager.stats());
//! manager.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig, Credentials};
pub use error::{
    ConnectError, ProtocolError, PublishError, StorageError, SubscribeError, TransportError,
};
pub use manager::{ConnectionManager, ConnectionState, ConnectionStatsSnapshot};
pub use protocol::{ConnectReturnCode, QoS};
pub use session::{SessionTicket, SessionTicketStore};
pub use transport::{IncomingMessage, PublishRequest, TransportType};
