//! TLS over TCP with tokio-rustls

use super::{TcpConnector, TcpHandshake};
use crate::config::{ConfigError, ConnectionConfig};
use crate::error::TransportError;
use crate::transport::tls::{self, TlsProfile};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

pub struct RustlsTcpConnector {
    config: Arc<ConnectionConfig>,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl RustlsTcpConnector {
    pub fn new(config: Arc<ConnectionConfig>) -> Result<Self, ConfigError> {
        let tls = tls::client_config(&config, TlsProfile::Tcp)?;
        let server_name = ServerName::try_from(config.server_name().to_string()).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "Invalid TLS server name '{}': {e}",
                config.server_name()
            ))
        })?;
        Ok(Self {
            config,
            connector: TlsConnector::from(Arc::new(tls)),
            server_name,
        })
    }
}

#[async_trait]
impl TcpConnector for RustlsTcpConnector {
    async fn connect(&self) -> Result<TcpHandshake, TransportError> {
        let host = self.config.broker.host.as_str();
        let port = self.config.broker.tcp_port;
        let started = Instant::now();

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::unreachable(format!("{host}:{port}"), e))?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let handshake_latency = started.elapsed();
        debug!(
            host,
            port,
            handshake_latency_ms = handshake_latency.as_millis() as u64,
            "TLS handshake complete"
        );

        let (reader, writer) = tokio::io::split(stream);
        Ok(TcpHandshake {
            writer: Box::new(writer),
            reader: Box::new(reader),
            handshake_latency,
        })
    }
}
