//! quinn-backed QUIC connector
//!
//! rustls keeps TLS 1.3 resumption state in memory only, so real 0-RTT is
//! available for reconnects within one process. The persisted ticket records
//! that a resumable session was issued; after a restart the in-memory cache is
//! empty and the first connection falls back to a full handshake.

use super::{QuicConnector, QuicHandshake, QuicLink};
use crate::config::{ConfigError, ConnectionConfig};
use crate::error::TransportError;
use crate::session::SessionTicket;
use crate::transport::link::{BoxedReader, BoxedWriter};
use crate::transport::tls::{self, TlsProfile};
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, ConnectionError, Endpoint, VarInt, ZeroRttAccepted};
use rustls::client::{
    ClientSessionMemoryCache, ClientSessionStore, Resumption, Tls12ClientSessionValue,
    Tls13ClientSessionValue,
};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::debug;

const SESSION_CACHE_SIZE: usize = 32;

/// Session store that counts the TLS 1.3 tickets the server issues
#[derive(Debug)]
struct TicketCapture {
    cache: ClientSessionMemoryCache,
    issued: AtomicU64,
}

impl TicketCapture {
    fn new() -> Self {
        Self {
            cache: ClientSessionMemoryCache::new(SESSION_CACHE_SIZE),
            issued: AtomicU64::new(0),
        }
    }

    fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

impl ClientSessionStore for TicketCapture {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.cache.set_kx_hint(server_name, group)
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.cache.kx_hint(server_name)
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.cache.set_tls12_session(server_name, value)
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.cache.tls12_session(server_name)
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        self.cache.remove_tls12_session(server_name)
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        self.issued.fetch_add(1, Ordering::SeqCst);
        self.cache.insert_tls13_ticket(server_name, value)
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'static>) -> Option<Tls13ClientSessionValue> {
        self.cache.take_tls13_ticket(server_name)
    }
}

/// Connects to the broker's QUIC port with quinn
pub struct QuinnConnector {
    config: Arc<ConnectionConfig>,
    client_config: ClientConfig,
    tickets: Arc<TicketCapture>,
    endpoint: OnceCell<Endpoint>,
}

impl QuinnConnector {
    pub fn new(config: Arc<ConnectionConfig>) -> Result<Self, ConfigError> {
        let tickets = Arc::new(TicketCapture::new());
        let mut tls = tls::client_config(&config, TlsProfile::Quic)?;
        tls.resumption = Resumption::store(tickets.clone());

        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| ConfigError::Tls(format!("QUIC crypto config error: {e}")))?;
        let mut client_config = ClientConfig::new(Arc::new(crypto));

        let idle = Duration::from_millis(config.quic.idle_timeout_ms);
        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(idle.try_into().map_err(|_| {
            ConfigError::InvalidConfig("quic.idle_timeout_ms is out of range".to_string())
        })?));
        transport.keep_alive_interval(Some(idle / 3));
        client_config.transport_config(Arc::new(transport));

        Ok(Self {
            config,
            client_config,
            tickets,
            endpoint: OnceCell::new(),
        })
    }

    async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let host = self.config.broker.host.as_str();
        let port = self.config.broker.quic_port;
        let target = format!("{host}:{port}");
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TransportError::unreachable(target.clone(), e))?
            .next()
            .ok_or_else(|| TransportError::unreachable(target, "no addresses resolved"))
    }

    async fn endpoint(&self, remote: SocketAddr) -> Result<&Endpoint, TransportError> {
        self.endpoint
            .get_or_try_init(|| async {
                let bind: SocketAddr = if remote.is_ipv6() {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                } else {
                    (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
                };
                Endpoint::client(bind).map_err(TransportError::from)
            })
            .await
    }
}

#[async_trait]
impl QuicConnector for QuinnConnector {
    async fn connect(&self, ticket: Option<&SessionTicket>) -> Result<QuicHandshake, TransportError> {
        let remote = self.resolve().await?;
        let endpoint = self.endpoint(remote).await?;
        let issued_before = self.tickets.issued();
        let started = Instant::now();

        let connecting = endpoint
            .connect_with(self.client_config.clone(), remote, self.config.server_name())
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let try_early = ticket.is_some() && self.config.session.enable_0rtt;
        let (connection, zero_rtt) = if try_early {
            match connecting.into_0rtt() {
                Ok((connection, accepted)) => (connection, Some(accepted)),
                Err(connecting) => {
                    debug!("No resumable TLS session in memory, using full handshake");
                    (connecting.await.map_err(|e| map_connection_error(remote, e))?, None)
                }
            }
        } else {
            (connecting.await.map_err(|e| map_connection_error(remote, e))?, None)
        };

        let handshake_latency = started.elapsed();
        let zero_rtt_attempted = zero_rtt.is_some();
        debug!(
            %remote,
            zero_rtt_attempted,
            handshake_latency_ms = handshake_latency.as_millis() as u64,
            "QUIC connection ready"
        );

        Ok(QuicHandshake {
            link: Arc::new(QuinnLink {
                connection,
                early: Mutex::new(zero_rtt),
                early_accepted: OnceCell::new(),
                tickets: self.tickets.clone(),
                issued_before,
                server_name: self.config.server_name().to_string(),
                ticket_lifetime: Duration::from_secs(self.config.session.ticket_lifetime_secs),
            }),
            zero_rtt_attempted,
            handshake_latency,
        })
    }
}

fn map_connection_error(remote: SocketAddr, error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::TimedOut => TransportError::unreachable(remote.to_string(), "handshake timed out"),
        ConnectionError::ConnectionClosed(close) => {
            TransportError::Handshake(format!("closed by peer: {close}"))
        }
        ConnectionError::TransportError(e) => TransportError::Handshake(e.to_string()),
        other => TransportError::Handshake(other.to_string()),
    }
}

struct QuinnLink {
    connection: Connection,
    early: Mutex<Option<ZeroRttAccepted>>,
    early_accepted: OnceCell<bool>,
    tickets: Arc<TicketCapture>,
    issued_before: u64,
    server_name: String,
    ticket_lifetime: Duration,
}

#[async_trait]
impl QuicLink for QuinnLink {
    async fn open_bi(&self) -> Result<(BoxedWriter, BoxedReader), TransportError> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        Ok((Box::new(send), Box::new(recv)))
    }

    async fn zero_rtt_accepted(&self) -> bool {
        *self
            .early_accepted
            .get_or_init(|| async {
                let pending = self.early.lock().unwrap_or_else(|p| p.into_inner()).take();
                match pending {
                    Some(accepted) => accepted.await,
                    None => false,
                }
            })
            .await
    }

    fn issued_ticket(&self) -> Option<SessionTicket> {
        if self.tickets.issued() <= self.issued_before {
            return None;
        }
        let id = uuid::Uuid::new_v4();
        Some(SessionTicket::new(
            id.as_bytes().to_vec(),
            self.server_name.clone(),
            self.ticket_lifetime,
        ))
    }

    async fn closed(&self) -> TransportError {
        TransportError::closed(self.connection.closed().await.to_string())
    }

    fn close_reason(&self) -> Option<String> {
        self.connection.close_reason().map(|e| e.to_string())
    }

    fn close(&self, reason: &str) {
        self.connection.close(VarInt::from_u32(0), reason.as_bytes());
    }
}
