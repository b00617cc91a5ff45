//! MQTT over TLS over TCP, the fallback transport
//!
//! Every packet shares one ordered byte stream, so a stalled topic stalls all
//! of them. Used only when QUIC cannot be established.

mod connector;

pub use connector::RustlsTcpConnector;

use super::link::{BoxedReader, BoxedWriter, FrameReader, FrameWriter};
use super::pending::CONTROL_STREAM;
use super::shared::{connect_packet, read_connack, SessionShared};
use super::{ActiveTransport, ConnectContext, ConnectOutcome, PublishRequest, TransportType};
use crate::error::{ConnectError, PublishError, SubscribeError, TransportError};
use crate::manager::stats::ConnectInfo;
use crate::protocol::QoS;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A TCP connection with TLS already negotiated
pub struct TcpHandshake {
    pub writer: BoxedWriter,
    pub reader: BoxedReader,
    pub handshake_latency: Duration,
}

/// Opens TLS-over-TCP connections to the broker
#[async_trait]
pub trait TcpConnector: Send + Sync {
    async fn connect(&self) -> Result<TcpHandshake, TransportError>;
}

struct TcpInner {
    shared: Arc<SessionShared>,
    writer: Arc<FrameWriter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpInner {
    fn stop_tasks(&self) {
        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.iter() {
            task.abort();
        }
    }
}

impl Drop for TcpInner {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// MQTT session over a single TLS stream
#[derive(Clone)]
pub struct TcpTlsTransport {
    inner: Arc<TcpInner>,
}

impl TcpTlsTransport {
    /// Connect, TLS handshake, CONNECT and CONNACK within the fallback timeout
    pub async fn connect(
        connector: &dyn TcpConnector,
        ctx: &ConnectContext,
    ) -> Result<ConnectOutcome, ConnectError> {
        let timeout = ctx.config.fallback_connect_timeout();
        match tokio::time::timeout(timeout, Self::establish(connector, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Transport(TransportError::Timeout(timeout))),
        }
    }

    async fn establish(
        connector: &dyn TcpConnector,
        ctx: &ConnectContext,
    ) -> Result<ConnectOutcome, ConnectError> {
        let started = Instant::now();
        let handshake = connector.connect().await?;
        let shared = SessionShared::new(ctx);

        let writer = Arc::new(FrameWriter::new(handshake.writer));
        let connect_frame = shared.encode(&connect_packet(&ctx.config, &ctx.credentials))?;
        writer.write_frame(&connect_frame).await?;
        ctx.stats.record_sent(connect_frame.len());

        let mut reader = FrameReader::new(handshake.reader, shared.framer);
        let connack = read_connack(&mut reader).await?;
        let connect_latency = started.elapsed();

        let mut tasks = Vec::new();
        let read_shared = shared.clone();
        let read_writer = writer.clone();
        tasks.push(tokio::spawn(async move {
            let failure = read_shared.clone().read_loop(reader, read_writer).await;
            debug!(reason = %failure, "TLS stream ended");
            read_shared.mark_lost(failure.into_transport_error());
        }));
        if let Some(interval) = ctx.config.keep_alive() {
            tasks.push(tokio::spawn(
                shared.clone().keep_alive_loop(writer.clone(), interval),
            ));
        }

        info!(
            connect_latency_ms = connect_latency.as_millis() as u64,
            session_present = connack.session_present,
            "MQTT session established over TCP+TLS"
        );

        let transport = TcpTlsTransport {
            inner: Arc::new(TcpInner {
                shared,
                writer,
                tasks: Mutex::new(tasks),
            }),
        };
        Ok(ConnectOutcome {
            transport: ActiveTransport::TcpTls(transport),
            info: ConnectInfo {
                transport: TransportType::TcpTls,
                connect_latency,
                handshake_latency: handshake.handshake_latency,
                zero_rtt_used: false,
                session_resumed: false,
            },
            session_present: connack.session_present,
            zero_rtt_rejected: false,
            new_ticket: None,
        })
    }

    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError> {
        let shared = self.inner.shared.clone();
        self.inner
            .shared
            .publish(&self.inner.writer, CONTROL_STREAM, topic, payload, qos, move |e| {
                shared.mark_lost(e);
                PublishError::ConnectionLost
            })
            .await
    }

    /// Issued in request order; the single stream serializes them anyway
    pub async fn publish_batch(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Vec<(String, Result<(), PublishError>)> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self
                .publish(&request.topic, request.payload, request.qos)
                .await;
            results.push((request.topic, result));
        }
        results
    }

    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, SubscribeError> {
        self.inner
            .shared
            .subscribe(&self.inner.writer, CONTROL_STREAM, filter, qos)
            .await
    }

    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.shared.send_disconnect(&inner.writer).await;
        inner
            .shared
            .mark_lost(TransportError::closed("disconnected by client"));
        inner.stop_tasks();
    }

    pub fn abort(&self, reason: &str) {
        self.inner.shared.mark_lost(TransportError::closed(reason));
        self.inner.stop_tasks();
    }

    pub async fn closed(&self) -> TransportError {
        self.inner.shared.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_lost()
    }
}
