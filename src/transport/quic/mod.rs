//! MQTT over QUIC
//!
//! One QUIC connection carries a control stream (CONNECT, SUBSCRIBE, PINGREQ,
//! DISCONNECT and overflow publishes) plus one stream per topic. Topic streams
//! fail independently; losing the control stream or the connection loses the
//! session.

mod connector;
mod stream_table;

pub use connector::QuinnConnector;

use super::link::{BoxedReader, BoxedWriter, FrameReader, FrameWriter};
use super::pending::CONTROL_STREAM;
use super::shared::{connect_packet, read_connack, SessionShared};
use super::{ActiveTransport, ConnectContext, ConnectOutcome, PublishRequest, TransportType};
use crate::error::{ConnectError, PublishError, SubscribeError, TransportError};
use crate::manager::stats::ConnectInfo;
use crate::protocol::QoS;
use crate::session::SessionTicket;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use stream_table::StreamTable;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a QUIC handshake
pub struct QuicHandshake {
    pub link: Arc<dyn QuicLink>,
    /// A resumable session was presented and streams may carry early data
    pub zero_rtt_attempted: bool,
    pub handshake_latency: Duration,
}

/// Establishes QUIC connections to the broker
#[async_trait]
pub trait QuicConnector: Send + Sync {
    /// Connect, attempting 0-RTT when `ticket` is present and resumption is enabled
    async fn connect(&self, ticket: Option<&SessionTicket>) -> Result<QuicHandshake, TransportError>;
}

/// A live QUIC connection
#[async_trait]
pub trait QuicLink: Send + Sync {
    async fn open_bi(&self) -> Result<(BoxedWriter, BoxedReader), TransportError>;

    /// Whether early data was accepted. Resolves once the handshake completes.
    async fn zero_rtt_accepted(&self) -> bool;

    /// A resumption ticket issued by the server on this connection
    fn issued_ticket(&self) -> Option<SessionTicket>;

    /// Resolves when the connection closes
    async fn closed(&self) -> TransportError;

    /// Set once the connection is closed
    fn close_reason(&self) -> Option<String>;

    fn close(&self, reason: &str);
}

struct QuicInner {
    link: Arc<dyn QuicLink>,
    shared: Arc<SessionShared>,
    control: Arc<FrameWriter>,
    streams: Arc<StreamTable>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QuicInner {
    fn stop_tasks(&self) {
        self.streams.abort_readers();
        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.iter() {
            task.abort();
        }
    }
}

impl Drop for QuicInner {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// MQTT session over a QUIC connection
#[derive(Clone)]
pub struct QuicTransport {
    inner: Arc<QuicInner>,
}

impl QuicTransport {
    /// Handshake, send CONNECT and wait for CONNACK, all within the connect timeout
    pub async fn connect(
        connector: &dyn QuicConnector,
        ticket: Option<&SessionTicket>,
        ctx: &ConnectContext,
    ) -> Result<ConnectOutcome, ConnectError> {
        let timeout = ctx.config.connect_timeout();
        match tokio::time::timeout(timeout, Self::establish(connector, ticket, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Transport(TransportError::Timeout(timeout))),
        }
    }

    async fn establish(
        connector: &dyn QuicConnector,
        ticket: Option<&SessionTicket>,
        ctx: &ConnectContext,
    ) -> Result<ConnectOutcome, ConnectError> {
        let started = Instant::now();
        let handshake = connector.connect(ticket).await?;
        let link = handshake.link.clone();

        match Self::start_session(handshake, ctx, started).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                link.close("session setup failed");
                Err(e)
            }
        }
    }

    async fn start_session(
        handshake: QuicHandshake,
        ctx: &ConnectContext,
        started: Instant,
    ) -> Result<ConnectOutcome, ConnectError> {
        let link = handshake.link;
        let shared = SessionShared::new(ctx);
        let connect_frame = shared.encode(&connect_packet(&ctx.config, &ctx.credentials))?;

        let (writer, reader) = link.open_bi().await?;
        let mut control = FrameWriter::new(writer);
        let mut reader = reader;
        let early_write = control.write_frame(&connect_frame).await;

        let mut zero_rtt_used = false;
        let mut zero_rtt_rejected = false;
        if handshake.zero_rtt_attempted {
            if link.zero_rtt_accepted().await && early_write.is_ok() {
                zero_rtt_used = true;
            } else {
                // early streams are gone, CONNECT goes again on a fresh control stream
                zero_rtt_rejected = true;
                ctx.stats.record_zero_rtt_rejected();
                warn!("0-RTT rejected by broker, resending CONNECT over 1-RTT");
                let (writer, fresh_reader) = link.open_bi().await?;
                control = FrameWriter::new(writer);
                reader = fresh_reader;
                control.write_frame(&connect_frame).await?;
            }
        } else {
            early_write?;
        }

        let mut reader = FrameReader::new(reader, shared.framer);
        let connack = read_connack(&mut reader).await?;
        let connect_latency = started.elapsed();
        ctx.stats.record_sent(connect_frame.len());

        let control = Arc::new(control);
        let streams = StreamTable::new(ctx.config.quic.max_topic_streams, link.clone(), shared.clone());
        let mut tasks = Vec::new();

        let read_shared = shared.clone();
        let read_writer = control.clone();
        tasks.push(tokio::spawn(async move {
            let failure = read_shared.clone().read_loop(reader, read_writer).await;
            debug!(reason = %failure, "Control stream ended");
            read_shared.mark_lost(failure.into_transport_error());
        }));

        if let Some(interval) = ctx.config.keep_alive() {
            tasks.push(tokio::spawn(
                shared.clone().keep_alive_loop(control.clone(), interval),
            ));
        }

        let watch_link = link.clone();
        let watch_shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                cause = watch_link.closed() => {
                    watch_shared.mark_lost(cause);
                }
                _ = watch_shared.closed() => {}
            }
            watch_link.close("connection lost");
        }));

        let info = ConnectInfo {
            transport: TransportType::Quic,
            connect_latency,
            handshake_latency: handshake.handshake_latency,
            zero_rtt_used,
            session_resumed: zero_rtt_used,
        };
        info!(
            connect_latency_ms = connect_latency.as_millis() as u64,
            handshake_latency_ms = handshake.handshake_latency.as_millis() as u64,
            zero_rtt = zero_rtt_used,
            session_present = connack.session_present,
            "MQTT session established over QUIC"
        );

        let new_ticket = link.issued_ticket();
        let transport = QuicTransport {
            inner: Arc::new(QuicInner {
                link,
                shared,
                control,
                streams,
                tasks: Mutex::new(tasks),
            }),
        };

        Ok(ConnectOutcome {
            transport: ActiveTransport::Quic(transport),
            info,
            session_present: connack.session_present,
            zero_rtt_rejected,
            new_ticket,
        })
    }

    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError> {
        let inner = &self.inner;
        if inner.shared.is_lost() {
            return Err(PublishError::ConnectionLost);
        }

        // opening can block on the peer's stream limit
        let timeout = inner.shared.operation_timeout();
        let opened = tokio::time::timeout(timeout, inner.streams.get_or_create_stream(topic)).await;
        let stream = match opened {
            Err(_) => {
                return Err(PublishError::WriteTimeout {
                    topic: topic.to_string(),
                    timeout,
                })
            }
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                if inner.shared.is_lost() || inner.link.close_reason().is_some() {
                    return Err(PublishError::ConnectionLost);
                }
                return Err(PublishError::StreamFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        match stream {
            Some(stream) => {
                let result = inner
                    .shared
                    .publish(&stream.writer, stream.tag, topic, payload, qos, |e| {
                        PublishError::StreamFailed {
                            topic: topic.to_string(),
                            reason: e.to_string(),
                        }
                    })
                    .await;
                match &result {
                    Err(PublishError::StreamFailed { reason, .. }) => {
                        inner.streams.discard(topic, stream.tag, reason).await;
                    }
                    // a timed-out write may have left half a frame behind
                    Err(_) if stream.writer.is_broken() => {
                        inner
                            .streams
                            .discard(topic, stream.tag, "write interrupted at deadline")
                            .await;
                    }
                    _ => {}
                }
                result
            }
            None => {
                let shared = inner.shared.clone();
                inner
                    .shared
                    .publish(&inner.control, CONTROL_STREAM, topic, payload, qos, move |e| {
                        shared.mark_lost(e);
                        PublishError::ConnectionLost
                    })
                    .await
            }
        }
    }

    /// All requests are in flight at once; each topic still uses its own stream
    pub async fn publish_batch(
        &self,
        requests: Vec<PublishRequest>,
    ) -> Vec<(String, Result<(), PublishError>)> {
        let publishes = requests.into_iter().map(|request| async move {
            let result = self
                .publish(&request.topic, request.payload, request.qos)
                .await;
            (request.topic, result)
        });
        futures::future::join_all(publishes).await
    }

    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, SubscribeError> {
        self.inner
            .shared
            .subscribe(&self.inner.control, CONTROL_STREAM, filter, qos)
            .await
    }

    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.shared.send_disconnect(&inner.control).await;
        inner
            .shared
            .mark_lost(TransportError::closed("disconnected by client"));
        inner.link.close("client disconnect");
        inner.stop_tasks();
    }

    pub fn abort(&self, reason: &str) {
        self.inner.shared.mark_lost(TransportError::closed(reason));
        self.inner.link.close(reason);
        self.inner.stop_tasks();
    }

    pub async fn closed(&self) -> TransportError {
        self.inner.shared.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_lost()
    }

    /// Topics currently holding a dedicated stream
    pub async fn open_topic_streams(&self) -> usize {
        self.inner.streams.len().await
    }
}
