//! Per-connection state and loops common to both transports
//!
//! `SessionShared` owns the pending-operation table, the loss signal and the
//! keep-alive bookkeeping for one live connection. Transports hand it their
//! stream halves; it runs the read loops and the publish/subscribe
//! request-response logic.

use super::link::{FrameReader, FrameWriter, ReadFailure};
use super::pending::{Abort, Ack, OperationKind, PendingTable, StreamTag, CONTROL_STREAM};
use super::{ConnectContext, IncomingMessage};
use crate::config::ConnectionConfig;
use crate::config::Credentials;
use crate::error::{ConnectError, ProtocolError, PublishError, SubscribeError, TransportError};
use crate::manager::stats::StatsRecorder;
use crate::protocol::{
    ConnAck, Connect, MqttFramer, Packet, Publish, QoS, Subscribe, SubscribeReturnCode,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Upper bound on flushing DISCONNECT during a local disconnect
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct SessionShared {
    pub pending: PendingTable,
    pub framer: MqttFramer,
    pub stats: Arc<StatsRecorder>,
    incoming: mpsc::Sender<IncomingMessage>,
    operation_timeout: Duration,
    awaiting_pong: AtomicBool,
    lost: watch::Sender<Option<TransportError>>,
}

impl SessionShared {
    pub fn new(ctx: &ConnectContext) -> Arc<Self> {
        let (lost, _) = watch::channel(None);
        Arc::new(Self {
            pending: PendingTable::new(),
            framer: MqttFramer::new(ctx.config.broker.max_packet_size),
            stats: ctx.stats.clone(),
            incoming: ctx.incoming.clone(),
            operation_timeout: ctx.config.operation_timeout(),
            awaiting_pong: AtomicBool::new(false),
            lost,
        })
    }

    /// Record the first cause of connection loss and fail everything in flight.
    /// Returns false if the connection was already marked lost.
    pub fn mark_lost(&self, cause: TransportError) -> bool {
        let first = self.lost.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause.clone());
            true
        });
        if first {
            let failed = self.pending.fail_all();
            debug!(%cause, failed_operations = failed, "Connection marked lost");
        }
        first
    }

    pub fn is_lost(&self) -> bool {
        self.lost.borrow().is_some()
    }

    pub async fn closed(&self) -> TransportError {
        let mut rx = self.lost.subscribe();
        let result = rx.wait_for(|cause| cause.is_some()).await.map(|cause| cause.clone());
        match result {
            Ok(Some(cause)) => cause,
            _ => TransportError::closed("connection state dropped"),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn encode(&self, packet: &Packet) -> Result<Bytes, ProtocolError> {
        self.framer.encode_to_bytes(packet)
    }

    /// Publish on `writer`. Write failures are mapped by the caller because
    /// their meaning depends on which stream failed.
    ///
    /// One deadline covers queueing for the stream, the write and, for QoS 1,
    /// the PUBACK.
    pub async fn publish<F>(
        &self,
        writer: &FrameWriter,
        stream: StreamTag,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        on_write_error: F,
    ) -> Result<(), PublishError>
    where
        F: FnOnce(TransportError) -> PublishError,
    {
        if self.is_lost() {
            return Err(PublishError::ConnectionLost);
        }
        let deadline = Instant::now() + self.operation_timeout;

        if qos == QoS::AtMostOnce {
            let frame = self.encode(&Packet::Publish(Publish::new(topic, payload, qos)))?;
            return match tokio::time::timeout_at(deadline, writer.write_frame(&frame)).await {
                Ok(Ok(())) => {
                    self.stats.record_sent(frame.len());
                    Ok(())
                }
                Ok(Err(e)) => Err(on_write_error(e)),
                Err(_) => {
                    self.write_timed_out(writer, stream);
                    warn!(topic, stream, "PUBLISH not written in time");
                    Err(PublishError::WriteTimeout {
                        topic: topic.to_string(),
                        timeout: self.operation_timeout,
                    })
                }
            };
        }

        let kind = OperationKind::Publish {
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
        };
        let (packet_id, ack) = self
            .pending
            .register(kind, stream)
            .ok_or(PublishError::PacketIdsExhausted)?;

        let packet = Packet::Publish(Publish::new(topic, payload, qos).with_packet_id(packet_id));
        let frame = match self.encode(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.remove(packet_id);
                return Err(e.into());
            }
        };
        let timed_out = PublishError::OperationTimeout {
            packet_id,
            topic: topic.to_string(),
            timeout: self.operation_timeout,
        };

        match tokio::time::timeout_at(deadline, writer.write_frame(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pending.remove(packet_id);
                return Err(on_write_error(e));
            }
            Err(_) => {
                self.pending.remove(packet_id);
                self.write_timed_out(writer, stream);
                warn!(topic, packet_id, stream, "PUBLISH not written in time");
                return Err(timed_out);
            }
        }
        self.stats.record_sent(frame.len());
        trace!(topic, packet_id, stream, "PUBLISH written, awaiting PUBACK");

        match tokio::time::timeout_at(deadline, ack).await {
            Ok(Ok(Ok(_))) => Ok(()),
            Ok(Ok(Err(Abort::StreamFailed(reason)))) => Err(PublishError::StreamFailed {
                topic: topic.to_string(),
                reason,
            }),
            Ok(Ok(Err(Abort::ConnectionLost))) | Ok(Err(_)) => Err(PublishError::ConnectionLost),
            Err(_) => {
                self.pending.remove(packet_id);
                self.stats.record_operation_timeout();
                warn!(topic, packet_id, "PUBACK not received in time");
                Err(timed_out)
            }
        }
    }

    /// Subscribe on the control stream and return the granted QoS
    pub async fn subscribe(
        &self,
        writer: &FrameWriter,
        stream: StreamTag,
        filter: &str,
        qos: QoS,
    ) -> Result<QoS, SubscribeError> {
        if self.is_lost() {
            return Err(SubscribeError::ConnectionLost);
        }
        let deadline = Instant::now() + self.operation_timeout;

        let kind = OperationKind::Subscribe {
            filter: filter.to_string(),
        };
        let (packet_id, ack) = self
            .pending
            .register(kind, stream)
            .ok_or(SubscribeError::PacketIdsExhausted)?;

        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![(filter.to_string(), qos)],
        });
        let frame = match self.encode(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.remove(packet_id);
                return Err(e.into());
            }
        };
        let timed_out = SubscribeError::OperationTimeout {
            packet_id,
            filter: filter.to_string(),
            timeout: self.operation_timeout,
        };

        match tokio::time::timeout_at(deadline, writer.write_frame(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pending.remove(packet_id);
                self.mark_lost(e);
                return Err(SubscribeError::ConnectionLost);
            }
            Err(_) => {
                self.pending.remove(packet_id);
                self.write_timed_out(writer, stream);
                warn!(filter, packet_id, "SUBSCRIBE not written in time");
                return Err(timed_out);
            }
        }

        match tokio::time::timeout_at(deadline, ack).await {
            Ok(Ok(Ok(Ack::Subscribed(codes)))) => match codes.first() {
                Some(SubscribeReturnCode::Granted(granted)) => Ok(*granted),
                Some(SubscribeReturnCode::Failure) => Err(SubscribeError::Rejected {
                    filter: filter.to_string(),
                }),
                None => Err(SubscribeError::Protocol(ProtocolError::Malformed {
                    packet: "SUBACK",
                    reason: "no return codes".to_string(),
                })),
            },
            Ok(Ok(Ok(Ack::Published))) => Err(SubscribeError::Protocol(
                ProtocolError::UnexpectedPacket {
                    expected: "SUBACK",
                    got: "PUBACK",
                },
            )),
            Ok(Ok(Err(_))) | Ok(Err(_)) => Err(SubscribeError::ConnectionLost),
            Err(_) => {
                self.pending.remove(packet_id);
                self.stats.record_operation_timeout();
                Err(timed_out)
            }
        }
    }

    /// A write gave up at its deadline. Half a frame on the control stream
    /// leaves nothing usable, so the connection goes with it.
    fn write_timed_out(&self, writer: &FrameWriter, stream: StreamTag) {
        self.stats.record_operation_timeout();
        if stream == CONTROL_STREAM && writer.is_broken() {
            self.mark_lost(TransportError::Timeout(self.operation_timeout));
        }
    }

    /// Best-effort DISCONNECT and half-close, bounded so a stalled stream
    /// cannot hold up a local disconnect
    pub async fn send_disconnect(&self, writer: &FrameWriter) {
        if self.is_lost() {
            return;
        }
        let frame = match self.encode(&Packet::Disconnect) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Failed to encode DISCONNECT");
                return;
            }
        };
        let grace = self.operation_timeout.min(DISCONNECT_GRACE);
        let send = async {
            if let Err(e) = writer.write_frame(&frame).await {
                debug!(error = %e, "Failed to send DISCONNECT");
            }
            writer.shutdown().await;
        };
        if tokio::time::timeout(grace, send).await.is_err() {
            debug!(grace_ms = grace.as_millis() as u64, "DISCONNECT not flushed in time");
        }
    }

    /// Dispatch one packet received after CONNACK
    async fn handle_packet(&self, packet: Packet, writer: &FrameWriter) -> Result<(), ProtocolError> {
        self.stats.touch();
        match packet {
            Packet::PubAck { packet_id } => {
                if !self.pending.complete(packet_id, Ack::Published) {
                    debug!(packet_id, "PUBACK for unknown packet id");
                }
                Ok(())
            }
            Packet::SubAck(suback) => {
                if !self
                    .pending
                    .complete(suback.packet_id, Ack::Subscribed(suback.return_codes))
                {
                    debug!(packet_id = suback.packet_id, "SUBACK for unknown packet id");
                }
                Ok(())
            }
            Packet::PingResp => {
                self.awaiting_pong.store(false, Ordering::SeqCst);
                trace!("PINGRESP received");
                Ok(())
            }
            Packet::Publish(publish) => {
                self.stats.record_received();
                if let Some(packet_id) = publish.packet_id {
                    let frame = self.encode(&Packet::PubAck { packet_id })?;
                    match tokio::time::timeout(self.operation_timeout, writer.write_frame(&frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(error = %e, packet_id, "Failed to PUBACK incoming message"),
                        Err(_) => warn!(packet_id, "PUBACK for incoming message not written in time"),
                    }
                }
                let message = IncomingMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                    dup: publish.dup,
                };
                if let Err(e) = self.incoming.try_send(message) {
                    warn!(error = %e, "Incoming message dropped, receiver full or gone");
                }
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedPacket {
                expected: "PUBACK, SUBACK, PINGRESP or PUBLISH",
                got: other.name(),
            }),
        }
    }

    /// Read packets from one stream until it ends; returns why it ended
    pub async fn read_loop(
        self: Arc<Self>,
        mut reader: FrameReader,
        writer: Arc<FrameWriter>,
    ) -> ReadFailure {
        loop {
            let packet = match reader.next_packet().await {
                Ok(packet) => packet,
                Err(failure) => return failure,
            };
            if let Err(e) = self.handle_packet(packet, &writer).await {
                return ReadFailure::Protocol(e);
            }
        }
    }

    /// Send PINGREQ every `interval`; a ping still unanswered at the next tick
    /// marks the connection lost
    pub async fn keep_alive_loop(self: Arc<Self>, writer: Arc<FrameWriter>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.is_lost() {
                return;
            }
            if self.awaiting_pong.swap(true, Ordering::SeqCst) {
                warn!(interval_secs = interval.as_secs(), "No PINGRESP within keep-alive interval");
                self.mark_lost(TransportError::closed("keep-alive timeout"));
                return;
            }
            let frame = match self.encode(&Packet::PingReq) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to encode PINGREQ");
                    return;
                }
            };
            match tokio::time::timeout(interval, writer.write_frame(&frame)).await {
                Ok(Ok(())) => trace!("PINGREQ sent"),
                Ok(Err(e)) => {
                    self.mark_lost(e);
                    return;
                }
                Err(_) => {
                    warn!(interval_secs = interval.as_secs(), "PINGREQ not written within keep-alive interval");
                    self.mark_lost(TransportError::Timeout(interval));
                    return;
                }
            }
        }
    }
}

/// CONNECT for this device
pub(crate) fn connect_packet(config: &ConnectionConfig, credentials: &Credentials) -> Packet {
    Packet::Connect(Connect {
        client_id: config.device.id.clone(),
        keep_alive: config.timeouts.keep_alive_secs,
        clean_session: config.session.clean_session,
        username: Some(credentials.username.clone()),
        password: credentials
            .password
            .as_ref()
            .map(|p| Bytes::copy_from_slice(p.as_bytes())),
    })
}

/// Wait for the CONNACK that answers our CONNECT
pub(crate) async fn read_connack(reader: &mut FrameReader) -> Result<ConnAck, ConnectError> {
    match reader.next_packet().await {
        Ok(Packet::ConnAck(ack)) if ack.code.is_accepted() => Ok(ack),
        Ok(Packet::ConnAck(ack)) => Err(ConnectError::BrokerRejection(ack.code)),
        Ok(other) => Err(ConnectError::Protocol(ProtocolError::UnexpectedPacket {
            expected: "CONNACK",
            got: other.name(),
        })),
        Err(ReadFailure::Eof) => Err(ConnectError::Transport(TransportError::closed(
            "stream closed before CONNACK",
        ))),
        Err(ReadFailure::Transport(e)) => Err(ConnectError::Transport(e)),
        Err(ReadFailure::Protocol(e)) => Err(ConnectError::Protocol(e)),
    }
}
