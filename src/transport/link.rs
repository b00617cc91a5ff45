//! Byte-stream plumbing shared by both transports
//!
//! A QUIC bidirectional stream and a TLS-over-TCP socket look the same from
//! here: a reader half that yields MQTT packets and a writer half that accepts
//! whole encoded frames.

use crate::error::{ProtocolError, TransportError};
use crate::protocol::{MqttFramer, Packet};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a packet read stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    /// Peer closed the stream cleanly
    Eof,
    Transport(TransportError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadFailure::Eof => write!(f, "stream closed by peer"),
            ReadFailure::Transport(e) => write!(f, "{e}"),
            ReadFailure::Protocol(e) => write!(f, "{e}"),
        }
    }
}

impl ReadFailure {
    pub fn into_transport_error(self) -> TransportError {
        match self {
            ReadFailure::Eof => TransportError::closed("stream closed by peer"),
            ReadFailure::Transport(e) => e,
            ReadFailure::Protocol(e) => TransportError::Stream(format!("protocol violation: {e}")),
        }
    }
}

/// Buffers one stream's bytes until whole packets are available
pub struct FrameReader {
    reader: BoxedReader,
    buf: BytesMut,
    framer: MqttFramer,
}

impl FrameReader {
    pub fn new(reader: BoxedReader, framer: MqttFramer) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
            framer,
        }
    }

    /// Next complete packet from the stream
    pub async fn next_packet(&mut self) -> Result<Packet, ReadFailure> {
        loop {
            if let Some(packet) = self
                .framer
                .try_decode(&mut self.buf)
                .map_err(ReadFailure::Protocol)?
            {
                return Ok(packet);
            }

            let read = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| ReadFailure::Transport(e.into()))?;
            if read == 0 {
                return Err(if self.buf.is_empty() {
                    ReadFailure::Eof
                } else {
                    ReadFailure::Transport(TransportError::closed("stream ended mid-packet"))
                });
            }
        }
    }
}

/// Serializes whole frames onto one stream. The async mutex queues writers in
/// FIFO order, which is what gives per-stream ordering.
///
/// A write that is cancelled part way (its caller timed out) may leave half a
/// frame on the wire. The writer is then broken and refuses further frames.
pub struct FrameWriter {
    writer: Mutex<BoxedWriter>,
    broken: AtomicBool,
}

impl FrameWriter {
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
            broken: AtomicBool::new(false),
        }
    }

    pub async fn write_frame(&self, frame: &Bytes) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        if self.is_broken() {
            return Err(TransportError::Stream(
                "an earlier write was interrupted mid-frame".to_string(),
            ));
        }
        // stays set unless the whole frame goes out
        self.broken.store(true, Ordering::Release);
        writer.write_all(frame).await?;
        writer.flush().await?;
        self.broken.store(false, Ordering::Release);
        Ok(())
    }

    /// Whether a write failed or was abandoned part way through a frame
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Flush and half-close the stream
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
