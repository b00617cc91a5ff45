//! In-flight QoS 1 publishes and subscribes awaiting their acknowledgement
//!
//! Each transport owns one table. Entries are keyed by packet identifier and
//! carry a oneshot responder; they leave the table on the matching ack, on
//! timeout (the waiter owns the deadline and removes its own entry) or when
//! their stream or the whole connection fails.

use crate::protocol::{QoS, SubscribeReturnCode};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Identifies the stream an operation was written to. `CONTROL_STREAM` is the
/// QUIC control stream or the single TCP stream.
pub type StreamTag = u64;

pub const CONTROL_STREAM: StreamTag = 0;

/// What the operation is waiting for
#[derive(Debug, Clone)]
pub enum OperationKind {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
    },
    Subscribe {
        filter: String,
    },
}

/// Successful completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Published,
    Subscribed(Vec<SubscribeReturnCode>),
}

/// Why an operation was abandoned before its ack arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abort {
    ConnectionLost,
    StreamFailed(String),
}

pub type AckReceiver = oneshot::Receiver<Result<Ack, Abort>>;

#[derive(Debug)]
pub struct PendingOperation {
    pub packet_id: u16,
    pub kind: OperationKind,
    pub stream: StreamTag,
    responder: oneshot::Sender<Result<Ack, Abort>>,
}

#[derive(Debug)]
struct Inner {
    next_id: u16,
    ops: HashMap<u16, PendingOperation>,
}

/// Packet-id allocator plus the operations waiting on those ids
#[derive(Debug)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ops: HashMap::new(),
            }),
        }
    }

    /// Allocate a packet identifier and park the operation under it.
    /// Returns `None` when all 65535 identifiers are in flight.
    pub fn register(&self, kind: OperationKind, stream: StreamTag) -> Option<(u16, AckReceiver)> {
        let mut inner = self.lock();
        if inner.ops.len() >= u16::MAX as usize {
            return None;
        }

        let mut packet_id = inner.next_id;
        while inner.ops.contains_key(&packet_id) {
            packet_id = next_packet_id(packet_id);
        }
        inner.next_id = next_packet_id(packet_id);

        let (responder, receiver) = oneshot::channel();
        inner.ops.insert(
            packet_id,
            PendingOperation {
                packet_id,
                kind,
                stream,
                responder,
            },
        );
        Some((packet_id, receiver))
    }

    /// Resolve the operation waiting on `packet_id`. Returns false for
    /// unknown ids (late acks after a timeout, duplicates).
    pub fn complete(&self, packet_id: u16, ack: Ack) -> bool {
        let op = self.lock().ops.remove(&packet_id);
        match op {
            Some(op) => {
                let _ = op.responder.send(Ok(ack));
                true
            }
            None => false,
        }
    }

    /// Drop an entry whose waiter gave up
    pub fn remove(&self, packet_id: u16) -> Option<PendingOperation> {
        self.lock().ops.remove(&packet_id)
    }

    /// Fail every operation written to `stream`
    pub fn fail_stream(&self, stream: StreamTag, reason: &str) -> usize {
        let failed: Vec<PendingOperation> = {
            let mut inner = self.lock();
            let ids: Vec<u16> = inner
                .ops
                .values()
                .filter(|op| op.stream == stream)
                .map(|op| op.packet_id)
                .collect();
            ids.iter().filter_map(|id| inner.ops.remove(id)).collect()
        };
        let count = failed.len();
        for op in failed {
            let _ = op
                .responder
                .send(Err(Abort::StreamFailed(reason.to_string())));
        }
        count
    }

    /// Fail everything; used when the connection goes away
    pub fn fail_all(&self) -> usize {
        let failed: Vec<PendingOperation> = self.lock().ops.drain().map(|(_, op)| op).collect();
        let count = failed.len();
        for op in failed {
            let _ = op.responder.send(Err(Abort::ConnectionLost));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a panic while holding this lock leaves the map consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Packet identifiers cycle through 1..=65535; zero is never valid
fn next_packet_id(current: u16) -> u16 {
    if current == u16::MAX {
        1
    } else {
        current + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(topic: &str) -> OperationKind {
        OperationKind::Publish {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtLeastOnce,
        }
    }

    #[tokio::test]
    async fn test_complete_resolves_waiter() {
        let table = PendingTable::new();
        let (id, rx) = table.register(publish("a"), CONTROL_STREAM).unwrap();
        assert_eq!(id, 1);
        assert!(table.complete(id, Ack::Published));
        assert_eq!(rx.await.unwrap(), Ok(Ack::Published));
        assert!(table.is_empty());

        // late duplicate ack
        assert!(!table.complete(id, Ack::Published));
    }

    #[test]
    fn test_ids_skip_in_use_and_wrap() {
        let table = PendingTable::new();
        let (first, _rx1) = table.register(publish("a"), 0).unwrap();
        table.lock().next_id = u16::MAX;
        let (second, _rx2) = table.register(publish("b"), 0).unwrap();
        assert_eq!(second, u16::MAX);

        // wraps past zero and skips id 1 which is still in flight
        let (third, _rx3) = table.register(publish("c"), 0).unwrap();
        assert_eq!(first, 1);
        assert_eq!(third, 2);
    }

    #[tokio::test]
    async fn test_fail_stream_only_touches_that_stream() {
        let table = PendingTable::new();
        let (_, on_control) = table.register(publish("a"), CONTROL_STREAM).unwrap();
        let (_, on_topic) = table.register(publish("b"), 7).unwrap();

        assert_eq!(table.fail_stream(7, "reset"), 1);
        assert_eq!(
            on_topic.await.unwrap(),
            Err(Abort::StreamFailed("reset".to_string()))
        );
        assert_eq!(table.len(), 1);

        assert_eq!(table.fail_all(), 1);
        assert_eq!(on_control.await.unwrap(), Err(Abort::ConnectionLost));
    }

    #[test]
    fn test_remove_after_timeout() {
        let table = PendingTable::new();
        let (id, _rx) = table.register(publish("a"), 0).unwrap();
        let op = table.remove(id).unwrap();
        assert!(matches!(op.kind, OperationKind::Publish { ref topic, .. } if topic == "a"));
        assert!(table.is_empty());
    }
}
