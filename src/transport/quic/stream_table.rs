//! Topic to stream mapping for the QUIC transport
//!
//! Each topic gets its own bidirectional stream, opened on first publish and
//! kept for the life of the connection. Once `max_streams` topics are mapped,
//! further topics publish on the control stream.

use super::QuicLink;
use crate::error::TransportError;
use crate::transport::link::{FrameReader, FrameWriter, ReadFailure};
use crate::transport::pending::StreamTag;
use crate::transport::shared::SessionShared;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

pub(crate) struct TopicStream {
    pub tag: StreamTag,
    pub writer: Arc<FrameWriter>,
}

pub(crate) struct StreamTable {
    streams: Mutex<HashMap<String, Arc<TopicStream>>>,
    readers: StdMutex<Vec<AbortHandle>>,
    next_tag: AtomicU64,
    max_streams: usize,
    link: Arc<dyn QuicLink>,
    shared: Arc<SessionShared>,
}

impl StreamTable {
    pub fn new(max_streams: usize, link: Arc<dyn QuicLink>, shared: Arc<SessionShared>) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            readers: StdMutex::new(Vec::new()),
            next_tag: AtomicU64::new(1),
            max_streams,
            link,
            shared,
        })
    }

    /// The stream for `topic`, opening it if needed. `None` means the table is
    /// full and the caller should use the control stream.
    pub async fn get_or_create_stream(
        self: &Arc<Self>,
        topic: &str,
    ) -> Result<Option<Arc<TopicStream>>, TransportError> {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get(topic) {
            return Ok(Some(stream.clone()));
        }
        if streams.len() >= self.max_streams {
            return Ok(None);
        }

        let (writer, reader) = self.link.open_bi().await?;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(TopicStream {
            tag,
            writer: Arc::new(FrameWriter::new(writer)),
        });
        streams.insert(topic.to_string(), stream.clone());
        self.shared.stats.set_open_topic_streams(streams.len());
        drop(streams);

        debug!(topic, stream = tag, "Opened topic stream");
        self.spawn_reader(topic.to_string(), stream.clone(), FrameReader::new(reader, self.shared.framer));
        Ok(Some(stream))
    }

    fn spawn_reader(self: &Arc<Self>, topic: String, stream: Arc<TopicStream>, reader: FrameReader) {
        let table = self.clone();
        let handle = tokio::spawn(async move {
            let failure = table
                .shared
                .clone()
                .read_loop(reader, stream.writer.clone())
                .await;
            if table.shared.is_lost() || table.link.close_reason().is_some() {
                return;
            }
            match &failure {
                ReadFailure::Eof => debug!(topic = %topic, stream = stream.tag, "Topic stream closed by broker"),
                ReadFailure::Transport(e) => warn!(topic = %topic, stream = stream.tag, error = %e, "Topic stream failed"),
                ReadFailure::Protocol(e) => {
                    // the broker broke MQTT, not just this stream
                    warn!(topic = %topic, stream = stream.tag, error = %e, "Protocol violation on topic stream");
                    table.shared.mark_lost(failure.clone().into_transport_error());
                    return;
                }
            }
            table.discard(&topic, stream.tag, &failure.to_string()).await;
        });

        let mut readers = self.readers.lock().unwrap_or_else(|p| p.into_inner());
        readers.retain(|h| !h.is_finished());
        readers.push(handle.abort_handle());
    }

    /// Forget a failed stream and fail the operations still waiting on it.
    /// A later publish to the topic opens a fresh stream.
    pub async fn discard(&self, topic: &str, tag: StreamTag, reason: &str) {
        {
            let mut streams = self.streams.lock().await;
            if streams.get(topic).map(|s| s.tag) == Some(tag) {
                streams.remove(topic);
                self.shared.stats.set_open_topic_streams(streams.len());
            }
        }
        let failed = self.shared.pending.fail_stream(tag, reason);
        if failed > 0 {
            debug!(topic, stream = tag, failed, "Failed operations on discarded stream");
        }
    }

    pub async fn len(&self) -> usize {
        self.streams.lock().await.len()
    }

    pub fn abort_readers(&self) {
        let readers = self.readers.lock().unwrap_or_else(|p| p.into_inner());
        for handle in readers.iter() {
            handle.abort();
        }
    }
}
