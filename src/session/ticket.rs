//! Persisted QUIC session ticket
//!
//! One JSON file per device. Writes go to a temporary file in the same
//! directory which is then renamed over the target, so readers never observe a
//! half-written ticket. Anything unreadable is reported as "no ticket".

use crate::error::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Opaque resumption blob plus the metadata needed to decide whether to use it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTicket {
    pub ticket: Vec<u8>,
    pub server_name: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionTicket {
    pub fn new<S: Into<String>>(ticket: Vec<u8>, server_name: S, lifetime: Duration) -> Self {
        let issued_at = Utc::now();
        let lifetime = chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::zero());
        Self {
            ticket,
            server_name: server_name.into(),
            issued_at,
            expires_at: issued_at + lifetime,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// File-backed ticket storage. Opens, operates and closes per call.
#[derive(Debug, Clone)]
pub struct SessionTicketStore {
    path: PathBuf,
}

impl SessionTicketStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the stored ticket
    pub fn save(&self, ticket: &SessionTicket) -> Result<(), StorageError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, ticket)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;

        debug!(path = %self.path.display(), expires_at = %ticket.expires_at, "Session ticket saved");
        Ok(())
    }

    /// The stored ticket, if present, parseable and unexpired
    pub fn load(&self) -> Option<SessionTicket> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No session ticket on disk");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Session ticket unreadable, ignoring");
                return None;
            }
        };

        let ticket: SessionTicket = match serde_json::from_slice(&content) {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Session ticket corrupt, ignoring");
                return None;
            }
        };

        if ticket.ticket.is_empty() {
            warn!(path = %self.path.display(), "Session ticket is empty, ignoring");
            return None;
        }
        if ticket.is_expired() {
            debug!(path = %self.path.display(), expired_at = %ticket.expires_at, "Session ticket expired");
            return None;
        }

        Some(ticket)
    }

    /// Remove the stored ticket; a missing file is not an error
    pub fn clear(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Session ticket removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
