//! File-backed snapshot storage
//!
//! Each session is one JSON file under `<root>/cache/<study>/<participant>.json`.
//! Path segments are escaped so distinct ids never share a file.
//! Writes go to a temp file that is renamed over the old one, so a crash
//! leaves either the old or the new record, never a torn one.

use super::{PartialBuffer, SessionSnapshot, SNAPSHOT_VERSION};
use crate::error::Result;
use crate::session::SessionKey;
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct LocalCache {
    dir: PathBuf,
    // Serializes read-modify-write cycles on snapshot files
    write_lock: Mutex<()>,
}

/// Escape a path segment: ASCII alphanumerics and `-` pass through, every
/// other byte (including `_`) becomes `_xx`. The mapping is injective.
fn encode_segment(segment: &str) -> String {
    if segment.is_empty() {
        return "_".to_string();
    }
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{:02x}", byte));
        }
    }
    encoded
}

impl LocalCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.dir
            .join(encode_segment(&key.study_id))
            .join(format!("{}.json", encode_segment(&key.participant_id)))
    }

    /// Load a session's snapshot
    ///
    /// Unreadable or outdated records are discarded with a warning; the
    /// session then starts fresh from the ledger.
    pub async fn load(&self, key: &SessionKey) -> Result<Option<SessionSnapshot>> {
        self.read(key).await
    }

    /// Write the session snapshot, keeping partial buffers already on disk
    pub async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = &snapshot.state.key;

        let mut record = snapshot.clone();
        record.version = SNAPSHOT_VERSION;
        record.saved_at = Utc::now();
        if let Some(existing) = self.read(key).await? {
            for (step_id, partial) in existing.partials {
                record.partials.entry(step_id).or_insert(partial);
            }
        }

        self.write_atomic(key, &record).await?;
        debug!(session = %key, steps_answered = record.responses.len(), "Session snapshot saved");
        Ok(())
    }

    /// Store a step's partial buffer into the existing snapshot
    ///
    /// Returns false when the session has no snapshot yet.
    pub async fn save_partial(&self, key: &SessionKey, step_id: &str, samples: Vec<Value>) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let Some(mut record) = self.read(key).await? else {
            return Ok(false);
        };

        let flush_count = record.partials.get(step_id).map(|p| p.flush_count + 1).unwrap_or(1);
        record.partials.insert(
            step_id.to_string(),
            PartialBuffer {
                step_id: step_id.to_string(),
                samples,
                flush_count,
                flushed_at: Utc::now(),
            },
        );

        self.write_atomic(key, &record).await?;
        Ok(true)
    }

    pub async fn load_partial(&self, key: &SessionKey, step_id: &str) -> Result<Option<PartialBuffer>> {
        Ok(self
            .read(key)
            .await?
            .and_then(|mut record| record.partials.remove(step_id)))
    }

    /// Drop a step's partial buffer once its answer is stored
    pub async fn clear_partial(&self, key: &SessionKey, step_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(mut record) = self.read(key).await? {
            if record.partials.remove(step_id).is_some() {
                self.write_atomic(key, &record).await?;
            }
        }
        Ok(())
    }

    /// Remove the session's snapshot
    pub async fn clear(&self, key: &SessionKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, key: &SessionKey) -> Result<Option<SessionSnapshot>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<SessionSnapshot>(&bytes) {
            Ok(record) if record.version != SNAPSHOT_VERSION => {
                warn!(session = %key, version = record.version, "Discarding snapshot with unknown version");
                Ok(None)
            }
            Ok(record) if record.state.key != *key => {
                warn!(session = %key, stored = %record.state.key, "Discarding snapshot of another session");
                Ok(None)
            }
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(session = %key, error = %e, "Discarding unreadable snapshot");
                Ok(None)
            }
        }
    }

    async fn write_atomic(&self, key: &SessionKey, record: &SessionSnapshot) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec(record)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}
