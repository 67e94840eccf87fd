//! Local Durable Cache
//!
//! One versioned snapshot record per session on local disk: session state,
//! answers keyed by step id, and partial buffers of long-running steps.

pub mod file_cache;
pub mod recording;

pub use file_cache::LocalCache;
pub use recording::RecordingBuffer;

use crate::ledger::ResponseRecord;
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Current snapshot layout; older layouts are discarded on load
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub state: SessionState,
    /// Answers keyed by step id
    pub responses: BTreeMap<String, ResponseRecord>,
    /// Partial buffers keyed by step id; written by recording flushers only
    #[serde(default)]
    pub partials: BTreeMap<String, PartialBuffer>,
    #[serde(default)]
    pub reentry_count: u32,
    pub saved_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn new(state: SessionState, responses: BTreeMap<String, ResponseRecord>, reentry_count: u32) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            state,
            responses,
            partials: BTreeMap::new(),
            reentry_count,
            saved_at: Utc::now(),
        }
    }
}

/// Buffered samples of a timed step, flushed on its own interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialBuffer {
    pub step_id: String,
    pub samples: Vec<Value>,
    pub flush_count: u64,
    pub flushed_at: DateTime<Utc>,
}
