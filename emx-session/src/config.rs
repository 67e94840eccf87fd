//! Runtime settings for emx-session
//!
//! Loaded from the `settings` table at startup. Missing or invalid values are
//! replaced with defaults and written back.

use crate::error::Result;
use emx_common::db::get_or_init_setting;
use sqlx::{Pool, Sqlite};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Per-source timeout for step config fetches
    pub source_fetch_timeout: Duration,
    /// Periodic session snapshot interval
    pub snapshot_interval: Duration,
    /// Partial recording buffer flush interval
    pub recording_flush_interval: Duration,
    /// Ledger write attempts before a conflict is surfaced
    pub ledger_max_write_attempts: u32,
    /// Initial backoff between ledger write attempts (doubles each retry)
    pub ledger_retry_backoff: Duration,
    /// Command queue depth for each session actor
    pub session_command_buffer: usize,
    /// Broadcast channel capacity for session events
    pub event_channel_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            source_fetch_timeout: Duration::from_millis(5000),
            snapshot_interval: Duration::from_millis(10_000),
            recording_flush_interval: Duration::from_millis(1000),
            ledger_max_write_attempts: 3,
            ledger_retry_backoff: Duration::from_millis(25),
            session_command_buffer: 64,
            event_channel_capacity: 256,
        }
    }
}

impl RuntimeSettings {
    pub async fn load(db: &Pool<Sqlite>) -> Result<Self> {
        let d = Self::default();

        let source_ms: u64 =
            get_or_init_setting(db, "source_fetch_timeout_ms", d.source_fetch_timeout.as_millis() as u64).await?;
        let snapshot_ms: u64 =
            get_or_init_setting(db, "snapshot_interval_ms", d.snapshot_interval.as_millis() as u64).await?;
        let flush_ms: u64 = get_or_init_setting(
            db,
            "recording_flush_interval_ms",
            d.recording_flush_interval.as_millis() as u64,
        )
        .await?;
        let attempts: u32 =
            get_or_init_setting(db, "ledger_max_write_attempts", d.ledger_max_write_attempts).await?;
        let backoff_ms: u64 =
            get_or_init_setting(db, "ledger_retry_backoff_ms", d.ledger_retry_backoff.as_millis() as u64).await?;
        let command_buffer: usize =
            get_or_init_setting(db, "session_command_buffer", d.session_command_buffer).await?;
        let event_capacity: usize =
            get_or_init_setting(db, "event_channel_capacity", d.event_channel_capacity).await?;

        // Zero intervals would spin tokio::time::interval
        Ok(Self {
            source_fetch_timeout: Duration::from_millis(source_ms.max(1)),
            snapshot_interval: Duration::from_millis(snapshot_ms.max(100)),
            recording_flush_interval: Duration::from_millis(flush_ms.max(10)),
            ledger_max_write_attempts: attempts.max(1),
            ledger_retry_backoff: Duration::from_millis(backoff_ms),
            session_command_buffer: command_buffer.max(1),
            event_channel_capacity: event_capacity.max(1),
        })
    }
}
