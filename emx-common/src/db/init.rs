//! Database initialization
//!
//! The database and every table are created on first run. All statements are
//! idempotent so startup can run them unconditionally.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open (creating if needed) the database file and bring the schema up to date
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Connection options apply to every pooled connection, so WAL and the
    // busy timeout hold for all writers.
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;
    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema
///
/// Each `sqlite::memory:` connection is its own database, hence the pool of one.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    create_schema(&pool).await?;
    init_default_settings(&pool).await?;
    Ok(pool)
}

/// Create every table used by the session engine
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_study_modules_table(pool).await?;
    create_ledger_documents_table(pool).await?;
    create_study_quotas_table(pool).await?;
    create_completion_ranks_table(pool).await?;
    create_admission_counters_table(pool).await?;
    create_demographic_tables(pool).await?;
    Ok(())
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_study_modules_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS study_modules (
            study_id TEXT NOT NULL,
            source_kind TEXT NOT NULL,
            config TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (study_id, source_kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_ledger_documents_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ledger_documents (
            id TEXT PRIMARY KEY,
            study_id TEXT NOT NULL,
            participant_id TEXT NOT NULL,
            responses TEXT NOT NULL DEFAULT '[]',
            is_completed INTEGER NOT NULL DEFAULT 0,
            completed_at TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (study_id, participant_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ledger_documents_study ON ledger_documents(study_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_study_quotas_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS study_quotas (
            study_id TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1,
            participant_limit INTEGER NOT NULL CHECK (participant_limit >= 0),
            complete_url TEXT,
            overquota_url TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_completion_ranks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS completion_ranks (
            study_id TEXT NOT NULL,
            participant_id TEXT NOT NULL,
            rank INTEGER NOT NULL CHECK (rank >= 1),
            decision TEXT NOT NULL,
            quota_at_decision INTEGER,
            completed_at_us INTEGER NOT NULL,
            decided_at TEXT NOT NULL,
            decision_seq INTEGER NOT NULL,
            reason TEXT,
            demographics TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (study_id, participant_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_completion_ranks_order
        ON completion_ranks(study_id, completed_at_us, participant_id)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_admission_counters_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS admission_counters (
            study_id TEXT PRIMARY KEY,
            next_seq INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_demographic_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS study_demographic_quotas (
            study_id TEXT NOT NULL,
            dimension TEXT NOT NULL,
            value TEXT NOT NULL,
            max_quota INTEGER NOT NULL CHECK (max_quota >= 0),
            is_active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (study_id, dimension, value)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS demographic_counters (
            study_id TEXT NOT NULL,
            dimension TEXT NOT NULL,
            value TEXT NOT NULL,
            current_count INTEGER NOT NULL DEFAULT 0 CHECK (current_count >= 0),
            PRIMARY KEY (study_id, dimension, value)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Which counters each qualified participant holds
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS demographic_admissions (
            study_id TEXT NOT NULL,
            participant_id TEXT NOT NULL,
            dimension TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (study_id, participant_id, dimension)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Write defaults for any missing runtime setting
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    use super::settings::ensure_setting;

    ensure_setting(pool, "source_fetch_timeout_ms", "5000").await?;
    ensure_setting(pool, "snapshot_interval_ms", "10000").await?;
    ensure_setting(pool, "recording_flush_interval_ms", "1000").await?;
    ensure_setting(pool, "ledger_max_write_attempts", "3").await?;
    ensure_setting(pool, "ledger_retry_backoff_ms", "25").await?;
    ensure_setting(pool, "session_command_buffer", "64").await?;
    ensure_setting(pool, "event_channel_capacity", "256").await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_database_has_schema_and_defaults() {
        let pool = init_memory_database().await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        for expected in [
            "admission_counters",
            "completion_ranks",
            "demographic_admissions",
            "demographic_counters",
            "ledger_documents",
            "settings",
            "study_modules",
            "study_demographic_quotas",
            "study_quotas",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }

        let timeout: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = 'source_fetch_timeout_ms'")
                .fetch_optional(&pool)
                .await
                .unwrap();
        assert_eq!(timeout.as_deref(), Some("5000"));
    }

    #[tokio::test]
    async fn test_create_schema_is_idempotent() {
        let pool = init_memory_database().await.unwrap();
        create_schema(&pool).await.unwrap();
        create_schema(&pool).await.unwrap();
    }
}
