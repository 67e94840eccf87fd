//! Document-store collaborator and its SQLite implementation
//!
//! Each document is one row. Mutations are a compare-and-swap on `version`,
//! so two writers racing on the same document cannot both win.

use super::document::{LedgerDocument, ResponseRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

/// One finished participant, for the admission controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedEntry {
    pub participant_id: String,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_by_study_and_participant(
        &self,
        study_id: &str,
        participant_id: &str,
    ) -> Result<Option<LedgerDocument>>;

    /// Insert a new document; `Ok(false)` when one already exists for the key
    async fn create_document(&self, doc: &LedgerDocument) -> Result<bool>;

    /// Insert or replace one step's record in a single atomic document update
    ///
    /// Fails with `Error::PersistenceConflict` if the document changed between
    /// the read and the write, and with `Error::NotFound` if it doesn't exist.
    async fn upsert_step(
        &self,
        study_id: &str,
        participant_id: &str,
        record: ResponseRecord,
    ) -> Result<LedgerDocument>;

    /// Flag the document completed; the first stamp is kept on repeat calls
    ///
    /// Returns the stored completion time, or `None` if no document exists.
    async fn mark_completed(
        &self,
        study_id: &str,
        participant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn list_by_study(&self, study_id: &str) -> Result<Vec<LedgerDocument>>;

    /// Delete the document; `Ok(false)` if none existed
    async fn delete(&self, study_id: &str, participant_id: &str) -> Result<bool>;

    /// Completed participants ordered by completion time, then participant id
    async fn list_completed_ordered(&self, study_id: &str) -> Result<Vec<CompletedEntry>>;
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("invalid stored timestamp '{}': {}", raw, e)))
}

pub struct SqliteDocumentStore {
    db: Pool<Sqlite>,
}

impl SqliteDocumentStore {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    fn row_to_document(row: &SqliteRow) -> Result<LedgerDocument> {
        let responses: Vec<ResponseRecord> =
            serde_json::from_str(&row.get::<String, _>("responses"))?;
        let completed_at = row
            .get::<Option<String>, _>("completed_at")
            .map(|raw| parse_ts(&raw))
            .transpose()?;

        Ok(LedgerDocument::from_parts(
            row.get("id"),
            row.get("study_id"),
            row.get("participant_id"),
            responses,
            row.get::<i64, _>("is_completed") != 0,
            completed_at,
            row.get("version"),
            parse_ts(&row.get::<String, _>("created_at"))?,
            parse_ts(&row.get::<String, _>("updated_at"))?,
        ))
    }
}

const SELECT_DOCUMENT: &str = r#"
    SELECT id, study_id, participant_id, responses, is_completed, completed_at,
           version, created_at, updated_at
    FROM ledger_documents
"#;

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn find_by_study_and_participant(
        &self,
        study_id: &str,
        participant_id: &str,
    ) -> Result<Option<LedgerDocument>> {
        let row = sqlx::query(&format!(
            "{} WHERE study_id = ? AND participant_id = ?",
            SELECT_DOCUMENT
        ))
        .bind(study_id)
        .bind(participant_id)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(Self::row_to_document).transpose()
    }

    async fn create_document(&self, doc: &LedgerDocument) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_documents
                (id, study_id, participant_id, responses, is_completed, completed_at,
                 version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(study_id, participant_id) DO NOTHING
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.study_id)
        .bind(&doc.participant_id)
        .bind(serde_json::to_string(&doc.responses)?)
        .bind(doc.is_completed as i64)
        .bind(doc.completed_at.as_ref().map(format_ts))
        .bind(doc.version)
        .bind(format_ts(&doc.created_at))
        .bind(format_ts(&doc.updated_at))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_step(
        &self,
        study_id: &str,
        participant_id: &str,
        record: ResponseRecord,
    ) -> Result<LedgerDocument> {
        let mut doc = self
            .find_by_study_and_participant(study_id, participant_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("ledger document {}/{}", study_id, participant_id))
            })?;

        let expected_version = doc.version;
        doc.upsert(record);
        doc.version += 1;

        let result = sqlx::query(
            r#"
            UPDATE ledger_documents
            SET responses = ?, version = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(serde_json::to_string(&doc.responses)?)
        .bind(doc.version)
        .bind(format_ts(&doc.updated_at))
        .bind(&doc.id)
        .bind(expected_version)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::PersistenceConflict { attempts: 1 });
        }
        Ok(doc)
    }

    async fn mark_completed(
        &self,
        study_id: &str,
        participant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let stamp = format_ts(&at);
        let stored: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE ledger_documents
            SET is_completed = 1,
                completed_at = COALESCE(completed_at, ?),
                version = version + 1,
                updated_at = ?
            WHERE study_id = ? AND participant_id = ?
            RETURNING completed_at
            "#,
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(study_id)
        .bind(participant_id)
        .fetch_optional(&self.db)
        .await?;

        stored.map(|raw| parse_ts(&raw)).transpose()
    }

    async fn list_by_study(&self, study_id: &str) -> Result<Vec<LedgerDocument>> {
        let rows = sqlx::query(&format!(
            "{} WHERE study_id = ? ORDER BY created_at, participant_id",
            SELECT_DOCUMENT
        ))
        .bind(study_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(Self::row_to_document).collect()
    }

    async fn delete(&self, study_id: &str, participant_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM ledger_documents WHERE study_id = ? AND participant_id = ?")
                .bind(study_id)
                .bind(participant_id)
                .execute(&self.db)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_completed_ordered(&self, study_id: &str) -> Result<Vec<CompletedEntry>> {
        // Fixed-width RFC 3339 text sorts chronologically
        let rows = sqlx::query(
            r#"
            SELECT participant_id, completed_at
            FROM ledger_documents
            WHERE study_id = ? AND is_completed = 1 AND completed_at IS NOT NULL
            ORDER BY completed_at, participant_id
            "#,
        )
        .bind(study_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CompletedEntry {
                    participant_id: row.get("participant_id"),
                    completed_at: parse_ts(&row.get::<String, _>("completed_at"))?,
                })
            })
            .collect()
    }
}
