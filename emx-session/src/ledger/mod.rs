//! Response Ledger
//!
//! Idempotent answer storage per (study, participant): find-or-create of the
//! document, then upsert-by-step with bounded retry on write races.

pub mod document;
pub mod store;

pub use document::{
    is_non_empty_answer, reconcile, should_record, LedgerDocument, ResponseRecord, UpsertEffect,
};
pub use store::{CompletedEntry, DocumentStore, SqliteDocumentStore};

use crate::error::{Error, Result};
use crate::utils::retry_on_conflict;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ResponseLedger {
    store: Arc<dyn DocumentStore>,
    max_attempts: u32,
    backoff: Duration,
}

impl ResponseLedger {
    pub fn new(store: Arc<dyn DocumentStore>, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            store,
            max_attempts,
            backoff,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn find(&self, study_id: &str, participant_id: &str) -> Result<Option<LedgerDocument>> {
        self.store.find_by_study_and_participant(study_id, participant_id).await
    }

    /// Find the document, creating it on first use
    ///
    /// Losing the creation race to another writer is fine: the winner's
    /// document is read back.
    pub async fn ensure_document(&self, study_id: &str, participant_id: &str) -> Result<LedgerDocument> {
        if let Some(doc) = self.find(study_id, participant_id).await? {
            return Ok(doc);
        }

        let doc = LedgerDocument::new(study_id, participant_id);
        if self.store.create_document(&doc).await? {
            debug!(study_id, participant_id, document_id = %doc.id, "Created ledger document");
            return Ok(doc);
        }

        self.find(study_id, participant_id).await?.ok_or_else(|| {
            Error::Internal(format!(
                "ledger document {}/{} vanished after create conflict",
                study_id, participant_id
            ))
        })
    }

    /// Record one step's answer
    ///
    /// Returns `Ok(None)` when the record was skipped (an unanswered bookend).
    pub async fn record(
        &self,
        study_id: &str,
        participant_id: &str,
        record: ResponseRecord,
    ) -> Result<Option<LedgerDocument>> {
        if !should_record(record.kind, &record.value) {
            debug!(study_id, participant_id, step_id = %record.step_id, "Skipping unanswered bookend");
            return Ok(None);
        }

        self.ensure_document(study_id, participant_id).await?;

        let store = Arc::clone(&self.store);
        let doc = retry_on_conflict("ledger upsert", self.max_attempts, self.backoff, || {
            let store = Arc::clone(&store);
            let record = record.clone();
            async move { store.upsert_step(study_id, participant_id, record).await }
        })
        .await?;

        Ok(Some(doc))
    }

    /// Durably mark the participant's document completed
    ///
    /// Returns the authoritative completion time (the first one stored).
    pub async fn mark_completed(
        &self,
        study_id: &str,
        participant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        self.ensure_document(study_id, participant_id).await?;

        let store = Arc::clone(&self.store);
        let completed_at = retry_on_conflict("ledger completion", self.max_attempts, self.backoff, || {
            let store = Arc::clone(&store);
            async move { store.mark_completed(study_id, participant_id, at).await }
        })
        .await?
        .ok_or_else(|| Error::NotFound(format!("ledger document {}/{}", study_id, participant_id)))?;

        info!(study_id, participant_id, completed_at = %completed_at, "Ledger document completed");
        Ok(completed_at)
    }

    pub async fn list_by_study(&self, study_id: &str) -> Result<Vec<LedgerDocument>> {
        self.store.list_by_study(study_id).await
    }

    pub async fn delete_all(&self, study_id: &str, participant_id: &str) -> Result<bool> {
        let deleted = self.store.delete(study_id, participant_id).await?;
        if deleted {
            info!(study_id, participant_id, "Deleted ledger document");
        }
        Ok(deleted)
    }

    pub async fn list_completed_ordered(&self, study_id: &str) -> Result<Vec<CompletedEntry>> {
        self.store.list_completed_ordered(study_id).await
    }
}
