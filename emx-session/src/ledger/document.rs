//! Ledger document model
//!
//! One document per (study, participant). The flat `responses` list is the
//! source of truth; `buckets` indexes the same step ids by category and is
//! kept in step with every mutation.

use crate::steps::{StepCategory, StepKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One answered step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub step_id: String,
    pub kind: StepKind,
    pub title: String,
    pub value: Value,
    /// Client-side timing and device data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResponseRecord {
    pub fn new(
        step_id: impl Into<String>,
        kind: StepKind,
        title: impl Into<String>,
        value: Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
            title: title.into(),
            value,
            metadata: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn category(&self) -> StepCategory {
        self.kind.category()
    }
}

/// Whether an answer counts as given
///
/// Null, blank strings, and empty arrays or objects are empty.
pub fn is_non_empty_answer(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Bookend screens are only recorded with an explicit, non-empty answer
pub fn should_record(kind: StepKind, value: &Value) -> bool {
    !kind.is_bookend() || is_non_empty_answer(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertEffect {
    Inserted,
    Replaced,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerDocument {
    pub id: String,
    pub study_id: String,
    pub participant_id: String,
    pub responses: Vec<ResponseRecord>,
    buckets: BTreeMap<StepCategory, Vec<String>>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Incremented by every stored mutation; used for compare-and-swap
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerDocument {
    pub fn new(study_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            study_id: study_id.into(),
            participant_id: participant_id.into(),
            responses: Vec::new(),
            buckets: BTreeMap::new(),
            is_completed: false,
            completed_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a document from stored columns
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: String,
        study_id: String,
        participant_id: String,
        responses: Vec<ResponseRecord>,
        is_completed: bool,
        completed_at: Option<DateTime<Utc>>,
        version: i64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let mut doc = Self {
            id,
            study_id,
            participant_id,
            responses: Vec::new(),
            buckets: BTreeMap::new(),
            is_completed,
            completed_at,
            version,
            created_at,
            updated_at,
        };
        for record in responses {
            doc.upsert(record);
        }
        doc
    }

    pub fn get(&self, step_id: &str) -> Option<&ResponseRecord> {
        self.responses.iter().find(|r| r.step_id == step_id)
    }

    /// Step ids indexed under `category`
    pub fn bucket(&self, category: StepCategory) -> &[String] {
        self.buckets.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn buckets(&self) -> &BTreeMap<StepCategory, Vec<String>> {
        &self.buckets
    }

    /// Insert or replace the record for `record.step_id`
    ///
    /// A replacement keeps the original `created_at`; `updated_at` never
    /// moves backwards.
    pub fn upsert(&mut self, record: ResponseRecord) -> UpsertEffect {
        if let Some(pos) = self.responses.iter().position(|r| r.step_id == record.step_id) {
            let old_category = self.responses[pos].category();
            let existing = &mut self.responses[pos];
            existing.kind = record.kind;
            existing.title = record.title;
            existing.value = record.value;
            existing.metadata = record.metadata;
            existing.updated_at = existing.updated_at.max(record.updated_at);

            let new_category = existing.category();
            if new_category != old_category {
                let step_id = existing.step_id.clone();
                self.unindex(old_category, &step_id);
                self.index(new_category, step_id);
            }
            self.updated_at = self.updated_at.max(self.responses[pos].updated_at);
            UpsertEffect::Replaced
        } else {
            self.index(record.category(), record.step_id.clone());
            self.updated_at = self.updated_at.max(record.updated_at);
            self.responses.push(record);
            UpsertEffect::Inserted
        }
    }

    /// Remove a step's record; returns it if present
    pub fn remove(&mut self, step_id: &str) -> Option<ResponseRecord> {
        let pos = self.responses.iter().position(|r| r.step_id == step_id)?;
        let record = self.responses.remove(pos);
        self.unindex(record.category(), step_id);
        Some(record)
    }

    /// Every bucket holds exactly the flat-list step ids of its category
    pub fn buckets_consistent(&self) -> bool {
        let mut expected: BTreeMap<StepCategory, Vec<&str>> = BTreeMap::new();
        for r in &self.responses {
            expected.entry(r.category()).or_default().push(r.step_id.as_str());
        }

        let mut actual: BTreeMap<StepCategory, Vec<&str>> = BTreeMap::new();
        for (category, ids) in &self.buckets {
            if ids.is_empty() {
                continue;
            }
            actual.insert(*category, ids.iter().map(String::as_str).collect());
        }

        for ids in expected.values_mut() {
            ids.sort_unstable();
        }
        for ids in actual.values_mut() {
            ids.sort_unstable();
        }
        expected == actual
    }

    fn index(&mut self, category: StepCategory, step_id: String) {
        self.buckets.entry(category).or_default().push(step_id);
    }

    fn unindex(&mut self, category: StepCategory, step_id: &str) {
        if let Some(ids) = self.buckets.get_mut(&category) {
            ids.retain(|id| id != step_id);
            if ids.is_empty() {
                self.buckets.remove(&category);
            }
        }
    }
}

/// Merge durable ledger records with locally cached ones
///
/// Per step the newer `updated_at` wins and the cache wins ties. Merging the
/// result with the same cache again changes nothing.
pub fn reconcile(
    ledger: &[ResponseRecord],
    cache: &BTreeMap<String, ResponseRecord>,
) -> BTreeMap<String, ResponseRecord> {
    let mut merged: BTreeMap<String, ResponseRecord> = ledger
        .iter()
        .map(|r| (r.step_id.clone(), r.clone()))
        .collect();

    for (step_id, cached) in cache {
        let keep_ledger = merged
            .get(step_id)
            .map(|durable| durable.updated_at > cached.updated_at)
            .unwrap_or(false);
        if !keep_ledger {
            merged.insert(step_id.clone(), cached.clone());
        }
    }
    merged
}
