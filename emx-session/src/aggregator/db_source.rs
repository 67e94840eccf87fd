//! Step sources backed by the local `study_modules` table

use super::source::{SourceKind, StepSource, StepSourceData};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;

pub struct DbStepSource {
    db: Pool<Sqlite>,
    kind: SourceKind,
}

impl DbStepSource {
    pub fn new(db: Pool<Sqlite>, kind: SourceKind) -> Self {
        Self { db, kind }
    }

    /// One source per kind, in canonical order
    pub fn all(db: &Pool<Sqlite>) -> Vec<Arc<dyn StepSource>> {
        SourceKind::ALL
            .into_iter()
            .map(|kind| Arc::new(Self::new(db.clone(), kind)) as Arc<dyn StepSource>)
            .collect()
    }
}

#[async_trait]
impl StepSource for DbStepSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn name(&self) -> String {
        format!("db:{}", self.kind)
    }

    async fn get_config(&self, study_id: &str) -> Result<Option<StepSourceData>> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT config FROM study_modules WHERE study_id = ? AND source_kind = ?",
        )
        .bind(study_id)
        .bind(self.kind.as_str())
        .fetch_optional(&self.db)
        .await
        .map_err(|e| Error::ConfigFetch {
            source_kind: self.kind.to_string(),
            message: e.to_string(),
        })?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let config: Value = serde_json::from_str(&raw).map_err(|e| Error::ConfigFetch {
            source_kind: self.kind.to_string(),
            message: format!("invalid stored config: {}", e),
        })?;

        Ok(Some(StepSourceData {
            kind: self.kind,
            config,
        }))
    }
}

/// Store (or replace) a study's module configuration
pub async fn put_module_config(
    db: &Pool<Sqlite>,
    study_id: &str,
    kind: SourceKind,
    config: &Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO study_modules (study_id, source_kind, config, updated_at)
        VALUES (?, ?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(study_id, source_kind) DO UPDATE SET
            config = excluded.config,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(study_id)
    .bind(kind.as_str())
    .bind(serde_json::to_string(config)?)
    .execute(db)
    .await?;

    Ok(())
}
