//! Per-study quota configuration

use super::demographics::{list_demographic_quotas, DemographicQuota};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub participant_limit: i64,
    /// Redirect for qualified participants
    #[serde(default)]
    pub complete_url: Option<String>,
    /// Redirect for participants over quota
    #[serde(default)]
    pub overquota_url: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl QuotaConfig {
    /// Effective limit; `None` means unlimited
    pub fn limit(&self) -> Option<i64> {
        self.enabled.then_some(self.participant_limit)
    }
}

#[async_trait]
pub trait QuotaProvider: Send + Sync {
    /// The study's quota, or `None` when none is configured
    async fn get_quota(&self, study_id: &str) -> Result<Option<QuotaConfig>>;

    /// The study's demographic quotas; none by default
    async fn get_demographic_quotas(&self, _study_id: &str) -> Result<Vec<DemographicQuota>> {
        Ok(Vec::new())
    }
}

pub struct SqliteQuotaProvider {
    db: Pool<Sqlite>,
}

impl SqliteQuotaProvider {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl QuotaProvider for SqliteQuotaProvider {
    async fn get_quota(&self, study_id: &str) -> Result<Option<QuotaConfig>> {
        let row = sqlx::query(
            r#"
            SELECT enabled, participant_limit, complete_url, overquota_url
            FROM study_quotas
            WHERE study_id = ?
            "#,
        )
        .bind(study_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| Error::QuotaConfigUnavailable(e.to_string()))?;

        Ok(row.map(|row| QuotaConfig {
            enabled: row.get::<i64, _>("enabled") != 0,
            participant_limit: row.get("participant_limit"),
            complete_url: row.get("complete_url"),
            overquota_url: row.get("overquota_url"),
        }))
    }

    async fn get_demographic_quotas(&self, study_id: &str) -> Result<Vec<DemographicQuota>> {
        list_demographic_quotas(&self.db, study_id)
            .await
            .map_err(|e| Error::QuotaConfigUnavailable(e.to_string()))
    }
}

/// Create or replace a study's quota
pub async fn put_quota(db: &Pool<Sqlite>, study_id: &str, config: &QuotaConfig) -> Result<()> {
    if config.participant_limit < 0 {
        return Err(Error::BadRequest("participant_limit must be >= 0".to_string()));
    }

    sqlx::query(
        r#"
        INSERT INTO study_quotas
            (study_id, enabled, participant_limit, complete_url, overquota_url, updated_at)
        VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(study_id) DO UPDATE SET
            enabled = excluded.enabled,
            participant_limit = excluded.participant_limit,
            complete_url = excluded.complete_url,
            overquota_url = excluded.overquota_url,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(study_id)
    .bind(config.enabled as i64)
    .bind(config.participant_limit)
    .bind(&config.complete_url)
    .bind(&config.overquota_url)
    .execute(db)
    .await?;

    Ok(())
}
