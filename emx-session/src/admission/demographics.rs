//! Demographic quotas
//!
//! On top of the participant limit a study may cap how many qualified
//! participants share one demographic value (e.g. at most 10 in age range
//! `25-34`). Counters live in `demographic_counters` and are only touched
//! inside the admission write transaction; `demographic_admissions` records
//! which values each participant was counted under so a later revision can
//! release them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite, Transaction};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Demographic question a quota can apply to, in checking order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Dimension {
    Age,
    Country,
    Gender,
    EducationLevel,
    HouseholdIncome,
    EmploymentStatus,
    DailyHoursOnline,
    TechnicalProficiency,
}

impl Dimension {
    pub const ALL: [Dimension; 8] = [
        Dimension::Age,
        Dimension::Country,
        Dimension::Gender,
        Dimension::EducationLevel,
        Dimension::HouseholdIncome,
        Dimension::EmploymentStatus,
        Dimension::DailyHoursOnline,
        Dimension::TechnicalProficiency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Age => "age",
            Dimension::Country => "country",
            Dimension::Gender => "gender",
            Dimension::EducationLevel => "educationLevel",
            Dimension::HouseholdIncome => "householdIncome",
            Dimension::EmploymentStatus => "employmentStatus",
            Dimension::DailyHoursOnline => "dailyHoursOnline",
            Dimension::TechnicalProficiency => "technicalProficiency",
        }
    }

    fn snake_name(&self) -> &'static str {
        match self {
            Dimension::EducationLevel => "education_level",
            Dimension::HouseholdIncome => "household_income",
            Dimension::EmploymentStatus => "employment_status",
            Dimension::DailyHoursOnline => "daily_hours_online",
            Dimension::TechnicalProficiency => "technical_proficiency",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Dimension::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown demographic dimension: {}", s))
    }
}

/// A participant's answers to the demographic step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Demographics(BTreeMap<Dimension, String>);

impl Demographics {
    /// Read the demographic answer object
    ///
    /// Keys may be camelCase or snake_case; an answer may be a plain string,
    /// a number, or an object carrying it under `value`. Blank answers and
    /// unknown keys are ignored.
    pub fn from_answer(answer: &Value) -> Self {
        let Some(object) = answer.as_object() else {
            return Self::default();
        };

        let mut values = BTreeMap::new();
        for dimension in Dimension::ALL {
            let raw = object
                .get(dimension.as_str())
                .or_else(|| object.get(dimension.snake_name()));
            let raw = match raw {
                Some(Value::Object(inner)) => inner.get("value"),
                other => other,
            };
            let value = match raw {
                Some(Value::String(s)) => s.trim().to_string(),
                Some(Value::Number(n)) => n.to_string(),
                _ => continue,
            };
            if !value.is_empty() {
                values.insert(dimension, value);
            }
        }
        Self(values)
    }

    pub fn with(mut self, dimension: Dimension, value: impl Into<String>) -> Self {
        self.0.insert(dimension, value.into());
        self
    }

    pub fn get(&self, dimension: Dimension) -> Option<&str> {
        self.0.get(&dimension).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Cap on qualified participants sharing one demographic value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemographicQuota {
    pub dimension: Dimension,
    pub value: String,
    pub quota: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Why a participant was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverquotaReason {
    /// Ranked past the study's participant limit
    ParticipantLimit { limit: i64 },
    /// The counter for one of the participant's demographic values is full
    Demographic {
        dimension: Dimension,
        value: String,
        current_count: i64,
        max_quota: i64,
    },
}

impl OverquotaReason {
    pub fn is_demographic(&self) -> bool {
        matches!(self, OverquotaReason::Demographic { .. })
    }
}

impl fmt::Display for OverquotaReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverquotaReason::ParticipantLimit { limit } => write!(f, "participant limit of {} reached", limit),
            OverquotaReason::Demographic {
                dimension,
                value,
                current_count,
                max_quota,
            } => write!(
                f,
                "{} quota reached for {} ({}/{})",
                dimension, value, current_count, max_quota
            ),
        }
    }
}

/// Current count for one demographic value of a study
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DemographicCounter {
    pub dimension: Dimension,
    pub value: String,
    pub current_count: i64,
    /// Active quota for the value; `None` when the value is only counted
    pub max_quota: Option<i64>,
}

fn parse_dimension(raw: &str) -> Result<Dimension> {
    raw.parse().map_err(Error::Internal)
}

/// Replace a study's demographic quotas
pub async fn put_demographic_quotas(db: &Pool<Sqlite>, study_id: &str, quotas: &[DemographicQuota]) -> Result<()> {
    if let Some(bad) = quotas.iter().find(|q| q.quota < 0) {
        return Err(Error::BadRequest(format!(
            "quota for {} {} must be >= 0",
            bad.dimension, bad.value
        )));
    }
    if let Some(blank) = quotas.iter().find(|q| q.value.trim().is_empty()) {
        return Err(Error::BadRequest(format!("{} quota needs a value", blank.dimension)));
    }

    let mut tx = db.begin().await?;
    sqlx::query("DELETE FROM study_demographic_quotas WHERE study_id = ?")
        .bind(study_id)
        .execute(&mut *tx)
        .await?;

    for quota in quotas {
        sqlx::query(
            r#"
            INSERT INTO study_demographic_quotas (study_id, dimension, value, max_quota, is_active)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(study_id, dimension, value) DO UPDATE SET
                max_quota = excluded.max_quota,
                is_active = excluded.is_active
            "#,
        )
        .bind(study_id)
        .bind(quota.dimension.as_str())
        .bind(quota.value.trim())
        .bind(quota.quota)
        .bind(quota.is_active as i64)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_demographic_quotas(db: &Pool<Sqlite>, study_id: &str) -> Result<Vec<DemographicQuota>> {
    let rows = sqlx::query(
        r#"
        SELECT dimension, value, max_quota, is_active
        FROM study_demographic_quotas
        WHERE study_id = ?
        "#,
    )
    .bind(study_id)
    .fetch_all(db)
    .await?;

    let mut quotas = rows
        .iter()
        .map(|row| {
            Ok(DemographicQuota {
                dimension: parse_dimension(&row.get::<String, _>("dimension"))?,
                value: row.get("value"),
                quota: row.get("max_quota"),
                is_active: row.get::<i64, _>("is_active") != 0,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    quotas.sort_by(|a, b| (a.dimension, &a.value).cmp(&(b.dimension, &b.value)));
    Ok(quotas)
}

/// Active quotas that apply to the participant, in dimension order
pub fn matching<'a>(quotas: &'a [DemographicQuota], demographics: &Demographics) -> Vec<&'a DemographicQuota> {
    let mut matched: Vec<&DemographicQuota> = quotas
        .iter()
        .filter(|q| q.is_active && demographics.get(q.dimension) == Some(q.value.as_str()))
        .collect();
    matched.sort_by_key(|q| q.dimension);
    matched.dedup_by_key(|q| q.dimension);
    matched
}

async fn current_count(tx: &mut Transaction<'_, Sqlite>, study_id: &str, dimension: Dimension, value: &str) -> Result<i64> {
    let count: Option<i64> = sqlx::query_scalar(
        "SELECT current_count FROM demographic_counters WHERE study_id = ? AND dimension = ? AND value = ?",
    )
    .bind(study_id)
    .bind(dimension.as_str())
    .bind(value)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(count.unwrap_or(0))
}

/// Check the participant against the study's demographic quotas and, when
/// every matching counter has room, count them in
///
/// Returns the first full quota instead; nothing is counted in that case.
pub async fn admit(
    tx: &mut Transaction<'_, Sqlite>,
    study_id: &str,
    participant_id: &str,
    quotas: &[DemographicQuota],
    demographics: &Demographics,
) -> Result<Option<OverquotaReason>> {
    let matched = matching(quotas, demographics);

    for quota in &matched {
        let count = current_count(tx, study_id, quota.dimension, &quota.value).await?;
        if count >= quota.quota {
            return Ok(Some(OverquotaReason::Demographic {
                dimension: quota.dimension,
                value: quota.value.clone(),
                current_count: count,
                max_quota: quota.quota,
            }));
        }
    }

    for quota in &matched {
        sqlx::query(
            r#"
            INSERT INTO demographic_counters (study_id, dimension, value, current_count)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(study_id, dimension, value) DO UPDATE SET current_count = current_count + 1
            "#,
        )
        .bind(study_id)
        .bind(quota.dimension.as_str())
        .bind(&quota.value)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO demographic_admissions (study_id, participant_id, dimension, value)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(study_id)
        .bind(participant_id)
        .bind(quota.dimension.as_str())
        .bind(&quota.value)
        .execute(&mut **tx)
        .await?;
    }

    Ok(None)
}

/// Give back every counter the participant holds
pub async fn release(tx: &mut Transaction<'_, Sqlite>, study_id: &str, participant_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE demographic_counters SET current_count = current_count - 1
        WHERE current_count > 0
          AND (study_id, dimension, value) IN (
            SELECT study_id, dimension, value FROM demographic_admissions
            WHERE study_id = ? AND participant_id = ?
          )
        "#,
    )
    .bind(study_id)
    .bind(participant_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM demographic_admissions WHERE study_id = ? AND participant_id = ?")
        .bind(study_id)
        .bind(participant_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Counters of a study joined with their active quotas
pub async fn counters(db: &Pool<Sqlite>, study_id: &str) -> Result<Vec<DemographicCounter>> {
    let rows = sqlx::query(
        r#"
        SELECT c.dimension, c.value, c.current_count, q.max_quota
        FROM demographic_counters c
        LEFT JOIN study_demographic_quotas q
          ON q.study_id = c.study_id AND q.dimension = c.dimension
         AND q.value = c.value AND q.is_active = 1
        WHERE c.study_id = ?
        "#,
    )
    .bind(study_id)
    .fetch_all(db)
    .await?;

    let mut counters = rows
        .iter()
        .map(|row| {
            Ok(DemographicCounter {
                dimension: parse_dimension(&row.get::<String, _>("dimension"))?,
                value: row.get("value"),
                current_count: row.get("current_count"),
                max_quota: row.get("max_quota"),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    counters.sort_by(|a, b| (a.dimension, &a.value).cmp(&(b.dimension, &b.value)));
    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use emx_common::db::init_memory_database;
    use serde_json::json;

    fn quota(dimension: Dimension, value: &str, quota: i64) -> DemographicQuota {
        DemographicQuota {
            dimension,
            value: value.to_string(),
            quota,
            is_active: true,
        }
    }

    #[test]
    fn test_demographics_from_answer() {
        let answer = json!({
            "age": "25-34",
            "education_level": "bachelor",
            "dailyHoursOnline": {"value": "4-6"},
            "country": "  ",
            "favouriteColour": "blue",
            "householdIncome": 3
        });
        let d = Demographics::from_answer(&answer);
        assert_eq!(d.get(Dimension::Age), Some("25-34"));
        assert_eq!(d.get(Dimension::EducationLevel), Some("bachelor"));
        assert_eq!(d.get(Dimension::DailyHoursOnline), Some("4-6"));
        assert_eq!(d.get(Dimension::HouseholdIncome), Some("3"));
        assert_eq!(d.get(Dimension::Country), None);
        assert!(Demographics::from_answer(&json!("no object")).is_empty());
    }

    #[test]
    fn test_matching_skips_inactive_and_other_values() {
        let mut inactive = quota(Dimension::Gender, "female", 1);
        inactive.is_active = false;
        let quotas = vec![
            quota(Dimension::Country, "ES", 5),
            quota(Dimension::Age, "25-34", 2),
            quota(Dimension::Age, "35-44", 2),
            inactive,
        ];
        let d = Demographics::default()
            .with(Dimension::Age, "25-34")
            .with(Dimension::Country, "ES")
            .with(Dimension::Gender, "female");

        let matched: Vec<_> = matching(&quotas, &d).iter().map(|q| q.dimension).collect();
        assert_eq!(matched, vec![Dimension::Age, Dimension::Country]);
    }

    #[tokio::test]
    async fn test_counters_fill_and_release() {
        let pool = init_memory_database().await.unwrap();
        let quotas = vec![quota(Dimension::Age, "25-34", 1)];
        put_demographic_quotas(&pool, "s1", &quotas).await.unwrap();
        let d = Demographics::default().with(Dimension::Age, "25-34");

        let mut tx = pool.begin().await.unwrap();
        assert_eq!(admit(&mut tx, "s1", "a", &quotas, &d).await.unwrap(), None);
        let full = admit(&mut tx, "s1", "b", &quotas, &d).await.unwrap().unwrap();
        assert_eq!(
            full,
            OverquotaReason::Demographic {
                dimension: Dimension::Age,
                value: "25-34".into(),
                current_count: 1,
                max_quota: 1,
            }
        );
        tx.commit().await.unwrap();

        let counted = counters(&pool, "s1").await.unwrap();
        assert_eq!(counted[0].current_count, 1);
        assert_eq!(counted[0].max_quota, Some(1));

        let mut tx = pool.begin().await.unwrap();
        release(&mut tx, "s1", "a").await.unwrap();
        release(&mut tx, "s1", "a").await.unwrap();
        assert_eq!(admit(&mut tx, "s1", "b", &quotas, &d).await.unwrap(), None);
        tx.commit().await.unwrap();
        assert_eq!(counters(&pool, "s1").await.unwrap()[0].current_count, 1);
    }

    #[tokio::test]
    async fn test_put_replaces_and_validates() {
        let pool = init_memory_database().await.unwrap();
        put_demographic_quotas(&pool, "s1", &[quota(Dimension::Age, "18-24", 3)])
            .await
            .unwrap();
        put_demographic_quotas(&pool, "s1", &[quota(Dimension::Gender, "male", 2)])
            .await
            .unwrap();
        assert_eq!(
            list_demographic_quotas(&pool, "s1").await.unwrap(),
            vec![quota(Dimension::Gender, "male", 2)]
        );

        assert!(matches!(
            put_demographic_quotas(&pool, "s1", &[quota(Dimension::Age, "18-24", -1)]).await,
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            put_demographic_quotas(&pool, "s1", &[quota(Dimension::Age, " ", 1)]).await,
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn test_reason_wire_format() {
        let reason = OverquotaReason::Demographic {
            dimension: Dimension::EducationLevel,
            value: "master".into(),
            current_count: 4,
            max_quota: 4,
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "demographic");
        assert_eq!(json["dimension"], "educationLevel");
        assert_eq!(reason.to_string(), "educationLevel quota reached for master (4/4)");
    }
}
