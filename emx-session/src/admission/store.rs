//! Persisted admission decisions
//!
//! `completion_ranks` holds one row per admitted participant. Ranks are kept
//! dense and ordered by (completed_at_us, participant_id); every change
//! happens inside the allocator's write transaction.

use super::demographics::{self, DemographicQuota, Demographics, OverquotaReason};
use crate::error::Result;
use chrono::{DateTime, Utc};
use emx_common::events::AdmissionDecision;
use emx_common::time::{from_micros, to_micros};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite, Transaction};

/// A participant's stored admission decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRank {
    pub study_id: String,
    pub participant_id: String,
    pub rank: i64,
    pub decision: AdmissionDecision,
    /// Quota applied when the decision was made; `None` means unlimited
    pub quota_at_decision: Option<i64>,
    /// Set on every over-quota decision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<OverquotaReason>,
    pub completed_at: DateTime<Utc>,
    pub decided_at: DateTime<Utc>,
}

/// A decision that changed because an earlier finisher was inserted ahead of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub participant_id: String,
    pub rank: i64,
    pub previous: AdmissionDecision,
    pub decision: AdmissionDecision,
}

fn row_to_rank(row: &SqliteRow) -> Result<CompletionRank> {
    let decision: String = row.get("decision");
    let decided_at: String = row.get("decided_at");
    let reason: Option<String> = row.get("reason");
    Ok(CompletionRank {
        study_id: row.get("study_id"),
        participant_id: row.get("participant_id"),
        rank: row.get("rank"),
        decision: decision
            .parse()
            .map_err(crate::error::Error::Internal)?,
        quota_at_decision: row.get("quota_at_decision"),
        reason: reason.map(|r| serde_json::from_str(&r)).transpose()?,
        completed_at: from_micros(row.get("completed_at_us")),
        decided_at: crate::ledger::store::parse_ts(&decided_at)?,
    })
}

const SELECT_RANK: &str = r#"
    SELECT study_id, participant_id, rank, decision, quota_at_decision,
           reason, demographics, completed_at_us, decided_at
    FROM completion_ranks
"#;

pub async fn find_rank<'e, E>(executor: E, study_id: &str, participant_id: &str) -> Result<Option<CompletionRank>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("{} WHERE study_id = ? AND participant_id = ?", SELECT_RANK))
        .bind(study_id)
        .bind(participant_id)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(row_to_rank).transpose()
}

pub async fn list_ranks(db: &Pool<Sqlite>, study_id: &str) -> Result<Vec<CompletionRank>> {
    let rows = sqlx::query(&format!("{} WHERE study_id = ? ORDER BY rank", SELECT_RANK))
        .bind(study_id)
        .fetch_all(db)
        .await?;

    rows.iter().map(row_to_rank).collect()
}

/// Bump and return the study's decision sequence
///
/// This is the first write of every allocation, so it takes the database
/// write lock before anything is read.
pub async fn next_decision_seq(tx: &mut Transaction<'_, Sqlite>, study_id: &str) -> Result<i64> {
    let seq: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO admission_counters (study_id, next_seq) VALUES (?, 1)
        ON CONFLICT(study_id) DO UPDATE SET next_seq = next_seq + 1
        RETURNING next_seq
        "#,
    )
    .bind(study_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(seq)
}

/// 1-based rank `participant_id` takes when inserted at `completed_at`
pub async fn rank_for(
    tx: &mut Transaction<'_, Sqlite>,
    study_id: &str,
    participant_id: &str,
    completed_at: &DateTime<Utc>,
) -> Result<i64> {
    let before: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM completion_ranks
        WHERE study_id = ?
          AND (completed_at_us < ? OR (completed_at_us = ? AND participant_id < ?))
        "#,
    )
    .bind(study_id)
    .bind(to_micros(completed_at))
    .bind(to_micros(completed_at))
    .bind(participant_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(before + 1)
}

/// Shift everyone ordered after the new participant down one rank and
/// reclassify those whose decision no longer matches the quota
///
/// Demographic rejections are final. A participant pushed past the limit
/// gives back their demographic counters; one brought back under it must
/// pass the demographic quotas again.
pub async fn shift_and_revalidate(
    tx: &mut Transaction<'_, Sqlite>,
    study_id: &str,
    participant_id: &str,
    completed_at: &DateTime<Utc>,
    quota: Option<i64>,
    demographic_quotas: &[DemographicQuota],
    decided_at: &DateTime<Utc>,
) -> Result<Vec<Revision>> {
    let t = to_micros(completed_at);

    sqlx::query(
        r#"
        UPDATE completion_ranks SET rank = rank + 1
        WHERE study_id = ?
          AND (completed_at_us > ? OR (completed_at_us = ? AND participant_id > ?))
        "#,
    )
    .bind(study_id)
    .bind(t)
    .bind(t)
    .bind(participant_id)
    .execute(&mut **tx)
    .await?;

    let displaced = sqlx::query(&format!(
        "{} WHERE study_id = ? AND (completed_at_us > ? OR (completed_at_us = ? AND participant_id > ?)) ORDER BY rank",
        SELECT_RANK
    ))
    .bind(study_id)
    .bind(t)
    .bind(t)
    .bind(participant_id)
    .fetch_all(&mut **tx)
    .await?;

    let mut revisions = Vec::new();
    for row in &displaced {
        let current = row_to_rank(row)?;
        if current.reason.as_ref().is_some_and(OverquotaReason::is_demographic) {
            continue;
        }
        let by_rank = AdmissionDecision::for_rank(current.rank, quota);
        if by_rank == current.decision {
            continue;
        }

        let (decision, reason) = match (by_rank, quota) {
            (AdmissionDecision::DisqualifiedOverquota, Some(limit)) => {
                demographics::release(tx, study_id, &current.participant_id).await?;
                (by_rank, Some(OverquotaReason::ParticipantLimit { limit }))
            }
            _ => {
                let stored: String = row.get("demographics");
                let values: Demographics = serde_json::from_str(&stored)?;
                match demographics::admit(tx, study_id, &current.participant_id, demographic_quotas, &values).await? {
                    Some(full) => (AdmissionDecision::DisqualifiedOverquota, Some(full)),
                    None => (AdmissionDecision::Qualified, None),
                }
            }
        };

        sqlx::query(
            r#"
            UPDATE completion_ranks
            SET decision = ?, reason = ?, quota_at_decision = ?, decided_at = ?
            WHERE study_id = ? AND participant_id = ?
            "#,
        )
        .bind(decision.as_str())
        .bind(reason.as_ref().map(serde_json::to_string).transpose()?)
        .bind(quota)
        .bind(crate::ledger::store::format_ts(decided_at))
        .bind(study_id)
        .bind(&current.participant_id)
        .execute(&mut **tx)
        .await?;

        if decision != current.decision {
            revisions.push(Revision {
                participant_id: current.participant_id,
                rank: current.rank,
                previous: current.decision,
                decision,
            });
        }
    }

    Ok(revisions)
}

pub async fn insert_rank(
    tx: &mut Transaction<'_, Sqlite>,
    rank: &CompletionRank,
    demographics: &Demographics,
    decision_seq: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO completion_ranks
            (study_id, participant_id, rank, decision, quota_at_decision,
             reason, demographics, completed_at_us, decided_at, decision_seq)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&rank.study_id)
    .bind(&rank.participant_id)
    .bind(rank.rank)
    .bind(rank.decision.as_str())
    .bind(rank.quota_at_decision)
    .bind(rank.reason.as_ref().map(serde_json::to_string).transpose()?)
    .bind(serde_json::to_string(demographics)?)
    .bind(to_micros(&rank.completed_at))
    .bind(crate::ledger::store::format_ts(&rank.decided_at))
    .bind(decision_seq)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// (qualified, disqualified) counts for a study
pub async fn decision_counts(db: &Pool<Sqlite>, study_id: &str) -> Result<(i64, i64)> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN decision = 'QUALIFIED' THEN 1 ELSE 0 END), 0) AS qualified,
            COALESCE(SUM(CASE WHEN decision = 'DISQUALIFIED_OVERQUOTA' THEN 1 ELSE 0 END), 0) AS disqualified
        FROM completion_ranks
        WHERE study_id = ?
        "#,
    )
    .bind(study_id)
    .fetch_one(db)
    .await?;

    Ok((row.get("qualified"), row.get("disqualified")))
}
