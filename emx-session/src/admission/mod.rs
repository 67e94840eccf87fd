//! Completion Admission Controller
//!
//! Ranks completed participants per study by completion time and admits the
//! earliest `Q` of them. Rank allocation for a study is serialized twice: by
//! an in-process async mutex, and by a database write transaction whose
//! first statement bumps the study's decision counter. Two racing
//! completions therefore never both see the last free slot.
//!
//! A participant ranked within the limit must also fit the study's
//! demographic quotas; those counters move in the same transaction.

pub mod demographics;
pub mod quota;
pub mod store;

pub use demographics::{
    put_demographic_quotas, DemographicCounter, DemographicQuota, Demographics, Dimension, OverquotaReason,
};
pub use quota::{put_quota, QuotaConfig, QuotaProvider, SqliteQuotaProvider};
pub use store::{CompletionRank, Revision};

use crate::error::{Error, Result};
use crate::ledger::{CompletedEntry, ResponseLedger};
use crate::steps::StepKind;
use crate::state::SharedState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use emx_common::events::{AdmissionDecision, SessionEvent};
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// What admission reads from the ledger
#[async_trait]
pub trait CompletionsReader: Send + Sync {
    /// Ordered completions of a study
    async fn list_completed_ordered(&self, study_id: &str) -> Result<Vec<CompletedEntry>>;

    /// The participant's answers to the demographic step
    async fn demographics(&self, _study_id: &str, _participant_id: &str) -> Result<Demographics> {
        Ok(Demographics::default())
    }
}

#[async_trait]
impl CompletionsReader for ResponseLedger {
    async fn list_completed_ordered(&self, study_id: &str) -> Result<Vec<CompletedEntry>> {
        ResponseLedger::list_completed_ordered(self, study_id).await
    }

    async fn demographics(&self, study_id: &str, participant_id: &str) -> Result<Demographics> {
        let Some(doc) = self.find(study_id, participant_id).await? else {
            return Ok(Demographics::default());
        };
        Ok(doc
            .responses
            .iter()
            .find(|r| r.kind == StepKind::Demographic)
            .map(|r| Demographics::from_answer(&r.value))
            .unwrap_or_default())
    }
}

/// Decision plus where to send the participant next
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    #[serde(flatten)]
    pub rank: CompletionRank,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStats {
    pub total_completed: usize,
    pub qualified: i64,
    pub disqualified: i64,
    /// `None` means unlimited
    pub quota_limit: Option<i64>,
    pub demographic: Vec<DemographicCounter>,
}

pub struct AdmissionController {
    db: Pool<Sqlite>,
    quota: Arc<dyn QuotaProvider>,
    completions: Arc<dyn CompletionsReader>,
    state: Arc<SharedState>,
    study_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AdmissionController {
    pub fn new(
        db: Pool<Sqlite>,
        quota: Arc<dyn QuotaProvider>,
        completions: Arc<dyn CompletionsReader>,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            db,
            quota,
            completions,
            state,
            study_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn study_lock(&self, study_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .study_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Locks nobody holds or waits on are dropped
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(study_id.to_string()).or_default())
    }

    #[cfg(test)]
    fn tracked_study_locks(&self) -> usize {
        self.study_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Quota config, failing open: any lookup error means no quota
    async fn quota_config(&self, study_id: &str) -> Option<QuotaConfig> {
        match self.quota.get_quota(study_id).await {
            Ok(config) => config,
            Err(e) => {
                let e = match e {
                    Error::QuotaConfigUnavailable(_) => e,
                    other => Error::QuotaConfigUnavailable(other.to_string()),
                };
                warn!(study_id, error = %e, "Quota lookup failed, admitting without limit");
                None
            }
        }
    }

    /// Demographic quotas, failing open like the participant limit
    async fn demographic_quotas(&self, study_id: &str) -> Vec<DemographicQuota> {
        match self.quota.get_demographic_quotas(study_id).await {
            Ok(quotas) => quotas,
            Err(e) => {
                warn!(study_id, error = %e, "Demographic quota lookup failed, admitting without them");
                Vec::new()
            }
        }
    }

    /// Demographics of the participant, or none when they cannot be read
    async fn participant_demographics(&self, study_id: &str, participant_id: &str) -> Demographics {
        match self.completions.demographics(study_id, participant_id).await {
            Ok(demographics) => demographics,
            Err(e) => {
                warn!(study_id, participant_id, error = %e, "Could not read demographics, none applied");
                Demographics::default()
            }
        }
    }

    fn with_redirect(rank: CompletionRank, config: Option<&QuotaConfig>) -> Admission {
        let redirect_url = config.and_then(|c| match rank.decision {
            AdmissionDecision::Qualified => c.complete_url.clone(),
            AdmissionDecision::DisqualifiedOverquota => c.overquota_url.clone(),
        });
        Admission { rank, redirect_url }
    }

    /// Admit a participant who completed at `completed_at`
    ///
    /// Idempotent: a participant with a stored decision gets it back unchanged.
    pub async fn admit(&self, study_id: &str, participant_id: &str, completed_at: DateTime<Utc>) -> Result<Admission> {
        if let Some(existing) = store::find_rank(&self.db, study_id, participant_id).await? {
            let config = self.quota_config(study_id).await;
            return Ok(Self::with_redirect(existing, config.as_ref()));
        }

        let config = self.quota_config(study_id).await;
        let limit = config.as_ref().and_then(QuotaConfig::limit);
        let demographic_quotas = self.demographic_quotas(study_id).await;
        let profile = if demographic_quotas.iter().any(|q| q.is_active) {
            self.participant_demographics(study_id, participant_id).await
        } else {
            Demographics::default()
        };

        let lock = self.study_lock(study_id);
        let _guard = lock.lock().await;

        let mut tx = self.db.begin().await?;
        let seq = store::next_decision_seq(&mut tx, study_id).await?;

        // Re-check under the write lock: another process may have decided meanwhile
        if let Some(existing) = store::find_rank(&mut *tx, study_id, participant_id).await? {
            tx.rollback().await?;
            return Ok(Self::with_redirect(existing, config.as_ref()));
        }

        let now = Utc::now();
        let rank = store::rank_for(&mut tx, study_id, participant_id, &completed_at).await?;
        let revisions = store::shift_and_revalidate(
            &mut tx,
            study_id,
            participant_id,
            &completed_at,
            limit,
            &demographic_quotas,
            &now,
        )
        .await?;

        let (decision, reason) = match (AdmissionDecision::for_rank(rank, limit), limit) {
            (AdmissionDecision::DisqualifiedOverquota, Some(limit)) => (
                AdmissionDecision::DisqualifiedOverquota,
                Some(OverquotaReason::ParticipantLimit { limit }),
            ),
            _ => match demographics::admit(&mut tx, study_id, participant_id, &demographic_quotas, &profile)
                .await?
            {
                Some(full) => (AdmissionDecision::DisqualifiedOverquota, Some(full)),
                None => (AdmissionDecision::Qualified, None),
            },
        };

        let record = CompletionRank {
            study_id: study_id.to_string(),
            participant_id: participant_id.to_string(),
            rank,
            decision,
            quota_at_decision: limit,
            reason,
            completed_at,
            decided_at: now,
        };
        store::insert_rank(&mut tx, &record, &profile, seq).await?;
        tx.commit().await?;

        info!(
            study_id,
            participant_id,
            rank,
            decision = %record.decision,
            quota = ?limit,
            reason = record.reason.as_ref().map(ToString::to_string),
            decision_seq = seq,
            "Admission decided"
        );
        self.state.broadcast_event(SessionEvent::AdmissionDecided {
            study_id: study_id.to_string(),
            participant_id: participant_id.to_string(),
            rank,
            decision: record.decision,
            quota: limit,
            reason: record.reason.as_ref().map(ToString::to_string),
            timestamp: now,
        });

        for revision in revisions {
            info!(
                study_id,
                participant_id = %revision.participant_id,
                rank = revision.rank,
                previous = %revision.previous,
                decision = %revision.decision,
                "Admission revised after earlier completion was inserted"
            );
            self.state.broadcast_event(SessionEvent::AdmissionRevised {
                study_id: study_id.to_string(),
                participant_id: revision.participant_id,
                rank: revision.rank,
                previous_decision: revision.previous,
                decision: revision.decision,
                timestamp: now,
            });
        }

        Ok(Self::with_redirect(record, config.as_ref()))
    }

    /// Admit using the completion time the ledger recorded
    ///
    /// This is the retry entry point for clients: it needs no timestamp.
    pub async fn admit_completed(&self, study_id: &str, participant_id: &str) -> Result<Admission> {
        if let Some(existing) = self.decision(study_id, participant_id).await? {
            return Ok(existing);
        }

        let completed = self.completions.list_completed_ordered(study_id).await?;
        let entry = completed
            .into_iter()
            .find(|e| e.participant_id == participant_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no recorded completion for participant {} in study {}",
                    participant_id, study_id
                ))
            })?;

        self.admit(study_id, participant_id, entry.completed_at).await
    }

    /// Stored decision, if any
    pub async fn decision(&self, study_id: &str, participant_id: &str) -> Result<Option<Admission>> {
        let Some(rank) = store::find_rank(&self.db, study_id, participant_id).await? else {
            return Ok(None);
        };
        let config = self.quota_config(study_id).await;
        Ok(Some(Self::with_redirect(rank, config.as_ref())))
    }

    pub async fn ranks(&self, study_id: &str) -> Result<Vec<CompletionRank>> {
        store::list_ranks(&self.db, study_id).await
    }

    pub async fn quota_stats(&self, study_id: &str) -> Result<QuotaStats> {
        let total_completed = self.completions.list_completed_ordered(study_id).await?.len();
        let (qualified, disqualified) = store::decision_counts(&self.db, study_id).await?;
        let quota_limit = self.quota_config(study_id).await.and_then(|c| c.limit());
        let demographic = demographics::counters(&self.db, study_id).await?;

        Ok(QuotaStats {
            total_completed,
            qualified,
            disqualified,
            quota_limit,
            demographic,
        })
    }

    pub async fn set_quota(&self, study_id: &str, config: &QuotaConfig) -> Result<()> {
        put_quota(&self.db, study_id, config).await?;
        info!(study_id, limit = ?config.limit(), "Quota updated");
        Ok(())
    }

    /// Replace the study's demographic quotas
    ///
    /// Existing counters are kept; a lowered quota only affects later admissions.
    pub async fn set_demographic_quotas(&self, study_id: &str, quotas: &[DemographicQuota]) -> Result<()> {
        put_demographic_quotas(&self.db, study_id, quotas).await?;
        info!(study_id, rules = quotas.len(), "Demographic quotas updated");
        Ok(())
    }

    pub async fn demographic_quota_rules(&self, study_id: &str) -> Result<Vec<DemographicQuota>> {
        demographics::list_demographic_quotas(&self.db, study_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ResponseRecord, SqliteDocumentStore};
    use chrono::Duration;
    use serde_json::json;
    use emx_common::db::init_memory_database;

    struct BrokenQuota;

    #[async_trait]
    impl QuotaProvider for BrokenQuota {
        async fn get_quota(&self, _study_id: &str) -> Result<Option<QuotaConfig>> {
            Err(Error::QuotaConfigUnavailable("backend down".into()))
        }
    }

    async fn controller_with(quota: Option<i64>) -> (AdmissionController, ResponseLedger) {
        let pool = init_memory_database().await.unwrap();
        if let Some(limit) = quota {
            put_quota(
                &pool,
                "s1",
                &QuotaConfig {
                    enabled: true,
                    participant_limit: limit,
                    complete_url: Some("https://panel/complete".into()),
                    overquota_url: Some("https://panel/overquota".into()),
                },
            )
            .await
            .unwrap();
        }
        let ledger = ResponseLedger::new(
            Arc::new(SqliteDocumentStore::new(pool.clone())),
            3,
            std::time::Duration::from_millis(1),
        );
        let controller = AdmissionController::new(
            pool.clone(),
            Arc::new(SqliteQuotaProvider::new(pool)),
            Arc::new(ledger.clone()),
            Arc::new(SharedState::default()),
        );
        (controller, ledger)
    }

    fn decisions(ranks: &[CompletionRank]) -> Vec<(String, i64, AdmissionDecision)> {
        ranks
            .iter()
            .map(|r| (r.participant_id.clone(), r.rank, r.decision))
            .collect()
    }

    #[tokio::test]
    async fn test_decisions_independent_of_processing_order() {
        let base = Utc::now();
        let times = [
            ("A", base),
            ("B", base + Duration::seconds(1)),
            ("C", base + Duration::seconds(2)),
        ];
        let orders: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let (controller, _) = controller_with(Some(2)).await;
            for i in order {
                let (pid, t) = times[i];
                controller.admit("s1", pid, t).await.unwrap();
            }
            let ranks = controller.ranks("s1").await.unwrap();
            assert_eq!(
                decisions(&ranks),
                vec![
                    ("A".to_string(), 1, AdmissionDecision::Qualified),
                    ("B".to_string(), 2, AdmissionDecision::Qualified),
                    ("C".to_string(), 3, AdmissionDecision::DisqualifiedOverquota),
                ],
                "processing order {:?}",
                order
            );
        }
    }

    async fn answer_demographics(ledger: &ResponseLedger, participant: &str, answer: serde_json::Value) {
        ledger
            .record(
                "s1",
                participant,
                ResponseRecord::new("demographic", StepKind::Demographic, "About you", answer, Utc::now()),
            )
            .await
            .unwrap();
    }

    fn age_quota(value: &str, quota: i64) -> DemographicQuota {
        DemographicQuota {
            dimension: Dimension::Age,
            value: value.to_string(),
            quota,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_demographic_quota_disqualifies_with_reason() {
        let (controller, ledger) = controller_with(Some(10)).await;
        controller
            .set_demographic_quotas("s1", &[age_quota("25-34", 1)])
            .await
            .unwrap();
        answer_demographics(&ledger, "A", json!({"age": "25-34", "country": "ES"})).await;
        answer_demographics(&ledger, "B", json!({"age": "25-34"})).await;
        answer_demographics(&ledger, "C", json!({"age": "35-44"})).await;
        let base = Utc::now();

        let a = controller.admit("s1", "A", base).await.unwrap();
        assert_eq!(a.rank.decision, AdmissionDecision::Qualified);
        assert_eq!(a.rank.reason, None);

        let b = controller.admit("s1", "B", base + Duration::seconds(1)).await.unwrap();
        assert_eq!(b.rank.rank, 2);
        assert_eq!(b.rank.decision, AdmissionDecision::DisqualifiedOverquota);
        assert_eq!(
            b.rank.reason,
            Some(OverquotaReason::Demographic {
                dimension: Dimension::Age,
                value: "25-34".into(),
                current_count: 1,
                max_quota: 1,
            })
        );
        assert_eq!(b.redirect_url.as_deref(), Some("https://panel/overquota"));
        let wire = serde_json::to_value(&b).unwrap();
        assert_eq!(wire["reason"]["kind"], "demographic");

        let c = controller.admit("s1", "C", base + Duration::seconds(2)).await.unwrap();
        assert_eq!(c.rank.decision, AdmissionDecision::Qualified);

        // Stored reason survives a re-read
        let stored = controller.decision("s1", "B").await.unwrap().unwrap();
        assert!(stored.rank.reason.as_ref().is_some_and(OverquotaReason::is_demographic));

        let stats = controller.quota_stats("s1").await.unwrap();
        assert_eq!((stats.qualified, stats.disqualified), (2, 1));
        assert_eq!(
            stats.demographic,
            vec![DemographicCounter {
                dimension: Dimension::Age,
                value: "25-34".into(),
                current_count: 1,
                max_quota: Some(1),
            }]
        );
    }

    #[tokio::test]
    async fn test_displaced_participant_releases_demographic_slot() {
        let (controller, ledger) = controller_with(Some(1)).await;
        controller
            .set_demographic_quotas("s1", &[age_quota("25-34", 5), age_quota("35-44", 5)])
            .await
            .unwrap();
        answer_demographics(&ledger, "A", json!({"age": "35-44"})).await;
        answer_demographics(&ledger, "B", json!({"age": "25-34"})).await;
        let base = Utc::now();

        controller.admit("s1", "B", base + Duration::seconds(5)).await.unwrap();
        controller.admit("s1", "A", base).await.unwrap();

        let b = controller.decision("s1", "B").await.unwrap().unwrap();
        assert_eq!(b.rank.decision, AdmissionDecision::DisqualifiedOverquota);
        assert_eq!(b.rank.reason, Some(OverquotaReason::ParticipantLimit { limit: 1 }));

        let counts: Vec<(String, i64)> = controller
            .quota_stats("s1")
            .await
            .unwrap()
            .demographic
            .into_iter()
            .map(|c| (c.value, c.current_count))
            .collect();
        assert_eq!(counts, vec![("25-34".to_string(), 0), ("35-44".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_participant_limit_reason() {
        let (controller, _) = controller_with(Some(1)).await;
        let base = Utc::now();
        controller.admit("s1", "A", base).await.unwrap();
        let b = controller.admit("s1", "B", base + Duration::seconds(1)).await.unwrap();
        assert_eq!(b.rank.reason, Some(OverquotaReason::ParticipantLimit { limit: 1 }));
    }

    #[tokio::test]
    async fn test_study_locks_do_not_accumulate() {
        let (controller, _) = controller_with(None).await;
        let base = Utc::now();
        for i in 0..20 {
            controller
                .admit(&format!("study-{}", i), "p", base + Duration::seconds(i))
                .await
                .unwrap();
        }
        // Only the lock taken by the last admission can remain
        assert!(controller.tracked_study_locks() <= 1);
    }

    #[tokio::test]
    async fn test_readmission_is_idempotent() {
        let (controller, _) = controller_with(Some(2)).await;
        let base = Utc::now();
        let first = controller.admit("s1", "A", base).await.unwrap();
        controller.admit("s1", "B", base + Duration::seconds(1)).await.unwrap();
        controller.admit("s1", "C", base + Duration::seconds(2)).await.unwrap();

        let again = controller.admit("s1", "A", base + Duration::seconds(10)).await.unwrap();
        assert_eq!(again.rank, first.rank);
        assert_eq!(again.redirect_url.as_deref(), Some("https://panel/complete"));
    }

    #[tokio::test]
    async fn test_late_processed_early_finisher_revises_decisions() {
        let (controller, _) = controller_with(Some(1)).await;
        let state = Arc::clone(&controller.state);
        let mut events = state.subscribe_events();
        let base = Utc::now();

        let b = controller.admit("s1", "B", base + Duration::seconds(5)).await.unwrap();
        assert_eq!(b.rank.decision, AdmissionDecision::Qualified);

        let a = controller.admit("s1", "A", base).await.unwrap();
        assert_eq!(a.rank.rank, 1);
        assert_eq!(a.rank.decision, AdmissionDecision::Qualified);

        let b = controller.decision("s1", "B").await.unwrap().unwrap();
        assert_eq!(b.rank.rank, 2);
        assert_eq!(b.rank.decision, AdmissionDecision::DisqualifiedOverquota);
        assert_eq!(b.redirect_url.as_deref(), Some("https://panel/overquota"));

        let mut saw_revision = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::AdmissionRevised { participant_id, previous_decision, .. } = event {
                assert_eq!(participant_id, "B");
                assert_eq!(previous_decision, AdmissionDecision::Qualified);
                saw_revision = true;
            }
        }
        assert!(saw_revision);
    }

    #[tokio::test]
    async fn test_equal_timestamps_break_ties_by_participant_id() {
        let (controller, _) = controller_with(Some(1)).await;
        let t = Utc::now();
        controller.admit("s1", "zed", t).await.unwrap();
        controller.admit("s1", "amy", t).await.unwrap();

        let ranks = controller.ranks("s1").await.unwrap();
        assert_eq!(ranks[0].participant_id, "amy");
        assert_eq!(ranks[0].decision, AdmissionDecision::Qualified);
        assert_eq!(ranks[1].decision, AdmissionDecision::DisqualifiedOverquota);
    }

    #[tokio::test]
    async fn test_missing_or_broken_quota_fails_open() {
        let (controller, _) = controller_with(None).await;
        let base = Utc::now();
        for i in 0..5 {
            let a = controller
                .admit("s1", &format!("p{}", i), base + Duration::seconds(i))
                .await
                .unwrap();
            assert_eq!(a.rank.decision, AdmissionDecision::Qualified);
            assert_eq!(a.rank.quota_at_decision, None);
        }

        let pool = init_memory_database().await.unwrap();
        let broken = AdmissionController::new(
            pool.clone(),
            Arc::new(BrokenQuota),
            Arc::new(ResponseLedger::new(
                Arc::new(SqliteDocumentStore::new(pool)),
                3,
                std::time::Duration::from_millis(1),
            )),
            Arc::new(SharedState::default()),
        );
        let a = broken.admit("s1", "p", Utc::now()).await.unwrap();
        assert_eq!(a.rank.decision, AdmissionDecision::Qualified);
    }

    #[tokio::test]
    async fn test_admit_completed_uses_ledger_timestamp() {
        let (controller, ledger) = controller_with(Some(1)).await;
        let base = Utc::now();

        assert!(matches!(
            controller.admit_completed("s1", "A").await,
            Err(Error::NotFound(_))
        ));

        let stamped = ledger.mark_completed("s1", "A", base).await.unwrap();
        let a = controller.admit_completed("s1", "A").await.unwrap();
        assert_eq!(a.rank.completed_at, stamped);
        assert_eq!(a.rank.rank, 1);

        ledger.mark_completed("s1", "B", base + Duration::seconds(1)).await.unwrap();
        controller.admit_completed("s1", "B").await.unwrap();

        let stats = controller.quota_stats("s1").await.unwrap();
        assert_eq!(
            stats,
            QuotaStats {
                total_completed: 2,
                qualified: 1,
                disqualified: 1,
                quota_limit: Some(1),
                demographic: Vec::new(),
            }
        );
    }
}
