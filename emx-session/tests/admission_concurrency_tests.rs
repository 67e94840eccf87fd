//! Admission under concurrent completions from independent service instances

mod helpers;

use chrono::{Duration, TimeZone, Utc};
use emx_common::db::init_database;
use emx_common::events::AdmissionDecision;
use emx_session::admission::QuotaConfig;
use emx_session::config::RuntimeSettings;
use emx_session::navigator::SessionServices;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_completions_never_exceed_quota() {
    let root = tempfile::tempdir().unwrap();
    let db_path = root.path().join("emx.db");

    // Two pools over the same file stand in for two service processes
    let mut instances = Vec::new();
    for i in 0..2 {
        let db = init_database(&db_path).await.unwrap();
        instances.push(Arc::new(SessionServices::new(
            db,
            root.path().join(format!("cache-{}", i)),
            RuntimeSettings::default(),
            Vec::new(),
        )));
    }

    instances[0]
        .admission
        .set_quota(
            "study",
            &QuotaConfig {
                enabled: true,
                participant_limit: 4,
                complete_url: None,
                overquota_url: None,
            },
        )
        .await
        .unwrap();

    let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let mut tasks = Vec::new();
    for n in 0..10i64 {
        let services = Arc::clone(&instances[(n % 2) as usize]);
        tasks.push(tokio::spawn(async move {
            let participant = format!("p{:02}", n);
            let completed_at = services
                .ledger
                .mark_completed("study", &participant, base + Duration::seconds(n))
                .await
                .unwrap();
            services
                .admission
                .admit("study", &participant, completed_at)
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let ranks = instances[1].admission.ranks("study").await.unwrap();
    assert_eq!(ranks.len(), 10);

    let qualified: Vec<&str> = ranks
        .iter()
        .filter(|r| r.decision == AdmissionDecision::Qualified)
        .map(|r| r.participant_id.as_str())
        .collect();
    assert_eq!(qualified, vec!["p00", "p01", "p02", "p03"]);

    for (i, rank) in ranks.iter().enumerate() {
        assert_eq!(rank.rank, i as i64 + 1);
        assert_eq!(rank.participant_id, format!("p{:02}", i));
    }

    let stats = instances[0].admission.quota_stats("study").await.unwrap();
    assert_eq!((stats.qualified, stats.disqualified), (4, 6));
    assert_eq!(stats.total_completed, 10);
}

#[tokio::test]
async fn test_readmission_is_idempotent_across_instances() {
    let root = tempfile::tempdir().unwrap();
    let app = helpers::create_file_backed_app(root.path()).await;
    let services = app.manager.services();

    let at = services.ledger.mark_completed("study", "p1", Utc::now()).await.unwrap();
    let first = services.admission.admit("study", "p1", at).await.unwrap();

    let other = SessionServices::new(
        init_database(&root.path().join("emx.db")).await.unwrap(),
        root.path().join("cache-2"),
        RuntimeSettings::default(),
        Vec::new(),
    );
    let second = other.admission.admit_completed("study", "p1").await.unwrap();

    assert_eq!(first.rank, second.rank);
    assert_eq!(other.admission.ranks("study").await.unwrap().len(), 1);
}
