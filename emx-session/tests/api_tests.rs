//! HTTP-level tests of the session engine

mod helpers;

use axum::{body::Body, http::Request, http::StatusCode};
use helpers::{create_test_app, seed_study, send};
use serde_json::json;
use tower::util::ServiceExt;

#[tokio::test]
async fn test_health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_test_app(dir.path()).await;

    let (status, body) = send(&app.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "emx-session");
}

#[tokio::test]
async fn test_full_session_flow() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_test_app(dir.path()).await;
    seed_study(&app.db, "study-a", 2).await;

    let (status, view) = send(&app.router, "POST", "/sessions/study-a/p1", Some(json!({"token": "t"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["phase"], "IN_PROGRESS");
    assert_eq!(view["current_index"], 0);
    assert_eq!(view["step_count"], 6);
    assert_eq!(view["degraded"], false);

    let (_, step) = send(&app.router, "GET", "/sessions/study-a/p1/step", None).await;
    assert_eq!(step["step"]["kind"], "welcome");

    let (status, body) = send(&app.router, "POST", "/sessions/study-a/p1/answer", Some(json!({"answer": null}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "advanced");
    assert_eq!(body["index"], 1);

    // Not visited yet: a no-op, not an error
    let (status, body) = send(&app.router, "POST", "/sessions/study-a/p1/navigate", Some(json!({"index": 4}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["moved"], false);
    assert_eq!(body["denied_reason"], "not_visited");
    assert_eq!(body["current_index"], 1);

    for answer in [json!("one"), json!("two"), json!(5), json!("nice")] {
        let (status, body) = send(&app.router, "POST", "/sessions/study-a/p1/answer", Some(json!({ "answer": answer }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "advanced");
    }

    let (_, progress) = send(&app.router, "GET", "/sessions/study-a/p1/progress", None).await;
    assert_eq!(progress["completed"], 4);
    assert_eq!(progress["total"], 4);

    let (status, body) = send(&app.router, "POST", "/sessions/study-a/p1/answer", Some(json!({"answer": null}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "completed");
    assert_eq!(body["admission"]["rank"], 1);
    assert_eq!(body["admission"]["decision"], "QUALIFIED");
    assert_eq!(body["session"]["phase"], "DONE");
    assert_eq!(body["session"]["progress"]["percentage"], 100);

    let (status, doc) = send(&app.router, "GET", "/studies/study-a/responses/p1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["is_completed"], true);
    // Both unanswered bookends were skipped
    assert_eq!(doc["responses"].as_array().map(Vec::len), Some(4));

    let (status, admission) = send(&app.router, "GET", "/studies/study-a/admission/p1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(admission["decision"], "QUALIFIED");

    let (_, stats) = send(&app.router, "GET", "/studies/study-a/quota-stats", None).await;
    assert_eq!(stats["total_completed"], 1);
    assert_eq!(stats["qualified"], 1);
    assert_eq!(stats["quota_limit"], serde_json::Value::Null);

    // A finished session is no longer live
    let (status, body) = send(&app.router, "POST", "/sessions/study-a/p1/answer", Some(json!({"answer": "late"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
    assert_eq!(app.manager.registered(), 0);

    // Starting it again reports the final state without keeping an actor
    let (status, view) = send(&app.router, "POST", "/sessions/study-a/p1", Some(json!({"token": "t"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["phase"], "DONE");
    assert_eq!(view["progress"]["percentage"], 100);
    assert_eq!(app.manager.registered(), 0);
}

#[tokio::test]
async fn test_login_phase() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_test_app(dir.path()).await;
    seed_study(&app.db, "study-a", 2).await;

    let (status, view) = send(&app.router, "POST", "/sessions/study-a/p1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["phase"], "LOGIN");
    assert_eq!(view["current_step"], serde_json::Value::Null);

    let (status, _) = send(&app.router, "POST", "/sessions/study-a/p1/login", Some(json!({"token": " "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, view) = send(&app.router, "POST", "/sessions/study-a/p1/login", Some(json!({"token": "t"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["phase"], "IN_PROGRESS");
}

#[tokio::test]
async fn test_error_responses() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_test_app(dir.path()).await;

    let (status, body) = send(&app.router, "GET", "/sessions/nowhere/p1/step", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");

    // No module returned anything for this study
    let (status, body) = send(&app.router, "POST", "/sessions/nowhere/p1", Some(json!({"token": "t"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["status"], "error");

    let (status, _) = send(&app.router, "POST", "/studies/nowhere/admission/p1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app.router,
        "PUT",
        "/studies/nowhere/quota",
        Some(json!({"participant_limit": -1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_quota_redirects() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_test_app(dir.path()).await;
    seed_study(&app.db, "study-q", 1).await;

    let (status, _) = send(
        &app.router,
        "PUT",
        "/studies/study-q/quota",
        Some(json!({
            "participant_limit": 1,
            "complete_url": "https://panel/complete",
            "overquota_url": "https://panel/overquota"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let mut decisions = Vec::new();
    for participant in ["early", "late"] {
        let uri = format!("/sessions/study-q/{}", participant);
        send(&app.router, "POST", &uri, Some(json!({"token": "t"}))).await;
        let answer_uri = format!("{}/answer", uri);
        let mut last = serde_json::Value::Null;
        // welcome, q1, two fillers, thank-you
        for _ in 0..5 {
            let (status, body) = send(&app.router, "POST", &answer_uri, Some(json!({"answer": "x"}))).await;
            assert_eq!(status, StatusCode::OK);
            last = body;
        }
        assert_eq!(last["outcome"], "completed");
        decisions.push((
            last["admission"]["decision"].clone(),
            last["admission"]["redirect_url"].clone(),
        ));
    }

    assert_eq!(decisions[0], (json!("QUALIFIED"), json!("https://panel/complete")));
    assert_eq!(
        decisions[1],
        (json!("DISQUALIFIED_OVERQUOTA"), json!("https://panel/overquota"))
    );

    // Re-triggering returns the stored decision
    let (status, again) = send(&app.router, "POST", "/studies/study-q/admission/late", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["rank"], 2);
    assert_eq!(again["decision"], "DISQUALIFIED_OVERQUOTA");

    let (_, stats) = send(&app.router, "GET", "/studies/study-q/quota-stats", None).await;
    assert_eq!(stats["total_completed"], 2);
    assert_eq!(stats["qualified"], 1);
    assert_eq!(stats["disqualified"], 1);
    assert_eq!(stats["quota_limit"], 1);
}

#[tokio::test]
async fn test_delete_responses() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_test_app(dir.path()).await;
    seed_study(&app.db, "study-a", 2).await;

    send(&app.router, "POST", "/sessions/study-a/p1", Some(json!({"token": "t"}))).await;
    send(&app.router, "POST", "/sessions/study-a/p1/answer", Some(json!({"answer": "hi"}))).await;

    let (status, list) = send(&app.router, "GET", "/studies/study-a/responses", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().map(Vec::len), Some(1));

    let (status, _) = send(&app.router, "DELETE", "/studies/study-a/responses/p1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app.router, "GET", "/studies/study-a/responses/p1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app.router, "GET", "/sessions/study-a/p1/step", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app.router, "DELETE", "/studies/study-a/responses/p1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Starting again sequences from scratch
    let (_, view) = send(&app.router, "POST", "/sessions/study-a/p1", Some(json!({"token": "t"}))).await;
    assert_eq!(view["current_index"], 0);
    assert_eq!(view["reentry_count"], 0);
}

#[tokio::test]
async fn test_event_stream_content_type() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_test_app(dir.path()).await;

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
}

#[tokio::test]
async fn test_demographic_quota_admission() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_test_app(dir.path()).await;
    seed_study(&app.db, "study-d", 1).await;
    emx_session::aggregator::db_source::put_module_config(
        &app.db,
        "study-d",
        emx_session::aggregator::SourceKind::Demographic,
        &json!({"questions": {"age": {"enabled": true}}}),
    )
    .await
    .unwrap();

    let (status, _) = send(
        &app.router,
        "PUT",
        "/studies/study-d/demographic-quotas",
        Some(json!([{"dimension": "age", "value": "25-34", "quota": 1}])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, rules) = send(&app.router, "GET", "/studies/study-d/demographic-quotas", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rules[0]["is_active"], true);

    let mut last_outcomes = Vec::new();
    for participant in ["first", "second"] {
        let uri = format!("/sessions/study-d/{}", participant);
        let (_, view) = send(&app.router, "POST", &uri, Some(json!({"token": "t"}))).await;
        assert_eq!(view["current_step"]["kind"], "demographic");

        let answer_uri = format!("{}/answer", uri);
        // demographic, welcome, q1, thank-you
        let answers = [json!({"age": "25-34"}), json!(null), json!("fine"), json!(null)];
        let mut last = serde_json::Value::Null;
        for answer in answers {
            let (status, body) = send(&app.router, "POST", &answer_uri, Some(json!({ "answer": answer }))).await;
            assert_eq!(status, StatusCode::OK);
            last = body;
        }
        assert_eq!(last["outcome"], "completed");
        last_outcomes.push(last);
    }

    assert_eq!(last_outcomes[0]["admission"]["decision"], "QUALIFIED");
    let second = &last_outcomes[1]["admission"];
    assert_eq!(second["decision"], "DISQUALIFIED_OVERQUOTA");
    assert_eq!(second["reason"]["kind"], "demographic");
    assert_eq!(second["reason"]["dimension"], "age");
    assert_eq!(second["reason"]["value"], "25-34");

    let (_, stats) = send(&app.router, "GET", "/studies/study-d/quota-stats", None).await;
    assert_eq!(stats["demographic"][0]["current_count"], 1);
    assert_eq!(stats["demographic"][0]["max_quota"], 1);

    let (status, _) = send(
        &app.router,
        "PUT",
        "/studies/study-d/demographic-quotas",
        Some(json!([{"dimension": "age", "value": "25-34", "quota": -2}])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
