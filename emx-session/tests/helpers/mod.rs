//! Shared utilities for emx-session integration tests

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use emx_common::db::{init_database, init_memory_database};
use emx_session::aggregator::db_source::put_module_config;
use emx_session::aggregator::SourceKind;
use emx_session::api::{build_router, AppContext, BuildInfo};
use emx_session::config::RuntimeSettings;
use emx_session::navigator::{SessionManager, SessionServices};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tower::util::ServiceExt;

pub struct TestApp {
    pub router: Router,
    pub db: SqlitePool,
    pub manager: Arc<SessionManager>,
}

/// Router over an in-memory database and a cache under `cache_dir`
pub async fn create_test_app(cache_dir: &Path) -> TestApp {
    let db = init_memory_database().await.expect("in-memory database");
    app_over(db, cache_dir)
}

/// Router over a database file, for tests that need several connections
pub async fn create_file_backed_app(root: &Path) -> TestApp {
    let db = init_database(&root.join("emx.db")).await.expect("database file");
    app_over(db, &root.join("cache"))
}

fn app_over(db: SqlitePool, cache_dir: &Path) -> TestApp {
    let services = Arc::new(SessionServices::new(
        db.clone(),
        cache_dir,
        RuntimeSettings::default(),
        Vec::new(),
    ));
    let manager = Arc::new(SessionManager::new(services));
    let router = build_router(AppContext::new(Arc::clone(&manager), BuildInfo::default()), &[]);
    TestApp { router, db, manager }
}

/// A study with `questions` cognitive tasks; bookends and fillers are synthesized
pub async fn seed_study(db: &SqlitePool, study_id: &str, questions: usize) {
    let list: Vec<Value> = (1..=questions)
        .map(|i| json!({"id": format!("q{}", i), "type": "short_text", "title": format!("Question {}", i)}))
        .collect();
    put_module_config(db, study_id, SourceKind::Cognitive, &json!({ "questions": list }))
        .await
        .expect("seed study");
}

/// Send a request and decode the JSON response body (`Null` when empty)
pub async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("JSON body")
    };
    (status, value)
}
