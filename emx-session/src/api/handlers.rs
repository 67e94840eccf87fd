//! HTTP request handlers

use super::error::{ApiError, ApiResult};
use super::server::AppContext;
use crate::admission::{Admission, DemographicQuota, QuotaConfig, QuotaStats};
use crate::aggregator::DeviceClass;
use crate::error::Error;
use crate::ledger::LedgerDocument;
use crate::navigator::{DenyReason, NavigationOutcome, Progress, SessionView, SubmitOutcome};
use crate::session::{FlowPhase, SessionKey};
use crate::steps::StepDescriptor;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
    git_hash: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    device: DeviceClass,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    token: String,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    #[serde(default)]
    answer: Value,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct NavigateRequest {
    index: usize,
}

#[derive(Debug, Deserialize)]
pub struct RecordingRequest {
    step_id: String,
    samples: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct StepResponse {
    #[serde(flatten)]
    phase: FlowPhase,
    current_index: usize,
    step: Option<StepDescriptor>,
}

#[derive(Debug, Serialize)]
pub struct AnswerResponse {
    #[serde(flatten)]
    outcome: SubmitOutcome,
    session: SessionView,
}

#[derive(Debug, Serialize)]
pub struct NavigateResponse {
    moved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    denied_reason: Option<DenyReason>,
    #[serde(flatten)]
    session: SessionView,
}

#[derive(Debug, Serialize)]
pub struct RecordingResponse {
    buffered: usize,
}

// ============================================================================
// Health
// ============================================================================

/// GET /health
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "emx-session".to_string(),
        version: ctx.build.version.to_string(),
        git_hash: ctx.build.git_hash.to_string(),
    })
}

// ============================================================================
// Sessions
// ============================================================================

/// POST /sessions/:study_id/:participant_id - start or resume a session
pub async fn start_session(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
    body: Option<Json<StartSessionRequest>>,
) -> ApiResult<Json<SessionView>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let key = SessionKey::new(study_id, participant_id);
    let view = ctx.manager.start(key, req.token, req.device).await?;
    Ok(Json(view))
}

/// POST /sessions/:study_id/:participant_id/login
pub async fn login(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<SessionView>> {
    let handle = ctx.manager.get(&SessionKey::new(study_id, participant_id)).await?;
    Ok(Json(handle.login(req.token).await?))
}

/// GET /sessions/:study_id/:participant_id/step
pub async fn current_step(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
) -> ApiResult<Json<StepResponse>> {
    let handle = ctx.manager.get(&SessionKey::new(study_id, participant_id)).await?;
    let view = handle.view().await?;
    Ok(Json(StepResponse {
        phase: view.phase,
        current_index: view.current_index,
        step: view.current_step,
    }))
}

/// GET /sessions/:study_id/:participant_id/progress
pub async fn progress(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
) -> ApiResult<Json<Progress>> {
    let handle = ctx.manager.get(&SessionKey::new(study_id, participant_id)).await?;
    Ok(Json(handle.view().await?.progress))
}

/// POST /sessions/:study_id/:participant_id/answer - complete the current step
pub async fn submit_answer(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
    Json(req): Json<AnswerRequest>,
) -> ApiResult<Json<AnswerResponse>> {
    let handle = ctx.manager.get(&SessionKey::new(study_id, participant_id)).await?;
    let (outcome, session) = handle.submit(req.answer, req.metadata).await?;
    Ok(Json(AnswerResponse { outcome, session }))
}

/// POST /sessions/:study_id/:participant_id/navigate
///
/// A denied jump is a normal response with `moved: false`.
pub async fn navigate(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
    Json(req): Json<NavigateRequest>,
) -> ApiResult<Json<NavigateResponse>> {
    let handle = ctx.manager.get(&SessionKey::new(study_id, participant_id)).await?;
    let outcome = handle.navigate(req.index).await?;
    let session = handle.view().await?;

    let denied_reason = match outcome {
        NavigationOutcome::Moved { .. } => None,
        NavigationOutcome::Denied { reason, .. } => Some(reason),
    };
    Ok(Json(NavigateResponse {
        moved: denied_reason.is_none(),
        denied_reason,
        session,
    }))
}

/// POST /sessions/:study_id/:participant_id/recording - buffer samples for a timed step
pub async fn append_recording(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
    Json(req): Json<RecordingRequest>,
) -> ApiResult<Json<RecordingResponse>> {
    let handle = ctx.manager.get(&SessionKey::new(study_id, participant_id)).await?;
    let buffered = handle.append_recording(req.step_id, req.samples).await?;
    Ok(Json(RecordingResponse { buffered }))
}

// ============================================================================
// Admission
// ============================================================================

/// GET /studies/:study_id/admission/:participant_id - stored decision
pub async fn get_admission(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
) -> ApiResult<Json<Admission>> {
    ctx.admission
        .decision(&study_id, &participant_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError(Error::NotFound(format!(
                "no admission decision for {}/{}",
                study_id, participant_id
            )))
        })
}

/// POST /studies/:study_id/admission/:participant_id - decide, or return the stored decision
pub async fn trigger_admission(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
) -> ApiResult<Json<Admission>> {
    Ok(Json(ctx.admission.admit_completed(&study_id, &participant_id).await?))
}

/// GET /studies/:study_id/quota-stats
pub async fn quota_stats(
    State(ctx): State<AppContext>,
    Path(study_id): Path<String>,
) -> ApiResult<Json<QuotaStats>> {
    Ok(Json(ctx.admission.quota_stats(&study_id).await?))
}

/// PUT /studies/:study_id/quota
pub async fn put_quota(
    State(ctx): State<AppContext>,
    Path(study_id): Path<String>,
    Json(config): Json<QuotaConfig>,
) -> ApiResult<Json<QuotaStats>> {
    ctx.admission.set_quota(&study_id, &config).await?;
    Ok(Json(ctx.admission.quota_stats(&study_id).await?))
}

/// GET /studies/:study_id/demographic-quotas
pub async fn get_demographic_quotas(
    State(ctx): State<AppContext>,
    Path(study_id): Path<String>,
) -> ApiResult<Json<Vec<DemographicQuota>>> {
    Ok(Json(ctx.admission.demographic_quota_rules(&study_id).await?))
}

/// PUT /studies/:study_id/demographic-quotas - replace every rule of the study
pub async fn put_demographic_quotas(
    State(ctx): State<AppContext>,
    Path(study_id): Path<String>,
    Json(quotas): Json<Vec<DemographicQuota>>,
) -> ApiResult<Json<QuotaStats>> {
    ctx.admission.set_demographic_quotas(&study_id, &quotas).await?;
    Ok(Json(ctx.admission.quota_stats(&study_id).await?))
}

// ============================================================================
// Ledger
// ============================================================================

/// GET /studies/:study_id/responses
pub async fn list_responses(
    State(ctx): State<AppContext>,
    Path(study_id): Path<String>,
) -> ApiResult<Json<Vec<LedgerDocument>>> {
    Ok(Json(ctx.ledger.list_by_study(&study_id).await?))
}

/// GET /studies/:study_id/responses/:participant_id
pub async fn get_responses(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
) -> ApiResult<Json<LedgerDocument>> {
    ctx.ledger
        .find(&study_id, &participant_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError(Error::NotFound(format!(
                "no responses for {}/{}",
                study_id, participant_id
            )))
        })
}

/// DELETE /studies/:study_id/responses/:participant_id
///
/// Also stops the live session and drops its local snapshot, so a later
/// start sequences from scratch.
pub async fn delete_responses(
    State(ctx): State<AppContext>,
    Path((study_id, participant_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let key = SessionKey::new(study_id, participant_id);
    ctx.manager.remove(&key).await;
    ctx.cache.clear(&key).await?;

    if !ctx.ledger.delete_all(&key.study_id, &key.participant_id).await? {
        return Err(ApiError(Error::NotFound(format!("no responses for {}", key))));
    }
    info!(session = %key, "Participant responses deleted");
    Ok(StatusCode::NO_CONTENT)
}
