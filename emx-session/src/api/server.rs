//! HTTP server setup and routing

use crate::admission::AdmissionController;
use crate::cache::LocalCache;
use crate::error::{Error, Result};
use crate::ledger::ResponseLedger;
use crate::navigator::SessionManager;
use crate::state::SharedState;
use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Build identification reported by `/health`
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub build_profile: &'static str,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: "unknown",
            build_timestamp: "unknown",
            build_profile: "unknown",
        }
    }
}

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub manager: Arc<SessionManager>,
    pub ledger: ResponseLedger,
    pub cache: Arc<LocalCache>,
    pub admission: Arc<AdmissionController>,
    pub state: Arc<SharedState>,
    pub build: BuildInfo,
}

impl AppContext {
    /// Context whose collaborators are the manager's own services
    pub fn new(manager: Arc<SessionManager>, build: BuildInfo) -> Self {
        let services = Arc::clone(manager.services());
        Self {
            ledger: services.ledger.clone(),
            cache: Arc::clone(&services.cache),
            admission: Arc::clone(&services.admission),
            state: Arc::clone(&services.state),
            manager,
            build,
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn build_router(ctx: AppContext, cors_origins: &[String]) -> Router {
    use super::handlers as h;

    Router::new()
        .route("/health", get(h::health))
        // Participant sessions
        .route("/sessions/:study_id/:participant_id", post(h::start_session))
        .route("/sessions/:study_id/:participant_id/login", post(h::login))
        .route("/sessions/:study_id/:participant_id/step", get(h::current_step))
        .route("/sessions/:study_id/:participant_id/progress", get(h::progress))
        .route("/sessions/:study_id/:participant_id/answer", post(h::submit_answer))
        .route("/sessions/:study_id/:participant_id/navigate", post(h::navigate))
        .route("/sessions/:study_id/:participant_id/recording", post(h::append_recording))
        // Admission and quota
        .route(
            "/studies/:study_id/admission/:participant_id",
            get(h::get_admission).post(h::trigger_admission),
        )
        .route("/studies/:study_id/quota-stats", get(h::quota_stats))
        .route("/studies/:study_id/quota", axum::routing::put(h::put_quota))
        .route(
            "/studies/:study_id/demographic-quotas",
            get(h::get_demographic_quotas).put(h::put_demographic_quotas),
        )
        // Ledger
        .route("/studies/:study_id/responses", get(h::list_responses))
        .route(
            "/studies/:study_id/responses/:participant_id",
            get(h::get_responses).delete(h::delete_responses),
        )
        .route("/events", get(super::sse::event_stream))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
}

/// Serve until Ctrl-C / SIGTERM, then snapshot every live session
pub async fn serve(addr: SocketAddr, router: Router, manager: Arc<SessionManager>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

    manager.shutdown_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
