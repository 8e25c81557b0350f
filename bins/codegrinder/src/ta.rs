// TA role: signs incoming commits, routes them to a daycare, verifies and
// persists the graded results, and tracks the daycare fleet.
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use codegrinder_common::{signing, CommitBundle, DaycareRegistration, Version};
use rand::RngCore;
use std::sync::Arc;
use tracing::{error, info};

use crate::daycare::problem_types::ProblemTypeRegistry;
use crate::registry::RegistryError;
use crate::storage;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v2/version", get(get_version))
        .route("/v2/stats", get(get_stats))
        .route(
            "/v2/daycare_registrations",
            get(get_daycare_registrations).post(post_daycare_registration),
        )
        .route(
            "/v2/commit_bundles/unsigned",
            post(post_commit_bundle_unsigned),
        )
        .route("/v2/commit_bundles/signed", post(post_commit_bundle_signed))
        .route(
            "/v2/assignments/:assignment_id/problems/:problem_id/steps/:step/commits/last",
            get(get_commit_last),
        )
}

/// Error body shape for every TA endpoint: { "error": "<msg>" }.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        error!(status = status.as_u16(), message = %message, "request failed");
        ApiError { status, message }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

/// GET /v2/version
async fn get_version() -> Json<Version> {
    Json(Version::current())
}

/// GET /v2/stats
async fn get_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.metrics.snapshot())
}

/// GET /v2/daycare_registrations - the live fleet map
async fn get_daycare_registrations(
    State(state): State<Arc<AppState>>,
) -> Json<std::collections::HashMap<String, DaycareRegistration>> {
    Json(state.registry.snapshot().await)
}

/// POST /v2/daycare_registrations
async fn post_daycare_registration(
    State(state): State<Arc<AppState>>,
    Json(reg): Json<DaycareRegistration>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .insert(reg)
        .await
        .map_err(|err| ApiError::bad_request(format!("bad daycare registration: {err}")))?;
    Ok(StatusCode::OK)
}

/// POST /v2/commit_bundles/unsigned - validate, sign, and route a commit
async fn post_commit_bundle_unsigned(
    State(state): State<Arc<AppState>>,
    Json(mut bundle): Json<CommitBundle>,
) -> Result<Json<CommitBundle>, ApiError> {
    check_unsigned(&bundle, &state.problem_types).map_err(ApiError::bad_request)?;

    let now = Utc::now();
    bundle.commit.created_at = now;
    bundle.commit.updated_at = now;
    bundle.commit.score = 0.0;

    let nonce = generate_nonce();
    bundle.problem_signature = Some(signing::sign_problem(
        &state.secret,
        &bundle.commit,
        &nonce,
    ));
    bundle.nonce = Some(nonce);

    let host = state
        .registry
        .assign(&bundle.problem_type)
        .await
        .map_err(|err| match err {
            RegistryError::NoEligibleDaycare => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            other => ApiError::internal(other.to_string()),
        })?;
    bundle.daycare_host = Some(host.clone());

    info!(
        problem_type = %bundle.problem_type,
        action = %bundle.commit.action,
        assignment_id = bundle.commit.assignment_id,
        daycare_host = %host,
        "commit bundle signed"
    );
    Ok(Json(bundle))
}

/// POST /v2/commit_bundles/signed - verify a graded bundle and persist it
async fn post_commit_bundle_signed(
    State(state): State<Arc<AppState>>,
    Json(bundle): Json<CommitBundle>,
) -> Result<Json<CommitBundle>, ApiError> {
    bundle
        .verify_commit_signature(&state.secret)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    bundle
        .commit
        .validate_score()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let Some(redis) = state.redis.clone() else {
        return Err(ApiError::internal("commit store is not configured"));
    };
    let mut conn = redis;
    storage::store_bundle(&mut conn, &bundle)
        .await
        .map_err(|err| ApiError::internal(format!("failed to persist commit: {err}")))?;

    info!(
        assignment_id = bundle.commit.assignment_id,
        problem_id = bundle.commit.problem_id,
        step = bundle.commit.step,
        score = bundle.commit.score,
        "graded commit persisted"
    );
    Ok(Json(bundle))
}

/// GET /v2/assignments/{a}/problems/{p}/steps/{s}/commits/last
async fn get_commit_last(
    State(state): State<Arc<AppState>>,
    Path((assignment_id, problem_id, step)): Path<(i64, i64, i64)>,
) -> Result<Json<CommitBundle>, ApiError> {
    let Some(redis) = state.redis.clone() else {
        return Err(ApiError::internal("commit store is not configured"));
    };
    let mut conn = redis;
    let bundle = storage::get_bundle(&mut conn, assignment_id, problem_id, step)
        .await
        .map_err(|err| ApiError::internal(format!("failed to load commit: {err}")))?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "not found"))?;
    Ok(Json(bundle))
}

/// An unsigned bundle must be a fresh commit for a known action: no
/// transcript, no report card, no signatures, and clean file paths.
fn check_unsigned(bundle: &CommitBundle, problem_types: &ProblemTypeRegistry) -> Result<(), String> {
    problem_types
        .action(&bundle.problem_type, &bundle.commit.action)
        .map_err(|err| err.to_string())?;
    bundle
        .commit
        .validate_file_paths()
        .map_err(|err| err.to_string())?;
    if !bundle.commit.transcript.is_empty() {
        return Err("an unsigned commit must not carry a transcript".to_string());
    }
    if bundle.commit.report_card.is_some() {
        return Err("an unsigned commit must not carry a report card".to_string());
    }
    if bundle.problem_signature.is_some() || bundle.commit_signature.is_some() {
        return Err("an unsigned bundle must not carry signatures".to_string());
    }
    Ok(())
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}
