use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use server_api::{dispatch, ApiContext};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{LoginRequest, LoginResponse, RpcEnvelope, RpcResponse},
};
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer};
use tracing::{debug, error, info};

pub mod config;

use config::Settings;

const MAX_USERNAME_BYTES: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub api: ApiContext,
}

impl AppState {
    pub fn new(api: ApiContext) -> Self {
        Self { api }
    }
}

type Rejection = (StatusCode, Json<ApiError>);

pub fn build_router(state: Arc<AppState>, settings: &Settings) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/rpc", post(rpc))
        .layer(RequestBodyLimitLayer::new(settings.max_body_bytes))
        .layer(request_timeout_layer(settings))
        .with_state(state)
}

/// Requests running past the configured timeout get `408 Request Timeout`.
pub fn request_timeout_layer(settings: &Settings) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, settings.request_timeout())
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> Rejection {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            error!("healthz: storage unavailable: {err:#}");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<LoginResponse>, Rejection> {
    let req: LoginRequest = serde_json::from_slice(&body)
        .map_err(|e| reject(ApiError::validation(format!("malformed login request: {e}"))))?;

    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ApiError::validation("username must not be empty")));
    }
    if username.len() > MAX_USERNAME_BYTES {
        return Err(reject(ApiError::validation("username is too long")));
    }
    let display_name = req
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());

    let user_id = state
        .api
        .storage
        .create_user(username, display_name)
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    info!(user_id = user_id.0, username, "login: user ready");
    Ok(Json(LoginResponse { user_id }))
}

async fn rpc(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<RpcResponse>, Rejection> {
    let envelope: RpcEnvelope = serde_json::from_slice(&body)
        .map_err(|e| reject(ApiError::validation(format!("malformed rpc request: {e}"))))?;

    let method = envelope.request.method();
    let user_id = envelope.user_id.0;
    match dispatch(&state.api, envelope.user_id, envelope.request).await {
        Ok(response) => {
            debug!(method, user_id, kind = response.kind(), "rpc: handled");
            Ok(Json(response))
        }
        Err(err) => {
            if err.code == ErrorCode::Internal {
                error!(method, user_id, message = %err.message, "rpc: procedure failed");
            } else {
                debug!(method, user_id, code = ?err.code, "rpc: rejected");
            }
            Err(reject(err))
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
