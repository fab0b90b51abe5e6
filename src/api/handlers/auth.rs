use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{blocking, UserView};
use crate::api::middleware::ClientInfo;
use crate::api::response::{ApiError, AppJson, JSend};
use crate::auth::{Principal, RevokeAllOutcome};
use crate::tokens::TokenPair;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub session_revoked: bool,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub session_id: String,
    pub user: UserView,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn login(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    AppJson(req): AppJson<LoginRequest>,
) -> Result<Json<JSend<TokenPair>>, ApiError> {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("email and password are required"));
    }

    let store = Arc::clone(&state.store);
    let metadata = client.metadata();
    let pair = blocking(move || store.login(&req.email, &req.password, metadata)).await?;
    Ok(JSend::success(pair))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    AppJson(req): AppJson<RefreshRequest>,
) -> Result<Json<JSend<TokenPair>>, ApiError> {
    if req.refresh_token.is_empty() {
        return Err(ApiError::bad_request("refresh_token is required"));
    }

    let store = Arc::clone(&state.store);
    let metadata = client.metadata();
    let pair = blocking(move || store.refresh(&req.refresh_token, Some(metadata))).await?;
    Ok(JSend::success(pair))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    client: ClientInfo,
    AppJson(req): AppJson<RefreshRequest>,
) -> Result<Json<JSend<LogoutResponse>>, ApiError> {
    let store = Arc::clone(&state.store);
    let session_revoked =
        blocking(move || store.logout(&principal, &req.refresh_token, client.ip_address)).await?;
    Ok(JSend::success(LogoutResponse { session_revoked }))
}

pub async fn logout_all(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    client: ClientInfo,
) -> Result<Json<JSend<RevokeAllOutcome>>, ApiError> {
    let outcome = state
        .registry
        .revoke_all(&principal, &principal.user_id, client.ip_address)?;
    Ok(JSend::success(outcome))
}

pub async fn me(
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> Result<Json<JSend<MeResponse>>, ApiError> {
    let user = state.store.current_user(&principal)?;
    Ok(JSend::success(MeResponse {
        session_id: principal.session_id,
        user: user.into(),
    }))
}
