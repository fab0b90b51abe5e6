use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{blocking, UserView};
use crate::api::middleware::ClientInfo;
use crate::api::response::{ApiError, AppJson, AppPath, AppQuery, JSend};
use crate::audit::{AuditFilter, AuditPage, ChainError};
use crate::auth::{
    AuthError, NewUser, PageRequest, Principal, Revocation, RevokeAllOutcome, SessionFilter,
    SessionPage, UserFilter,
};
use crate::storage::models::{AuditAction, EntityType, Role};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionsQuery {
    #[serde(default)]
    pub include_revoked: bool,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub action: Option<AuditAction>,
    pub entity_id: Option<String>,
    pub entity_type: Option<EntityType>,
    /// Honored for the system owner only; admins are pinned to their own
    pub organization_id: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub performed_by: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ChainVerification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<u64>,
    pub entries: Option<u64>,
    pub head: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub valid: bool,
}

#[derive(Debug, Deserialize)]
pub struct UsersQuery {
    pub is_active: Option<bool>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub role: Option<Role>,
}

#[derive(Debug, Serialize)]
pub struct UserPage {
    pub items: Vec<UserView>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub email: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordResponse {
    pub sessions_revoked: usize,
    pub user_email: String,
}

#[derive(Debug, Serialize)]
pub struct DeactivateResponse {
    pub sessions_revoked: usize,
    pub user: UserView,
}

fn page_of(page: Option<usize>, page_size: Option<usize>) -> PageRequest {
    let default = PageRequest::default();
    PageRequest::new(
        page.unwrap_or(default.page),
        page_size.unwrap_or(default.page_size),
    )
}

// ============================================================================
// Sessions
// ============================================================================

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    AppQuery(query): AppQuery<SessionsQuery>,
) -> Result<Json<JSend<SessionPage>>, ApiError> {
    let filter = SessionFilter {
        include_revoked: query.include_revoked,
        user_id: query.user_id,
    };
    let page = state.registry.list_sessions(
        &principal,
        &filter,
        page_of(query.page, query.page_size),
    )?;
    Ok(JSend::success(page))
}

pub async fn revoke_session(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    client: ClientInfo,
    AppPath(session_id): AppPath<String>,
) -> Result<Json<JSend<Revocation>>, ApiError> {
    let revocation = state
        .registry
        .revoke(&principal, &session_id, client.ip_address)?;
    Ok(JSend::success(revocation))
}

pub async fn revoke_user_sessions(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    client: ClientInfo,
    AppPath(user_id): AppPath<String>,
) -> Result<Json<JSend<RevokeAllOutcome>>, ApiError> {
    let outcome = state
        .registry
        .revoke_all(&principal, &user_id, client.ip_address)?;
    Ok(JSend::success(outcome))
}

// ============================================================================
// Audit log
// ============================================================================

pub async fn audit_logs(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    AppQuery(query): AppQuery<AuditQuery>,
) -> Result<Json<JSend<AuditPage>>, ApiError> {
    let organization_id = match principal.role {
        Role::SystemOwner => query.organization_id,
        Role::Admin => match principal.organization_id {
            Some(org) => Some(org),
            None => return Err(AuthError::denied("Admin has no organization").into()),
        },
        _ => return Err(AuthError::denied("Audit logs are restricted to administrators").into()),
    };

    let filter = AuditFilter {
        action: query.action,
        entity_id: query.entity_id,
        entity_type: query.entity_type,
        organization_id,
        performed_by: query.performed_by,
        since: query.since,
        until: query.until,
    };
    let page = state
        .audit
        .query(&filter, page_of(query.page, query.page_size))?;
    Ok(JSend::success(page))
}

pub async fn verify_audit_chain(
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> Result<Json<JSend<ChainVerification>>, ApiError> {
    if principal.role != Role::SystemOwner {
        return Err(AuthError::denied("Chain verification is restricted to the system owner").into());
    }

    let verification = match state.audit.verify_chain()? {
        Ok(report) => ChainVerification {
            broken_at: None,
            entries: Some(report.entries),
            head: Some(report.head),
            reason: None,
            valid: true,
        },
        Err(ChainError::Broken { reason, sequence }) => ChainVerification {
            broken_at: Some(sequence),
            entries: None,
            head: None,
            reason: Some(reason),
            valid: false,
        },
    };
    Ok(JSend::success(verification))
}

// ============================================================================
// Users
// ============================================================================

pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    client: ClientInfo,
    AppJson(req): AppJson<ResetPasswordRequest>,
) -> Result<Json<JSend<ResetPasswordResponse>>, ApiError> {
    let store = Arc::clone(&state.store);
    let change = blocking(move || {
        store.reset_password(&principal, &req.email, &req.new_password, client.ip_address)
    })
    .await?;

    Ok(JSend::success(ResetPasswordResponse {
        sessions_revoked: change.revoked.len(),
        user_email: change.user.email,
    }))
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    AppQuery(query): AppQuery<UsersQuery>,
) -> Result<Json<JSend<UserPage>>, ApiError> {
    let filter = UserFilter {
        is_active: query.is_active,
        role: query.role,
    };
    let listing = state.store.list_users(
        &principal,
        &filter,
        page_of(query.page, query.page_size),
    )?;
    Ok(JSend::success(UserPage {
        items: listing.users.into_iter().map(UserView::from).collect(),
        total: listing.total,
    }))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    client: ClientInfo,
    AppJson(req): AppJson<NewUser>,
) -> Result<(StatusCode, Json<JSend<UserView>>), ApiError> {
    let store = Arc::clone(&state.store);
    let user = blocking(move || store.create_user(&principal, req, client.ip_address)).await?;
    Ok((StatusCode::CREATED, JSend::success(user.into())))
}

pub async fn deactivate_user(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    client: ClientInfo,
    AppPath(user_id): AppPath<String>,
) -> Result<Json<JSend<DeactivateResponse>>, ApiError> {
    let change = state
        .store
        .deactivate_user(&principal, &user_id, client.ip_address)?;
    Ok(JSend::success(DeactivateResponse {
        sessions_revoked: change.revoked.len(),
        user: change.user.into(),
    }))
}
