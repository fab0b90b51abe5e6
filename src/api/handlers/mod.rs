mod admin;
mod auth;

use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::response::{ApiError, JSend};
use crate::auth::AuthError;
use crate::storage::models::{Role, User};

pub use admin::{
    audit_logs, create_user, deactivate_user, list_sessions, list_users, reset_password,
    revoke_session, revoke_user_sessions, verify_audit_chain,
};
pub use auth::{login, logout, logout_all, me, refresh};

/// User as shown to API callers (no password hash)
#[derive(Debug, Serialize)]
pub struct UserView {
    pub created_at: DateTime<Utc>,
    pub email: String,
    pub full_name: Option<String>,
    pub id: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub organization_id: Option<String>,
    pub role: Role,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            created_at: user.created_at,
            email: user.email,
            full_name: user.full_name,
            id: user.id,
            is_active: user.is_active,
            last_login_at: user.last_login_at,
            organization_id: user.organization_id,
            role: user.role,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Run password hashing and other CPU-heavy store calls off the runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("worker task failed: {e}")))?
        .map_err(ApiError::from)
}
