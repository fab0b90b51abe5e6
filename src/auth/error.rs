use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::DatabaseError;
use crate::tokens::password::PasswordError;
use crate::tokens::TokenError;

/// Flavor of a permission denial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    Generic,
    /// The action targets a credential of equal or higher privilege
    PrivilegedTarget,
}

impl DenialKind {
    pub fn code(self) -> &'static str {
        match self {
            DenialKind::Generic => "permission_denied",
            DenialKind::PrivilegedTarget => "privileged_target",
        }
    }

    /// User-facing explanation of the denial
    pub fn explanation(self) -> &'static str {
        match self {
            DenialKind::Generic => "You do not have permission to perform this action.",
            DenialKind::PrivilegedTarget => {
                "This account has administrator privileges. Only the system owner can change it."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub kind: DenialKind,
    pub message: String,
}

impl Denial {
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            kind: DenialKind::Generic,
            message: message.into(),
        }
    }

    pub fn privileged_target(message: impl Into<String>) -> Self {
        Self {
            kind: DenialKind::PrivilegedTarget,
            message: message.into(),
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Failure taxonomy shared by the server-side store and the client-side
/// coordinator. `Clone` so one rotation outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Session expired")]
    SessionExpired,
    #[error("Session revoked")]
    SessionRevoked,
    #[error("Refresh token reuse detected")]
    RefreshTokenReuse,
    #[error("Permission denied: {0}")]
    PermissionDenied(Denial),
    #[error("Upstream temporarily unavailable: {0}")]
    TransientUpstreamFailure(String),
    #[error("Audit write failed: {0}")]
    AuditWriteFailure(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn denied(message: impl Into<String>) -> Self {
        AuthError::PermissionDenied(Denial::generic(message))
    }

    pub fn privileged_target(message: impl Into<String>) -> Self {
        AuthError::PermissionDenied(Denial::privileged_target(message))
    }

    /// Stable machine-readable code, carried in JSend `fail` bodies
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::SessionExpired => "session_expired",
            AuthError::SessionRevoked => "session_revoked",
            AuthError::RefreshTokenReuse => "refresh_token_reuse",
            AuthError::PermissionDenied(denial) => denial.kind.code(),
            AuthError::TransientUpstreamFailure(_) => "transient_upstream_failure",
            AuthError::AuditWriteFailure(_) => "audit_write_failure",
            AuthError::NotFound(_) => "not_found",
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::Conflict(_) => "conflict",
            AuthError::Internal(_) => "internal",
        }
    }

    /// Rebuild an error from a wire code and message.
    ///
    /// Unknown codes become `Internal`.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "invalid_credentials" => AuthError::InvalidCredentials,
            "session_expired" => AuthError::SessionExpired,
            "session_revoked" => AuthError::SessionRevoked,
            "refresh_token_reuse" => AuthError::RefreshTokenReuse,
            "permission_denied" => AuthError::PermissionDenied(Denial::generic(message)),
            "privileged_target" => AuthError::PermissionDenied(Denial::privileged_target(message)),
            "transient_upstream_failure" => AuthError::TransientUpstreamFailure(message),
            "audit_write_failure" => AuthError::AuditWriteFailure(message),
            "not_found" => AuthError::NotFound(message),
            "invalid_request" => AuthError::InvalidRequest(message),
            "conflict" => AuthError::Conflict(message),
            _ => AuthError::Internal(message),
        }
    }

    /// True if a refresh that failed this way can never succeed for the
    /// same token pair, so the session must be logged out.
    pub fn is_terminal_for_refresh(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials
                | AuthError::SessionExpired
                | AuthError::SessionRevoked
                | AuthError::RefreshTokenReuse
                | AuthError::PermissionDenied(_)
        )
    }
}

impl From<DatabaseError> for AuthError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Audit(msg) => AuthError::AuditWriteFailure(msg),
            other => AuthError::Internal(other.to_string()),
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => AuthError::SessionExpired,
            TokenError::Invalid => AuthError::InvalidCredentials,
            TokenError::Encoding(e) => AuthError::Internal(e.to_string()),
        }
    }
}

impl From<PasswordError> for AuthError {
    fn from(e: PasswordError) -> Self {
        match e {
            PasswordError::TooShort(_) => AuthError::InvalidRequest(e.to_string()),
            other => AuthError::Internal(other.to_string()),
        }
    }
}
