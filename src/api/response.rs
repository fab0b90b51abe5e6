use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::AuthError;

// ============================================================================
// JSend status enum
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JSendStatus {
    Error,
    Fail,
    Success,
}

// ============================================================================
// JSend success envelope
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct JSend<T: Serialize> {
    pub data: T,
    pub status: JSendStatus,
}

impl<T: Serialize> JSend<T> {
    pub fn success(data: T) -> Json<JSend<T>> {
        Json(JSend {
            data,
            status: JSendStatus::Success,
        })
    }
}

// ============================================================================
// JSend fail envelope (client errors, 4xx)
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct JSendFail {
    pub data: FailData,
    pub status: JSendStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailData {
    pub code: String,
    pub message: String,
}

impl JSendFail {
    pub fn response(
        status_code: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> (StatusCode, Json<JSendFail>) {
        (
            status_code,
            Json(JSendFail {
                data: FailData {
                    code: code.into(),
                    message: message.into(),
                },
                status: JSendStatus::Fail,
            }),
        )
    }
}

// ============================================================================
// JSend error envelope (server errors, 5xx)
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct JSendError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    pub status: JSendStatus,
}

impl JSendError {
    pub fn response(
        status_code: StatusCode,
        code: Option<String>,
        message: impl Into<String>,
    ) -> (StatusCode, Json<JSendError>) {
        (
            status_code,
            Json(JSendError {
                code,
                message: message.into(),
                status: JSendStatus::Error,
            }),
        )
    }
}

// ============================================================================
// Unified error type for handlers
// ============================================================================

/// A JSend-compatible error that can be either a fail (4xx) or error (5xx).
/// Used as the error type in handler Result returns.
#[derive(Debug)]
pub enum ApiError {
    Fail {
        code: &'static str,
        message: String,
        status: StatusCode,
    },
    Error {
        code: Option<&'static str>,
        message: String,
        status: StatusCode,
    },
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::Fail {
                code,
                message,
                status,
            } => JSendFail::response(status, code, message).into_response(),
            ApiError::Error {
                code,
                message,
                status,
            } => JSendError::response(status, code.map(str::to_string), message).into_response(),
        }
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::Fail {
            code: "invalid_request",
            message: message.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Error {
            code: Some("internal"),
            message: message.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        let code = e.code();
        let fail = |status: StatusCode, message: String| ApiError::Fail {
            code,
            message,
            status,
        };

        match e {
            AuthError::InvalidCredentials
            | AuthError::SessionExpired
            | AuthError::SessionRevoked
            | AuthError::RefreshTokenReuse => fail(StatusCode::UNAUTHORIZED, e.to_string()),
            AuthError::PermissionDenied(ref denial) => {
                fail(StatusCode::FORBIDDEN, denial.message.clone())
            }
            AuthError::NotFound(_) => fail(StatusCode::NOT_FOUND, e.to_string()),
            AuthError::InvalidRequest(ref message) => fail(StatusCode::BAD_REQUEST, message.clone()),
            AuthError::Conflict(ref message) => fail(StatusCode::CONFLICT, message.clone()),
            AuthError::TransientUpstreamFailure(_) => {
                fail(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            AuthError::AuditWriteFailure(_) | AuthError::Internal(_) => {
                error!(error = %e, "Request failed");
                ApiError::Error {
                    code: Some(code),
                    message: e.to_string(),
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                }
            }
        }
    }
}

// ============================================================================
// Extractors with JSend rejections
// ============================================================================

/// `Json` whose rejection is a JSend fail body
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct AppJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct AppQuery<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct AppPath<T>(pub T);

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}
