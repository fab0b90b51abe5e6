//! Authenticated request execution.
//!
//! Every outbound call gets the current access token attached. A 401 is
//! answered by one rotation and one retry; a second 401 ends the session.
//! A 403 never triggers a refresh: it is classified and surfaced.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use super::manager::SessionManager;
use super::upstream::error_from_body;
use crate::auth::{AuthError, Denial};

/// Paths that authenticate by body rather than bearer token
const UNAUTHENTICATED_PATHS: [&str; 2] = ["/auth/login", "/auth/refresh"];

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub body: Option<Value>,
    pub method: Method,
    pub path: String,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            body: None,
            method: Method::GET,
            path: path.into(),
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            body: Some(body),
            method: Method::POST,
            path: path.into(),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            body: None,
            method: Method::DELETE,
            path: path.into(),
        }
    }

    fn needs_token(&self) -> bool {
        !UNAUTHENTICATED_PATHS.contains(&self.path.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub body: Value,
    pub status: u16,
}

/// Something that can carry an `ApiRequest` to the server
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>)
        -> Result<ApiResponse, AuthError>;
}

pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, AuthError> {
        let mut builder = self
            .client
            .request(request.method.clone(), format!("{}{}", self.base_url, request.path));
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AuthError::TransientUpstreamFailure(e.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AuthError::TransientUpstreamFailure(e.to_string()))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        Ok(ApiResponse { body, status })
    }
}

/// Executes API requests on behalf of the current session.
pub struct AuthGateway {
    sessions: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
}

impl AuthGateway {
    pub fn new(sessions: Arc<SessionManager>, transport: Arc<dyn Transport>) -> Self {
        Self {
            sessions,
            transport,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Send `request` and return the `data` member of a success envelope.
    pub async fn execute(&self, request: ApiRequest) -> Result<Value, AuthError> {
        if !request.needs_token() {
            let response = self.transport.send(&request, None).await?;
            return into_data(response);
        }

        let token = self.sessions.access_token().await?;
        let response = self.transport.send(&request, Some(&token)).await?;
        if response.status != 401 {
            return into_data(response);
        }

        debug!(path = %request.path, "Access token rejected, refreshing");
        let replacement = self.sessions.refresh_after_rejection(&token).await?;
        let retried = self.transport.send(&request, Some(&replacement)).await?;
        if retried.status == 401 {
            warn!(path = %request.path, "Fresh access token rejected, ending session");
            self.sessions.force_logout(AuthError::SessionRevoked).await;
            return Err(AuthError::SessionRevoked);
        }
        into_data(retried)
    }
}

fn into_data(response: ApiResponse) -> Result<Value, AuthError> {
    match response.status {
        200..=299 => Ok(response.body.get("data").cloned().unwrap_or(Value::Null)),
        403 => Err(classify_forbidden(&response.body)),
        status => Err(error_from_body(status, &response.body)),
    }
}

/// A 403 is always a permission denial; only the kind varies.
fn classify_forbidden(body: &Value) -> AuthError {
    match error_from_body(403, body) {
        denied @ AuthError::PermissionDenied(_) => denied,
        other => AuthError::PermissionDenied(Denial::generic(other.to_string())),
    }
}
