use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::{AuthError, CredentialStore};
use crate::storage::models::ClientMetadata;
use crate::tokens::TokenPair;

/// Tokens a client holds for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_expires_at: DateTime<Utc>,
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: String,
}

impl Credentials {
    pub fn from_pair(pair: TokenPair, received_at: DateTime<Utc>) -> Self {
        Self {
            access_expires_at: received_at + chrono::Duration::seconds(pair.expires_in),
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            session_id: pair.session_id,
        }
    }
}

/// The auth endpoints a client talks to.
#[async_trait]
pub trait AuthUpstream: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError>;

    async fn logout(&self, access_token: &str, refresh_token: &str) -> Result<(), AuthError>;
}

/// Map a non-success JSend body to an `AuthError`.
///
/// 5xx responses without a known code are transient.
pub(crate) fn error_from_body(status: u16, body: &Value) -> AuthError {
    let data = body.get("data");
    let code = data
        .and_then(|d| d.get("code"))
        .or_else(|| body.get("code"))
        .and_then(Value::as_str);
    let message = data
        .and_then(|d| d.get("message"))
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("no message")
        .to_string();

    match code {
        Some(code) => AuthError::from_code(code, message),
        None if status >= 500 => AuthError::TransientUpstreamFailure(format!("HTTP {status}: {message}")),
        None => AuthError::Internal(format!("HTTP {status}: {message}")),
    }
}

/// Auth endpoints reached over HTTP
pub struct HttpUpstream {
    base_url: String,
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: Value,
    ) -> Result<T, AuthError> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthError::TransientUpstreamFailure(e.to_string()))?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| AuthError::TransientUpstreamFailure(e.to_string()))?;

        if (200..300).contains(&status) {
            let data = body.get("data").cloned().unwrap_or(Value::Null);
            serde_json::from_value(data).map_err(|e| AuthError::Internal(e.to_string()))
        } else {
            Err(error_from_body(status, &body))
        }
    }
}

#[async_trait]
impl AuthUpstream for HttpUpstream {
    async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
        self.post(
            "/auth/login",
            None,
            json!({ "email": email, "password": password }),
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        self.post(
            "/auth/refresh",
            None,
            json!({ "refresh_token": refresh_token }),
        )
        .await
    }

    async fn logout(&self, access_token: &str, refresh_token: &str) -> Result<(), AuthError> {
        let _: Value = self
            .post(
                "/auth/logout",
                Some(access_token),
                json!({ "refresh_token": refresh_token }),
            )
            .await?;
        Ok(())
    }
}

/// In-process upstream backed directly by a `CredentialStore`
#[derive(Clone)]
pub struct LocalUpstream {
    store: Arc<CredentialStore>,
}

impl LocalUpstream {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, AuthError>
    where
        T: Send + 'static,
        F: FnOnce(&CredentialStore) -> Result<T, AuthError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| AuthError::Internal(format!("credential task failed: {e}")))?
    }
}

#[async_trait]
impl AuthUpstream for LocalUpstream {
    async fn login(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
        let (email, password) = (email.to_string(), password.to_string());
        self.blocking(move |store| store.login(&email, &password, ClientMetadata::default()))
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let refresh_token = refresh_token.to_string();
        self.blocking(move |store| store.refresh(&refresh_token, None))
            .await
    }

    async fn logout(&self, access_token: &str, refresh_token: &str) -> Result<(), AuthError> {
        let (access_token, refresh_token) = (access_token.to_string(), refresh_token.to_string());
        self.blocking(move |store| {
            let principal = store.authenticate(&access_token)?;
            store.logout(&principal, &refresh_token, None).map(|_| ())
        })
        .await
    }
}
