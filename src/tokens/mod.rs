pub mod access;
pub mod generator;
pub mod password;

use serde::{Deserialize, Serialize};

pub use access::{AccessClaims, AccessToken, TokenError, TokenIssuer};
pub use generator::{generate_refresh_token, generate_token, hash_token};

/// Credentials handed to a client after login or refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    /// Seconds until the access token expires
    pub expires_in: i64,
    pub refresh_token: String,
    pub session_id: String,
    pub token_type: String,
}

impl TokenPair {
    pub fn bearer(access: AccessToken, refresh_token: String, expires_in: i64) -> Self {
        Self {
            access_token: access.token,
            expires_in,
            refresh_token,
            session_id: access.session_id,
            token_type: "bearer".to_string(),
        }
    }
}
