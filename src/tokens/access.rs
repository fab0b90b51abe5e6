//! Signed, stateless access tokens (HS256 JWT).
//!
//! Access tokens are never persisted. Each one names the session it was
//! issued for in the `sid` claim; the per-request session check happens in
//! the credential store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{TokenConfig, MAX_TOKEN_TTL_SECONDS};
use crate::storage::models::{Role, User};

/// Claims embedded in every access token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub jti: String,
    pub org: Option<String>,
    pub role: Role,
    /// Session the token was issued for
    pub sid: String,
    /// User id
    pub sub: String,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Failed to encode token: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
}

/// A freshly signed access token
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub expires_at: DateTime<Utc>,
    pub session_id: String,
    pub token: String,
}

/// Signs and verifies access tokens with one HMAC secret.
#[derive(Clone)]
pub struct TokenIssuer {
    decoding: DecodingKey,
    encoding: EncodingKey,
    issuer: String,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            issuer: config.issuer.clone(),
            ttl: Duration::seconds(config.access_ttl_seconds.min(MAX_TOKEN_TTL_SECONDS) as i64),
        }
    }

    /// Access token lifetime in whole seconds
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl.num_seconds()
    }

    pub fn issue(
        &self,
        user: &User,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessToken, TokenError> {
        let expires_at = now + self.ttl;
        let claims = AccessClaims {
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
            org: user.organization_id.clone(),
            role: user.role,
            sid: session_id.to_string(),
            sub: user.id.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;

        Ok(AccessToken {
            expires_at: Utc
                .timestamp_opt(claims.exp, 0)
                .single()
                .unwrap_or(expires_at),
            session_id: session_id.to_string(),
            token,
        })
    }

    /// Verify signature, issuer and expiry (no leeway).
    pub fn verify(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        decode::<AccessClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_user, test_config};

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(&test_config().tokens)
    }

    #[test]
    fn test_issue_and_verify() {
        let user = make_user("u1", "a@example.com", Role::Admin, Some("org-1"));
        let token = issuer().issue(&user, "s1", Utc::now()).unwrap();

        let claims = issuer().verify(&token.token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.sid, "s1");
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.org.as_deref(), Some("org-1"));
        assert_eq!(claims.exp, token.expires_at.timestamp());
    }

    #[test]
    fn test_expired_token_rejected() {
        let user = make_user("u1", "a@example.com", Role::Agent, Some("org-1"));
        let issued_at = Utc::now() - Duration::hours(2);
        let token = issuer().issue(&user, "s1", issued_at).unwrap();

        assert!(matches!(
            issuer().verify(&token.token),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let user = make_user("u1", "a@example.com", Role::Agent, Some("org-1"));
        let mut other = test_config().tokens;
        other.jwt_secret = "a-completely-different-secret-of-32-bytes".to_string();
        let token = TokenIssuer::new(&other)
            .issue(&user, "s1", Utc::now())
            .unwrap();

        assert!(matches!(
            issuer().verify(&token.token),
            Err(TokenError::Invalid)
        ));
        assert!(matches!(issuer().verify("garbage"), Err(TokenError::Invalid)));
    }
}
