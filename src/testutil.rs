//! Shared test helpers, available to all `#[cfg(test)]` modules in the crate.

use std::sync::OnceLock;

use chrono::Utc;
use tempfile::TempDir;

use crate::auth::{CredentialStore, Principal};
use crate::config::{Config, RefreshSettings, ServerConfig, TokenConfig};
use crate::storage::models::{Actor, ClientMetadata, Role, Session, User};
use crate::storage::Database;
use crate::tokens::{hash_token, password};

/// Password of every user created by [`seed_user`]
pub const TEST_PASSWORD: &str = "password123";

/// Open a fresh database in a temporary directory.
///
/// Returns both the `Database` and the `TempDir` guard; the caller must
/// keep the `TempDir` alive for the duration of the test.
pub fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(temp_dir.path()).unwrap();
    (db, temp_dir)
}

/// A minimal `Config` suitable for unit tests.
pub fn test_config() -> Config {
    Config {
        bootstrap: None,
        refresh: RefreshSettings::default(),
        server: ServerConfig {
            bind_address: "127.0.0.1:8080".to_string(),
            data_dir: "/tmp/test".to_string(),
        },
        test_mode: true,
        tokens: TokenConfig {
            jwt_secret: "test-secret-that-is-at-least-32-bytes".to_string(),
            ..TokenConfig::default()
        },
    }
}

pub fn test_store(db: Database) -> CredentialStore {
    CredentialStore::new(db, &test_config().tokens)
}

/// Argon2 hash of [`TEST_PASSWORD`], computed once per test binary
fn test_password_hash() -> String {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| password::hash_password(TEST_PASSWORD).unwrap())
        .clone()
}

/// Build a `User` (not stored) whose password is [`TEST_PASSWORD`].
pub fn make_user(id: &str, email: &str, role: Role, organization_id: Option<&str>) -> User {
    let now = Utc::now();
    User {
        created_at: now,
        email: email.to_string(),
        full_name: None,
        id: id.to_string(),
        is_active: true,
        last_login_at: None,
        organization_id: organization_id.map(str::to_string),
        password_changed_at: None,
        password_hash: test_password_hash(),
        role,
        updated_at: now,
    }
}

/// Store a user with a random id and return it.
pub fn seed_user(
    store: &CredentialStore,
    email: &str,
    role: Role,
    organization_id: Option<&str>,
) -> User {
    let user = make_user(&uuid::Uuid::new_v4().to_string(), email, role, organization_id);
    assert!(store
        .database()
        .insert_user(&user, Actor::System, None)
        .unwrap());
    user
}

/// The principal a user would have while holding session `session_id`.
pub fn principal_for(user: &User, session_id: &str) -> Principal {
    Principal {
        organization_id: user.organization_id.clone(),
        role: user.role,
        session_id: session_id.to_string(),
        user_id: user.id.clone(),
    }
}

/// Create a live `Session` with the given id and owner.
///
/// Its refresh token is `rt_<id>`.
pub fn make_session(id: &str, user_id: &str) -> Session {
    let now = Utc::now();
    Session {
        client: ClientMetadata::default(),
        created_at: now,
        expires_at: now + chrono::Duration::hours(24),
        generation: 0,
        id: id.to_string(),
        last_used_at: None,
        organization_id: Some("org-1".to_string()),
        refresh_token_hash: hash_token(&format!("rt_{id}")),
        revoked_at: None,
        revoked_reason: None,
        user_id: user_id.to_string(),
    }
}
