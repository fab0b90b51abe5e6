//! jumla-auth - Session and access-token lifecycle for the Jumla lead-intake CRM
//!
//! This crate provides:
//! - Password login issuing short-lived JWT access tokens and rotating
//!   opaque refresh tokens, with reuse detection
//! - Role-scoped session listing and revocation
//! - A hash-chained, append-only audit log written in the same redb
//!   transaction as every mutation it describes
//! - A client-side refresh coordinator that lets any number of concurrent
//!   callers share one token rotation
//! - REST API with JSend envelopes

pub mod api;
pub mod audit;
pub mod auth;
pub mod client;
pub mod config;
pub mod device;
pub mod expiration;
pub mod storage;
#[cfg(test)]
pub mod testutil;
pub mod tokens;

use std::sync::Arc;

use audit::AuditLogger;
use auth::{CredentialStore, SessionRegistry};
use config::Config;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub audit: AuditLogger,
    pub config: Config,
    pub registry: SessionRegistry,
    pub store: Arc<CredentialStore>,
}

impl AppState {
    pub fn new(config: Config, db: Database) -> Self {
        Self {
            audit: AuditLogger::new(db.clone()),
            registry: SessionRegistry::new(db.clone()),
            store: Arc::new(CredentialStore::new(db, &config.tokens)),
            config,
        }
    }
}
