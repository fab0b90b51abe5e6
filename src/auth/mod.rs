//! Server-side credential and session management.

pub mod credentials;
pub mod error;
pub mod registry;

use serde::Serialize;

use crate::storage::models::Role;

pub use credentials::{CredentialStore, NewUser, UserFilter, UserListing};
pub use error::{AuthError, Denial, DenialKind};
pub use registry::{
    PageRequest, Revocation, RevokeAllOutcome, SessionFilter, SessionPage, SessionRegistry,
    SessionView,
};

/// The authenticated caller of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub organization_id: Option<String>,
    pub role: Role,
    /// Session named by the access token's `sid` claim
    pub session_id: String,
    pub user_id: String,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}
