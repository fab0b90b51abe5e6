use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::AuthError;
use super::Principal;
use crate::storage::models::{Actor, ClientMetadata, RevocationReason, Role, Session};
use crate::storage::{Database, RevokeOutcome};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// 1-based page selection, clamped to sane bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    #[serde(default = "first_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn first_page() -> usize {
    1
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Slice one page out of an already ordered list
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let normalized = Self::new(self.page, self.page_size);
        items
            .into_iter()
            .skip((normalized.page - 1) * normalized.page_size)
            .take(normalized.page_size)
            .collect()
    }
}

/// Session as shown to API callers (no refresh hash)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub active: bool,
    pub client: ClientMetadata,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub generation: u64,
    pub id: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub organization_id: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<RevocationReason>,
    pub user_id: String,
}

impl SessionView {
    fn at(session: Session, now: DateTime<Utc>) -> Self {
        Self {
            active: session.is_active_at(now),
            client: session.client,
            created_at: session.created_at,
            expires_at: session.expires_at,
            generation: session.generation,
            id: session.id,
            last_used_at: session.last_used_at,
            organization_id: session.organization_id,
            revoked_at: session.revoked_at,
            revoked_reason: session.revoked_reason,
            user_id: session.user_id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFilter {
    #[serde(default)]
    pub include_revoked: bool,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionPage {
    pub items: Vec<SessionView>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Revocation {
    /// True if the session was already revoked before this call
    pub already_revoked: bool,
    pub session: SessionView,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokeAllOutcome {
    /// The requester's own session was among those revoked; it must treat
    /// itself as logged out.
    pub includes_current_session: bool,
    pub revoked: usize,
    pub session_ids: Vec<String>,
}

/// What a principal is allowed to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Visibility {
    All,
    Organization(String),
    OwnUser(String),
}

impl Visibility {
    pub(crate) fn of(principal: &Principal) -> Self {
        match (principal.role, &principal.organization_id) {
            (Role::SystemOwner, _) => Visibility::All,
            (Role::Admin, Some(org)) => Visibility::Organization(org.clone()),
            _ => Visibility::OwnUser(principal.user_id.clone()),
        }
    }

    pub(crate) fn allows(&self, user_id: &str, organization_id: Option<&str>) -> bool {
        match self {
            Visibility::All => true,
            Visibility::Organization(org) => organization_id == Some(org.as_str()),
            Visibility::OwnUser(own) => own == user_id,
        }
    }

    fn allows_session(&self, session: &Session) -> bool {
        self.allows(&session.user_id, session.organization_id.as_deref())
    }
}

/// Enumerates and revokes sessions under role-scoped visibility.
///
/// All visibility decisions for sessions are made here.
#[derive(Clone)]
pub struct SessionRegistry {
    db: Database,
}

impl SessionRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Sessions visible to `requester`, newest first.
    ///
    /// A `user_id` filter narrows the visible set; it never widens it.
    pub fn list_sessions(
        &self,
        requester: &Principal,
        filter: &SessionFilter,
        page: PageRequest,
    ) -> Result<SessionPage, AuthError> {
        let visibility = Visibility::of(requester);
        let now = Utc::now();

        let candidates = match &filter.user_id {
            Some(user_id) => self.db.get_sessions_by_user(user_id)?,
            None => self.db.get_all_sessions()?,
        };

        let mut visible: Vec<Session> = candidates
            .into_iter()
            .filter(|s| visibility.allows_session(s))
            .filter(|s| filter.include_revoked || s.is_active_at(now))
            .collect();
        visible.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = visible.len();
        let items = page
            .apply(visible)
            .into_iter()
            .map(|s| SessionView::at(s, now))
            .collect();
        Ok(SessionPage { items, total })
    }

    /// Revoke one session. Revoking an already revoked session succeeds
    /// without a new audit entry.
    pub fn revoke(
        &self,
        requester: &Principal,
        session_id: &str,
        ip_address: Option<String>,
    ) -> Result<Revocation, AuthError> {
        let session = self
            .db
            .get_session(session_id)?
            .ok_or_else(|| AuthError::NotFound("session".to_string()))?;
        if !Visibility::of(requester).allows_session(&session) {
            return Err(AuthError::denied("Session is not visible to you"));
        }

        let reason = if session.user_id == requester.user_id {
            RevocationReason::Logout
        } else {
            RevocationReason::AdminRevoke
        };
        let now = Utc::now();
        let outcome = self.db.revoke_session(
            session_id,
            reason,
            Actor::User(requester.user_id.clone()),
            ip_address,
            now,
        )?;

        match outcome {
            RevokeOutcome::Revoked(session) => {
                info!(
                    session_id = %session.id,
                    user_id = %session.user_id,
                    performed_by = %requester.user_id,
                    "Session revoked"
                );
                Ok(Revocation {
                    already_revoked: false,
                    session: SessionView::at(session, now),
                })
            }
            RevokeOutcome::AlreadyRevoked(session) => Ok(Revocation {
                already_revoked: true,
                session: SessionView::at(session, now),
            }),
            RevokeOutcome::NotFound => Err(AuthError::NotFound("session".to_string())),
        }
    }

    /// Revoke every active session of `target_user_id`.
    pub fn revoke_all(
        &self,
        requester: &Principal,
        target_user_id: &str,
        ip_address: Option<String>,
    ) -> Result<RevokeAllOutcome, AuthError> {
        let target = self
            .db
            .get_user(target_user_id)?
            .ok_or_else(|| AuthError::NotFound("user".to_string()))?;
        if !Visibility::of(requester).allows(&target.id, target.organization_id.as_deref()) {
            return Err(AuthError::denied("User is not visible to you"));
        }

        let reason = if target.id == requester.user_id {
            RevocationReason::LogoutAll
        } else {
            RevocationReason::AdminRevoke
        };
        let revoked = self.db.revoke_user_sessions(
            &target.id,
            reason,
            Actor::User(requester.user_id.clone()),
            ip_address,
            Utc::now(),
        )?;

        let session_ids: Vec<String> = revoked.into_iter().map(|s| s.id).collect();
        let includes_current_session = session_ids.contains(&requester.session_id);
        info!(
            user_id = %target.id,
            performed_by = %requester.user_id,
            revoked = session_ids.len(),
            "All sessions revoked"
        );

        Ok(RevokeAllOutcome {
            includes_current_session,
            revoked: session_ids.len(),
            session_ids,
        })
    }
}
