use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::AuthError;
use super::registry::{PageRequest, Visibility};
use super::Principal;
use crate::audit::AuditLogger;
use crate::config::{TokenConfig, MAX_TOKEN_TTL_SECONDS};
use crate::storage::models::{
    Actor, AuditAction, AuditSnapshot, ClientMetadata, EntityType, NewAuditEntry,
    RevocationReason, Role, Session, User,
};
use crate::storage::{CredentialChange, Database, RevokeOutcome, RotationOutcome};
use crate::tokens::password::{self, MIN_OWNER_PASSWORD_LEN, MIN_PASSWORD_LEN};
use crate::tokens::{generate_refresh_token, hash_token, TokenIssuer, TokenPair};

/// Request to create a user account
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    /// Defaults to the requester's organization
    #[serde(default)]
    pub organization_id: Option<String>,
    pub password: String,
    pub role: Role,
}

/// Narrows a user listing; unset fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserFilter {
    pub is_active: Option<bool>,
    pub role: Option<Role>,
}

/// One page of users plus the number matching overall
#[derive(Debug, Clone)]
pub struct UserListing {
    pub total: usize,
    pub users: Vec<User>,
}

/// Owns user and session records.
///
/// Every method is blocking (redb and argon2); async callers go through
/// `spawn_blocking`.
pub struct CredentialStore {
    audit: AuditLogger,
    db: Database,
    issuer: TokenIssuer,
    refresh_ttl: Duration,
}

impl CredentialStore {
    pub fn new(db: Database, config: &TokenConfig) -> Self {
        Self {
            audit: AuditLogger::new(db.clone()),
            db,
            issuer: TokenIssuer::new(config),
            refresh_ttl: Duration::seconds(config.refresh_ttl_seconds.min(MAX_TOKEN_TTL_SECONDS) as i64),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Token lifecycle
    // ========================================================================

    /// Verify a password and open a new session.
    pub fn login(
        &self,
        email: &str,
        password: &str,
        client: ClientMetadata,
    ) -> Result<TokenPair, AuthError> {
        let user = match self.db.get_user_by_email(email)? {
            Some(user) => user,
            None => {
                debug!("Login for unknown email");
                return Err(AuthError::InvalidCredentials);
            }
        };
        if !password::verify_password(password, &user.password_hash)? {
            debug!(user_id = %user.id, "Login with wrong password");
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AuthError::denied("Account is deactivated"));
        }

        let now = Utc::now();
        let refresh_token = generate_refresh_token();
        let session = Session {
            client,
            created_at: now,
            expires_at: now + self.refresh_ttl,
            generation: 0,
            id: Uuid::new_v4().to_string(),
            last_used_at: None,
            organization_id: user.organization_id.clone(),
            refresh_token_hash: hash_token(&refresh_token),
            revoked_at: None,
            revoked_reason: None,
            user_id: user.id.clone(),
        };
        self.db
            .create_session(&session, Actor::User(user.id.clone()))?;

        info!(user_id = %user.id, session_id = %session.id, "Session created");
        self.token_pair(&user, &session.id, refresh_token, now)
    }

    /// Rotate a refresh token, returning a fresh pair for the same session.
    pub fn refresh(
        &self,
        refresh_token: &str,
        client: Option<ClientMetadata>,
    ) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let next_token = generate_refresh_token();
        let outcome = self.db.rotate_refresh_token(
            &hash_token(refresh_token),
            &hash_token(&next_token),
            client,
            now,
        )?;

        match outcome {
            RotationOutcome::Rotated { session, user } => {
                debug!(session_id = %session.id, generation = session.generation, "Refresh token rotated");
                self.token_pair(&user, &session.id, next_token, now)
            }
            RotationOutcome::Reused {
                newly_revoked,
                session,
            } => {
                if newly_revoked {
                    warn!(
                        session_id = %session.id,
                        user_id = %session.user_id,
                        "Refresh token reuse detected, session revoked"
                    );
                }
                Err(AuthError::RefreshTokenReuse)
            }
            RotationOutcome::Revoked(_) => Err(AuthError::SessionRevoked),
            RotationOutcome::Expired(_) => Err(AuthError::SessionExpired),
            RotationOutcome::UnknownToken => Err(AuthError::InvalidCredentials),
        }
    }

    /// Resolve an access token to its caller.
    ///
    /// Beyond the signature, the named session must still be live and its
    /// owner active.
    pub fn authenticate(&self, access_token: &str) -> Result<Principal, AuthError> {
        let claims = self.issuer.verify(access_token)?;

        let session = self
            .db
            .get_session(&claims.sid)?
            .ok_or(AuthError::SessionRevoked)?;
        if session.user_id != claims.sub || session.is_revoked() {
            return Err(AuthError::SessionRevoked);
        }
        if session.expires_at <= Utc::now() {
            return Err(AuthError::SessionExpired);
        }

        let user = self
            .db
            .get_user(&claims.sub)?
            .ok_or(AuthError::SessionRevoked)?;
        if !user.is_active {
            return Err(AuthError::SessionRevoked);
        }

        Ok(Principal {
            organization_id: user.organization_id,
            role: user.role,
            session_id: session.id,
            user_id: user.id,
        })
    }

    /// Revoke the session holding `refresh_token`, if it is the caller's.
    ///
    /// Returns true if a session was revoked by this call.
    pub fn logout(
        &self,
        principal: &Principal,
        refresh_token: &str,
        ip_address: Option<String>,
    ) -> Result<bool, AuthError> {
        let session = match self.db.find_session_by_refresh_hash(&hash_token(refresh_token))? {
            Some(session) if session.user_id == principal.user_id => session,
            _ => return Ok(false),
        };

        let outcome = self.db.revoke_session(
            &session.id,
            RevocationReason::Logout,
            Actor::User(principal.user_id.clone()),
            ip_address,
            Utc::now(),
        )?;
        Ok(matches!(outcome, RevokeOutcome::Revoked(_)))
    }

    pub fn current_user(&self, principal: &Principal) -> Result<User, AuthError> {
        self.db
            .get_user(&principal.user_id)?
            .ok_or_else(|| AuthError::NotFound("user".to_string()))
    }

    // ========================================================================
    // User administration
    // ========================================================================

    /// Set a new password for the user with `email` and revoke all of their
    /// sessions.
    pub fn reset_password(
        &self,
        requester: &Principal,
        email: &str,
        new_password: &str,
        ip_address: Option<String>,
    ) -> Result<CredentialChange, AuthError> {
        require_admin(requester)?;
        let target = self
            .db
            .get_user_by_email(email)?
            .ok_or_else(|| AuthError::NotFound("user".to_string()))?;
        self.check_target(requester, &target, AuditAction::ResetPassword, ip_address.clone())?;

        password::check_length(new_password, MIN_PASSWORD_LEN)?;
        let hash = password::hash_password(new_password)?;

        let change = self
            .db
            .reset_password(
                &target.id,
                hash,
                Actor::User(requester.user_id.clone()),
                ip_address,
                Utc::now(),
            )?
            .ok_or_else(|| AuthError::NotFound("user".to_string()))?;

        info!(
            user_id = %target.id,
            performed_by = %requester.user_id,
            sessions_revoked = change.revoked.len(),
            "Password reset"
        );
        Ok(change)
    }

    /// Users visible to an administrator, newest first.
    ///
    /// A system owner sees every user; an admin sees their own organization.
    pub fn list_users(
        &self,
        requester: &Principal,
        filter: &UserFilter,
        page: PageRequest,
    ) -> Result<UserListing, AuthError> {
        require_admin(requester)?;
        let visibility = Visibility::of(requester);

        let mut users: Vec<User> = self
            .db
            .get_all_users()?
            .into_iter()
            .filter(|u| visibility.allows(&u.id, u.organization_id.as_deref()))
            .filter(|u| filter.role.map_or(true, |role| u.role == role))
            .filter(|u| filter.is_active.map_or(true, |active| u.is_active == active))
            .collect();
        users.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = users.len();
        Ok(UserListing {
            total,
            users: page.apply(users),
        })
    }

    pub fn create_user(
        &self,
        requester: &Principal,
        new_user: NewUser,
        ip_address: Option<String>,
    ) -> Result<User, AuthError> {
        require_admin(requester)?;
        if new_user.role == Role::SystemOwner {
            return Err(AuthError::privileged_target(
                "System owner accounts cannot be created",
            ));
        }

        let organization_id = match (requester.role, new_user.organization_id) {
            (Role::SystemOwner, Some(org)) => org,
            (Role::SystemOwner, None) => {
                return Err(AuthError::InvalidRequest(
                    "organization_id is required".to_string(),
                ))
            }
            (_, Some(org)) if Some(&org) != requester.organization_id.as_ref() => {
                return Err(AuthError::denied(
                    "Cannot create users in other organizations",
                ))
            }
            (_, _) => requester
                .organization_id
                .clone()
                .ok_or_else(|| AuthError::denied("Requester has no organization"))?,
        };

        let email = new_user.email.trim().to_string();
        if !email.contains('@') {
            return Err(AuthError::InvalidRequest("email is invalid".to_string()));
        }
        password::check_length(&new_user.password, MIN_PASSWORD_LEN)?;

        let now = Utc::now();
        let user = User {
            created_at: now,
            email,
            full_name: new_user.full_name,
            id: Uuid::new_v4().to_string(),
            is_active: true,
            last_login_at: None,
            organization_id: Some(organization_id),
            password_changed_at: None,
            password_hash: password::hash_password(&new_user.password)?,
            role: new_user.role,
            updated_at: now,
        };
        if !self
            .db
            .insert_user(&user, Actor::User(requester.user_id.clone()), ip_address)?
        {
            return Err(AuthError::Conflict("Email already registered".to_string()));
        }

        info!(user_id = %user.id, role = %user.role, performed_by = %requester.user_id, "User created");
        Ok(user)
    }

    /// Deactivate a user and revoke all of their sessions.
    pub fn deactivate_user(
        &self,
        requester: &Principal,
        user_id: &str,
        ip_address: Option<String>,
    ) -> Result<CredentialChange, AuthError> {
        require_admin(requester)?;
        if requester.user_id == user_id {
            return Err(AuthError::InvalidRequest(
                "Cannot deactivate your own account".to_string(),
            ));
        }
        let target = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| AuthError::NotFound("user".to_string()))?;
        if target.role == Role::SystemOwner {
            return Err(AuthError::privileged_target(
                "The system owner cannot be deactivated",
            ));
        }
        self.check_target(requester, &target, AuditAction::Deactivate, ip_address.clone())?;

        let change = self
            .db
            .deactivate_user(
                user_id,
                Actor::User(requester.user_id.clone()),
                ip_address,
                Utc::now(),
            )?
            .ok_or_else(|| AuthError::NotFound("user".to_string()))?;

        info!(
            user_id = %user_id,
            performed_by = %requester.user_id,
            sessions_revoked = change.revoked.len(),
            "User deactivated"
        );
        Ok(change)
    }

    /// Create the system owner unless one already exists.
    ///
    /// Returns the new user, or `None` if a system owner was already present.
    pub fn bootstrap_system_owner(
        &self,
        email: &str,
        password: &str,
        full_name: Option<String>,
    ) -> Result<Option<User>, AuthError> {
        if self
            .db
            .get_all_users()?
            .iter()
            .any(|u| u.role == Role::SystemOwner)
        {
            debug!("System owner already present, skipping bootstrap");
            return Ok(None);
        }
        password::check_length(password, MIN_OWNER_PASSWORD_LEN)?;

        let now = Utc::now();
        let user = User {
            created_at: now,
            email: email.trim().to_string(),
            full_name,
            id: Uuid::new_v4().to_string(),
            is_active: true,
            last_login_at: None,
            organization_id: None,
            password_changed_at: None,
            password_hash: password::hash_password(password)?,
            role: Role::SystemOwner,
            updated_at: now,
        };
        if !self.db.insert_user(&user, Actor::System, None)? {
            return Err(AuthError::Conflict("Email already registered".to_string()));
        }

        info!(user_id = %user.id, "System owner created");
        Ok(Some(user))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn token_pair(
        &self,
        user: &User,
        session_id: &str,
        refresh_token: String,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AuthError> {
        let access = self.issuer.issue(user, session_id, now)?;
        Ok(TokenPair::bearer(
            access,
            refresh_token,
            self.issuer.ttl_seconds(),
        ))
    }

    /// Scope rule shared by password reset and deactivation.
    ///
    /// A system owner may act on anyone. An admin may act only on non-admin
    /// users of their own organization; privileged attempts are audited.
    fn check_target(
        &self,
        requester: &Principal,
        target: &User,
        attempted: AuditAction,
        ip_address: Option<String>,
    ) -> Result<(), AuthError> {
        if requester.role == Role::SystemOwner {
            return Ok(());
        }
        if target.role.is_admin() {
            warn!(
                requester = %requester.user_id,
                target = %target.id,
                action = ?attempted,
                "Denied action against privileged account"
            );
            let mut attempt = std::collections::BTreeMap::new();
            attempt.insert(
                "attempted_action".to_string(),
                serde_json::to_value(attempted).unwrap_or_default(),
            );
            attempt.insert(
                "requester_role".to_string(),
                serde_json::Value::String(requester.role.to_string()),
            );
            self.audit.record(NewAuditEntry {
                action: AuditAction::AccessDenied,
                after: Some(AuditSnapshot::Opaque(attempt)),
                before: Some(AuditSnapshot::User(target.snapshot())),
                entity_id: target.id.clone(),
                entity_type: EntityType::User,
                ip_address,
                organization_id: target.organization_id.clone(),
                performed_by: Actor::User(requester.user_id.clone()),
            })?;
            return Err(AuthError::privileged_target(
                "Admins cannot change other administrator accounts",
            ));
        }
        if target.organization_id != requester.organization_id {
            return Err(AuthError::denied(
                "Target user belongs to another organization",
            ));
        }
        Ok(())
    }
}

fn require_admin(requester: &Principal) -> Result<(), AuthError> {
    if requester.is_admin() {
        Ok(())
    } else {
        Err(AuthError::denied("Admin role required"))
    }
}
