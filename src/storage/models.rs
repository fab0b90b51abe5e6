use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Users and roles
// ============================================================================

/// Closed set of roles with the partial order
/// `system_owner ⊇ admin ⊇ {agent, integrator, bot}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Agent,
    Bot,
    Integrator,
    SystemOwner,
}

impl Role {
    fn rank(self) -> u8 {
        match self {
            Role::SystemOwner => 2,
            Role::Admin => 1,
            Role::Agent | Role::Bot | Role::Integrator => 0,
        }
    }

    /// True if `self` holds every privilege of `other`.
    ///
    /// agent, integrator and bot are incomparable: each covers only itself.
    pub fn covers(self, other: Role) -> bool {
        self == other || self.rank() > other.rank()
    }

    /// Admin-level roles (admin and system owner).
    pub fn is_admin(self) -> bool {
        self.covers(Role::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Agent => "agent",
            Role::Bot => "bot",
            Role::Integrator => "integrator",
            Role::SystemOwner => "system_owner",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "agent" => Ok(Role::Agent),
            "bot" => Ok(Role::Bot),
            "integrator" => Ok(Role::Integrator),
            "system_owner" | "system-owner" => Ok(Role::SystemOwner),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A user account. Never deleted, only deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub created_at: DateTime<Utc>,
    pub email: String,
    pub full_name: Option<String>,
    pub id: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    /// `None` only for the system owner
    pub organization_id: Option<String>,
    pub password_changed_at: Option<DateTime<Utc>>,
    /// Argon2 PHC string
    pub password_hash: String,
    pub role: Role,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            email: self.email.clone(),
            full_name: self.full_name.clone(),
            is_active: self.is_active,
            organization_id: self.organization_id.clone(),
            password_changed_at: self.password_changed_at,
            role: self.role,
        }
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Device kind detected from User-Agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeviceKind {
    Bot,
    Desktop,
    Mobile,
    Tablet,
    #[default]
    Unknown,
}

/// Information about the device that created a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceInfo {
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub kind: DeviceKind,
    pub os: Option<String>,
    pub os_version: Option<String>,
}

/// Best-effort client metadata captured at login and refreshed on rotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientMetadata {
    pub device: DeviceInfo,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Why a session reached its terminal revoked state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    AdminRevoke,
    Logout,
    LogoutAll,
    PasswordReset,
    TokenReuse,
    UserDeactivated,
}

/// One authenticated device/login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub client: ClientMetadata,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Number of successful rotations
    pub generation: u64,
    pub id: String,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Copied from the owning user for visibility scoping
    pub organization_id: Option<String>,
    /// SHA-256 hex of the current refresh token
    pub refresh_token_hash: String,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<RevocationReason>,
    pub user_id: String,
}

impl Session {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            active: self.is_active_at(now),
            expires_at: self.expires_at,
            generation: self.generation,
            revoked_at: self.revoked_at,
            revoked_reason: self.revoked_reason,
            user_id: self.user_id.clone(),
        }
    }
}

// ============================================================================
// Audit log
// ============================================================================

/// Who performed an audited action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    User(String),
}

impl Actor {
    pub fn id(&self) -> &str {
        match self {
            Actor::System => "system",
            Actor::User(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Session,
    User,
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(EntityType::Session),
            "user" => Ok(EntityType::User),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AccessDenied,
    Create,
    Deactivate,
    ResetPassword,
    Revoke,
    Rotate,
    Update,
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "access_denied" => Ok(AuditAction::AccessDenied),
            "create" => Ok(AuditAction::Create),
            "deactivate" => Ok(AuditAction::Deactivate),
            "reset_password" => Ok(AuditAction::ResetPassword),
            "revoke" => Ok(AuditAction::Revoke),
            "rotate" => Ok(AuditAction::Rotate),
            "update" => Ok(AuditAction::Update),
            other => Err(format!("unknown audit action: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub generation: u64,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<RevocationReason>,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub email: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub organization_id: Option<String>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub role: Role,
}

/// Before/after state captured by an audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSnapshot {
    /// Unstructured payload, kept only for data with no known shape
    Opaque(BTreeMap<String, serde_json::Value>),
    Session(SessionSnapshot),
    User(UserSnapshot),
}

impl AuditSnapshot {
    /// Flatten the snapshot into field name -> value.
    pub fn fields(&self) -> BTreeMap<String, serde_json::Value> {
        let value = match self {
            AuditSnapshot::Opaque(map) => return map.clone(),
            AuditSnapshot::Session(s) => serde_json::to_value(s),
            AuditSnapshot::User(u) => serde_json::to_value(u),
        };
        match value {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }
}

/// An audit entry as submitted by a mutating operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub action: AuditAction,
    pub after: Option<AuditSnapshot>,
    pub before: Option<AuditSnapshot>,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub ip_address: Option<String>,
    pub organization_id: Option<String>,
    pub performed_by: Actor,
}

/// An immutable, hash-chained audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub created_at: DateTime<Utc>,
    pub entry: NewAuditEntry,
    /// SHA-256 hex over the previous hash, sequence and entry body
    pub entry_hash: String,
    pub prev_hash: String,
    pub sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_partial_order() {
        assert!(Role::SystemOwner.covers(Role::Admin));
        assert!(Role::SystemOwner.covers(Role::Bot));
        assert!(Role::Admin.covers(Role::Agent));
        assert!(Role::Admin.covers(Role::Integrator));
        assert!(!Role::Admin.covers(Role::SystemOwner));
        assert!(!Role::Agent.covers(Role::Admin));
        // Leaf roles are incomparable
        assert!(!Role::Agent.covers(Role::Bot));
        assert!(!Role::Bot.covers(Role::Integrator));
        assert!(Role::Bot.covers(Role::Bot));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("system-owner".parse::<Role>().unwrap(), Role::SystemOwner);
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_snapshot_fields_flatten() {
        let mut map = BTreeMap::new();
        map.insert("legacy".to_string(), serde_json::json!(1));
        assert_eq!(AuditSnapshot::Opaque(map.clone()).fields(), map);

        let snapshot = AuditSnapshot::User(UserSnapshot {
            email: "a@example.com".to_string(),
            full_name: None,
            is_active: true,
            organization_id: Some("org-1".to_string()),
            password_changed_at: None,
            role: Role::Agent,
        });
        let fields = snapshot.fields();
        assert_eq!(fields.get("role"), Some(&serde_json::json!("agent")));
        assert_eq!(fields.len(), 6);
    }
}
