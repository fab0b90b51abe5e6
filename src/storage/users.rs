use chrono::{DateTime, Utc};
use redb::ReadableTable;

use super::audit::append_in;
use super::db::{encode, get_index, get_record, Database, DatabaseError};
use super::models::{
    Actor, AuditAction, AuditSnapshot, EntityType, NewAuditEntry, RevocationReason, Session, User,
};
use super::sessions::revoke_user_sessions_in;
use super::tables::*;

/// Result of a combined credential change + revoke-all
#[derive(Debug)]
pub struct CredentialChange {
    pub revoked: Vec<Session>,
    pub user: User,
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

impl Database {
    // ========================================================================
    // User operations
    // ========================================================================

    /// Store a new user and its `create` audit entry.
    ///
    /// Returns false (and writes nothing) if the email is already registered.
    pub fn insert_user(
        &self,
        user: &User,
        performed_by: Actor,
        ip_address: Option<String>,
    ) -> Result<bool, DatabaseError> {
        debug_assert!(!user.id.is_empty(), "user id must not be empty");

        let key = email_key(&user.email);
        let write_txn = self.begin_write()?;
        {
            let mut emails = write_txn.open_table(USER_EMAILS)?;
            if get_index(&emails, &key)?.is_some() {
                return Ok(false);
            }
            emails.insert(key.as_str(), user.id.as_str())?;

            let mut users = write_txn.open_table(USERS)?;
            let data = encode(user)?;
            users.insert(user.id.as_str(), data.as_slice())?;
        }
        append_in(
            &write_txn,
            NewAuditEntry {
                action: AuditAction::Create,
                after: Some(AuditSnapshot::User(user.snapshot())),
                before: None,
                entity_id: user.id.clone(),
                entity_type: EntityType::User,
                ip_address,
                organization_id: user.organization_id.clone(),
                performed_by,
            },
            user.created_at,
        )?;
        write_txn.commit()?;
        Ok(true)
    }

    /// Get a user by id
    pub fn get_user(&self, user_id: &str) -> Result<Option<User>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        get_record(&table, user_id)
    }

    /// Get a user by email (case-insensitive)
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let emails = read_txn.open_table(USER_EMAILS)?;
        let user_id = match get_index(&emails, &email_key(email))? {
            Some(id) => id,
            None => return Ok(None),
        };
        let users = read_txn.open_table(USERS)?;
        get_record(&users, &user_id)
    }

    /// Get all users
    pub fn get_all_users(&self) -> Result<Vec<User>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        let mut users = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            users.push(super::db::decode(value.value())?);
        }
        Ok(users)
    }

    /// Replace a user's password hash and revoke all of their active sessions.
    ///
    /// Password update, revocations and their audit entries commit together.
    pub fn reset_password(
        &self,
        user_id: &str,
        password_hash: String,
        performed_by: Actor,
        ip_address: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<CredentialChange>, DatabaseError> {
        self.change_user(
            user_id,
            AuditAction::ResetPassword,
            RevocationReason::PasswordReset,
            performed_by,
            ip_address,
            now,
            move |user| {
                user.password_hash = password_hash;
                user.password_changed_at = Some(now);
            },
        )
    }

    /// Mark a user inactive and revoke all of their active sessions.
    pub fn deactivate_user(
        &self,
        user_id: &str,
        performed_by: Actor,
        ip_address: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<CredentialChange>, DatabaseError> {
        self.change_user(
            user_id,
            AuditAction::Deactivate,
            RevocationReason::UserDeactivated,
            performed_by,
            ip_address,
            now,
            |user| user.is_active = false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn change_user<F>(
        &self,
        user_id: &str,
        action: AuditAction,
        reason: RevocationReason,
        performed_by: Actor,
        ip_address: Option<String>,
        now: DateTime<Utc>,
        mutate: F,
    ) -> Result<Option<CredentialChange>, DatabaseError>
    where
        F: FnOnce(&mut User),
    {
        let write_txn = self.begin_write()?;
        let (before, user) = {
            let mut table = write_txn.open_table(USERS)?;
            let existing: Option<User> = get_record(&table, user_id)?;
            let mut user = match existing {
                Some(user) => user,
                None => return Ok(None),
            };
            let before = user.snapshot();
            mutate(&mut user);
            user.updated_at = now;
            let data = encode(&user)?;
            table.insert(user_id, data.as_slice())?;
            (before, user)
        };

        append_in(
            &write_txn,
            NewAuditEntry {
                action,
                after: Some(AuditSnapshot::User(user.snapshot())),
                before: Some(AuditSnapshot::User(before)),
                entity_id: user.id.clone(),
                entity_type: EntityType::User,
                ip_address: ip_address.clone(),
                organization_id: user.organization_id.clone(),
                performed_by: performed_by.clone(),
            },
            now,
        )?;

        let revoked =
            revoke_user_sessions_in(&write_txn, user_id, reason, &performed_by, ip_address, now)?;

        write_txn.commit()?;
        Ok(Some(CredentialChange { revoked, user }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::Role;
    use crate::testutil::{make_session, make_user, setup_db};

    #[test]
    fn test_insert_and_lookup_user() {
        let (db, _temp) = setup_db();

        let user = make_user("u1", "Agent@Example.com", Role::Agent, Some("org-1"));
        assert!(db.insert_user(&user, Actor::System, None).unwrap());

        let by_email = db.get_user_by_email("agent@example.com").unwrap().unwrap();
        assert_eq!(by_email.id, "u1");
        assert_eq!(db.get_user("u1").unwrap().unwrap().role, Role::Agent);
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let (db, _temp) = setup_db();

        let user = make_user("u1", "dup@example.com", Role::Agent, Some("org-1"));
        assert!(db.insert_user(&user, Actor::System, None).unwrap());

        let other = make_user("u2", "DUP@example.com", Role::Bot, Some("org-1"));
        assert!(!db.insert_user(&other, Actor::System, None).unwrap());
        assert!(db.get_user("u2").unwrap().is_none());
        // Only the first create was audited
        assert_eq!(db.audit_entries_in_order().unwrap().len(), 1);
    }

    #[test]
    fn test_reset_password_revokes_sessions_atomically() {
        let (db, _temp) = setup_db();

        let user = make_user("u1", "a@example.com", Role::Agent, Some("org-1"));
        db.insert_user(&user, Actor::System, None).unwrap();
        db.create_session(&make_session("s1", "u1"), Actor::User("u1".into()))
            .unwrap();
        db.create_session(&make_session("s2", "u1"), Actor::User("u1".into()))
            .unwrap();

        let change = db
            .reset_password(
                "u1",
                "new-hash".to_string(),
                Actor::User("admin".into()),
                None,
                Utc::now(),
            )
            .unwrap()
            .unwrap();

        assert_eq!(change.revoked.len(), 2);
        assert_eq!(change.user.password_hash, "new-hash");
        assert!(change.user.password_changed_at.is_some());

        let now = Utc::now();
        for session in db.get_sessions_by_user("u1").unwrap() {
            assert!(!session.is_active_at(now));
            assert_eq!(session.revoked_reason, Some(RevocationReason::PasswordReset));
        }
    }

    #[test]
    fn test_change_unknown_user() {
        let (db, _temp) = setup_db();
        let result = db
            .deactivate_user("missing", Actor::System, None, Utc::now())
            .unwrap();
        assert!(result.is_none());
    }
}
