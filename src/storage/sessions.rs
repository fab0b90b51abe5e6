use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};

use super::audit::append_in;
use super::db::{decode, encode, get_index, get_record, Database, DatabaseError};
use super::models::{
    Actor, AuditAction, AuditSnapshot, ClientMetadata, EntityType, NewAuditEntry,
    RevocationReason, Session, User,
};
use super::tables::*;

/// Outcome of presenting a refresh-token hash for rotation
#[derive(Debug)]
pub enum RotationOutcome {
    /// The presented hash was current; the session now holds the new hash.
    Rotated { session: Session, user: User },
    /// The presented hash was already rotated out.
    ///
    /// `newly_revoked` is true when this presentation caused the revocation.
    Reused { newly_revoked: bool, session: Session },
    /// The session (or its owner) is no longer allowed to rotate.
    Revoked(Session),
    Expired(Session),
    /// The hash was never issued (or its index row was pruned).
    UnknownToken,
}

/// Outcome of revoking a single session
#[derive(Debug)]
pub enum RevokeOutcome {
    AlreadyRevoked(Session),
    NotFound,
    Revoked(Session),
}

fn read_session_ids<T>(table: &T, user_id: &str) -> Result<Vec<String>, DatabaseError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(user_id)? {
        Some(data) => decode(data.value()),
        None => Ok(Vec::new()),
    }
}

fn write_session(txn: &WriteTransaction, session: &Session) -> Result<(), DatabaseError> {
    let mut table = txn.open_table(SESSIONS)?;
    let data = encode(session)?;
    table.insert(session.id.as_str(), data.as_slice())?;
    Ok(())
}

/// Mark a session revoked and append its `revoke` audit entry.
pub(super) fn revoke_session_in(
    txn: &WriteTransaction,
    session: &mut Session,
    reason: RevocationReason,
    performed_by: &Actor,
    ip_address: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let before = session.snapshot_at(now);
    session.revoked_at = Some(now);
    session.revoked_reason = Some(reason);
    write_session(txn, session)?;

    append_in(
        txn,
        NewAuditEntry {
            action: AuditAction::Revoke,
            after: Some(AuditSnapshot::Session(session.snapshot_at(now))),
            before: Some(AuditSnapshot::Session(before)),
            entity_id: session.id.clone(),
            entity_type: EntityType::Session,
            ip_address,
            organization_id: session.organization_id.clone(),
            performed_by: performed_by.clone(),
        },
        now,
    )?;
    Ok(())
}

/// Revoke every active session of a user, one audit entry per session.
pub(super) fn revoke_user_sessions_in(
    txn: &WriteTransaction,
    user_id: &str,
    reason: RevocationReason,
    performed_by: &Actor,
    ip_address: Option<String>,
    now: DateTime<Utc>,
) -> Result<Vec<Session>, DatabaseError> {
    let session_ids = {
        let index = txn.open_table(USER_SESSIONS)?;
        read_session_ids(&index, user_id)?
    };

    let mut revoked = Vec::new();
    for session_id in session_ids {
        let session: Option<Session> = {
            let table = txn.open_table(SESSIONS)?;
            get_record(&table, &session_id)?
        };
        let Some(mut session) = session else {
            continue;
        };
        if !session.is_active_at(now) {
            continue;
        }
        revoke_session_in(
            txn,
            &mut session,
            reason,
            performed_by,
            ip_address.clone(),
            now,
        )?;
        revoked.push(session);
    }
    Ok(revoked)
}

impl Database {
    // ========================================================================
    // Session operations
    // ========================================================================

    /// Store a new session, index its refresh hash, stamp the owner's last
    /// login and audit the creation.
    pub fn create_session(
        &self,
        session: &Session,
        performed_by: Actor,
    ) -> Result<(), DatabaseError> {
        debug_assert!(!session.id.is_empty(), "session id must not be empty");
        debug_assert!(
            !session.refresh_token_hash.is_empty(),
            "refresh token hash must not be empty"
        );

        let write_txn = self.begin_write()?;
        write_session(&write_txn, session)?;
        {
            // Update user_sessions index
            let mut index_table = write_txn.open_table(USER_SESSIONS)?;
            let mut ids = read_session_ids(&index_table, &session.user_id)?;
            if !ids.contains(&session.id) {
                ids.push(session.id.clone());
                let index_data = encode(&ids)?;
                index_table.insert(session.user_id.as_str(), index_data.as_slice())?;
            }

            let mut hashes = write_txn.open_table(REFRESH_HASHES)?;
            hashes.insert(session.refresh_token_hash.as_str(), session.id.as_str())?;

            // A session is a login
            let mut users = write_txn.open_table(USERS)?;
            let owner: Option<User> = get_record(&users, &session.user_id)?;
            if let Some(mut owner) = owner {
                owner.last_login_at = Some(session.created_at);
                let data = encode(&owner)?;
                users.insert(session.user_id.as_str(), data.as_slice())?;
            }
        }
        append_in(
            &write_txn,
            NewAuditEntry {
                action: AuditAction::Create,
                after: Some(AuditSnapshot::Session(session.snapshot_at(session.created_at))),
                before: None,
                entity_id: session.id.clone(),
                entity_type: EntityType::Session,
                ip_address: session.client.ip_address.clone(),
                organization_id: session.organization_id.clone(),
                performed_by,
            },
            session.created_at,
        )?;
        write_txn.commit()?;
        Ok(())
    }

    /// Get a session by id
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(SESSIONS)?;
        get_record(&table, session_id)
    }

    /// Resolve the session currently holding a refresh-token hash.
    ///
    /// Rotated-out hashes do not resolve.
    pub fn find_session_by_refresh_hash(
        &self,
        refresh_hash: &str,
    ) -> Result<Option<Session>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let hashes = read_txn.open_table(REFRESH_HASHES)?;
        let session_id = match get_index(&hashes, refresh_hash)? {
            Some(id) => id,
            None => return Ok(None),
        };
        let table = read_txn.open_table(SESSIONS)?;
        get_record(&table, &session_id)
    }

    /// Get all sessions for a user, revoked ones included
    pub fn get_sessions_by_user(&self, user_id: &str) -> Result<Vec<Session>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let index_table = read_txn.open_table(USER_SESSIONS)?;
        let sessions_table = read_txn.open_table(SESSIONS)?;

        let mut sessions = Vec::new();
        for session_id in read_session_ids(&index_table, user_id)? {
            if let Some(session) = get_record(&sessions_table, &session_id)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Get all sessions
    pub fn get_all_sessions(&self) -> Result<Vec<Session>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(SESSIONS)?;

        let mut sessions = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            sessions.push(decode(value.value())?);
        }
        Ok(sessions)
    }

    /// Atomically swap a session's refresh-token hash.
    ///
    /// The whole check-and-swap runs in one write transaction, so the stored
    /// state is the authority on whether `presented_hash` is still current.
    /// Presenting a retired hash force-revokes the session.
    pub fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        new_hash: &str,
        client: Option<ClientMetadata>,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome, DatabaseError> {
        let write_txn = self.begin_write()?;

        let current_id = {
            let hashes = write_txn.open_table(REFRESH_HASHES)?;
            get_index(&hashes, presented_hash)?
        };

        let outcome = match current_id {
            Some(session_id) => {
                let session: Option<Session> = {
                    let table = write_txn.open_table(SESSIONS)?;
                    get_record(&table, &session_id)?
                };
                let Some(mut session) = session else {
                    return Ok(RotationOutcome::UnknownToken);
                };
                if session.is_revoked() {
                    return Ok(RotationOutcome::Revoked(session));
                }
                if session.expires_at <= now {
                    return Ok(RotationOutcome::Expired(session));
                }
                let user: Option<User> = {
                    let users = write_txn.open_table(USERS)?;
                    get_record(&users, &session.user_id)?
                };
                let user = match user {
                    Some(user) if user.is_active => user,
                    _ => return Ok(RotationOutcome::Revoked(session)),
                };

                let before = session.snapshot_at(now);
                {
                    let mut hashes = write_txn.open_table(REFRESH_HASHES)?;
                    hashes.remove(presented_hash)?;
                    hashes.insert(new_hash, session_id.as_str())?;

                    let mut retired = write_txn.open_table(RETIRED_REFRESH_HASHES)?;
                    retired.insert(presented_hash, session_id.as_str())?;
                }

                session.refresh_token_hash = new_hash.to_string();
                session.generation += 1;
                session.last_used_at = Some(now);
                if let Some(client) = client {
                    session.client = client;
                }
                write_session(&write_txn, &session)?;

                append_in(
                    &write_txn,
                    NewAuditEntry {
                        action: AuditAction::Rotate,
                        after: Some(AuditSnapshot::Session(session.snapshot_at(now))),
                        before: Some(AuditSnapshot::Session(before)),
                        entity_id: session.id.clone(),
                        entity_type: EntityType::Session,
                        ip_address: session.client.ip_address.clone(),
                        organization_id: session.organization_id.clone(),
                        performed_by: Actor::User(session.user_id.clone()),
                    },
                    now,
                )?;

                RotationOutcome::Rotated { session, user }
            }
            None => {
                let retired_id = {
                    let retired = write_txn.open_table(RETIRED_REFRESH_HASHES)?;
                    get_index(&retired, presented_hash)?
                };
                let Some(session_id) = retired_id else {
                    return Ok(RotationOutcome::UnknownToken);
                };
                let session: Option<Session> = {
                    let table = write_txn.open_table(SESSIONS)?;
                    get_record(&table, &session_id)?
                };
                let Some(mut session) = session else {
                    return Ok(RotationOutcome::UnknownToken);
                };
                if session.is_revoked() {
                    return Ok(RotationOutcome::Reused {
                        newly_revoked: false,
                        session,
                    });
                }

                let ip_address = client.and_then(|c| c.ip_address);
                revoke_session_in(
                    &write_txn,
                    &mut session,
                    RevocationReason::TokenReuse,
                    &Actor::System,
                    ip_address,
                    now,
                )?;
                RotationOutcome::Reused {
                    newly_revoked: true,
                    session,
                }
            }
        };

        write_txn.commit()?;
        Ok(outcome)
    }

    /// Revoke one session. Idempotent.
    pub fn revoke_session(
        &self,
        session_id: &str,
        reason: RevocationReason,
        performed_by: Actor,
        ip_address: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RevokeOutcome, DatabaseError> {
        let write_txn = self.begin_write()?;
        let session: Option<Session> = {
            let table = write_txn.open_table(SESSIONS)?;
            get_record(&table, session_id)?
        };
        let mut session = match session {
            Some(session) if session.is_revoked() => {
                return Ok(RevokeOutcome::AlreadyRevoked(session))
            }
            Some(session) => session,
            None => return Ok(RevokeOutcome::NotFound),
        };

        revoke_session_in(
            &write_txn,
            &mut session,
            reason,
            &performed_by,
            ip_address,
            now,
        )?;
        write_txn.commit()?;
        Ok(RevokeOutcome::Revoked(session))
    }

    /// Revoke every active session of a user.
    pub fn revoke_user_sessions(
        &self,
        user_id: &str,
        reason: RevocationReason,
        performed_by: Actor,
        ip_address: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let revoked =
            revoke_user_sessions_in(&write_txn, user_id, reason, &performed_by, ip_address, now)?;
        write_txn.commit()?;
        Ok(revoked)
    }

    /// Drop retired-hash rows whose session has expired.
    ///
    /// Once a session is past expiry a replayed token resolves to
    /// `UnknownToken` instead of `Reused`, which is equally terminal.
    pub fn prune_retired_hashes(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        // Phase 1: collect prunable hashes
        let prunable: Vec<String> = {
            let read_txn = self.begin_read()?;
            let retired = read_txn.open_table(RETIRED_REFRESH_HASHES)?;
            let sessions = read_txn.open_table(SESSIONS)?;
            let mut result = Vec::new();
            for entry in retired.iter()? {
                let (hash, session_id) = entry?;
                let session: Option<Session> = get_record(&sessions, session_id.value())?;
                let expired = session.map(|s| s.expires_at <= now).unwrap_or(true);
                if expired {
                    result.push(hash.value().to_string());
                }
            }
            result
        };

        if prunable.is_empty() {
            return Ok(0);
        }

        // Phase 2: delete them
        let write_txn = self.begin_write()?;
        {
            let mut retired = write_txn.open_table(RETIRED_REFRESH_HASHES)?;
            for hash in &prunable {
                retired.remove(hash.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(prunable.len())
    }
}
