//! Query and verification side of the hash-chained audit log.
//!
//! Appends made by mutating operations happen inside their own write
//! transactions in `storage`; this module only adds standalone records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::auth::{AuthError, PageRequest};
use crate::storage::audit::{compute_entry_hash, AUDIT_CHAIN_GENESIS};
use crate::storage::models::{AuditAction, AuditLogEntry, AuditSnapshot, EntityType, NewAuditEntry};
use crate::storage::Database;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub entity_id: Option<String>,
    pub entity_type: Option<EntityType>,
    pub organization_id: Option<String>,
    /// Actor id (`system` for the system actor)
    pub performed_by: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, record: &AuditLogEntry) -> bool {
        let entry = &record.entry;
        self.action.map_or(true, |a| entry.action == a)
            && self.entity_type.map_or(true, |t| entry.entity_type == t)
            && self.entity_id.as_ref().map_or(true, |id| &entry.entity_id == id)
            && self
                .organization_id
                .as_ref()
                .map_or(true, |org| entry.organization_id.as_ref() == Some(org))
            && self
                .performed_by
                .as_ref()
                .map_or(true, |actor| entry.performed_by.id() == actor)
            && self.since.map_or(true, |since| record.created_at >= since)
            && self.until.map_or(true, |until| record.created_at <= until)
    }
}

/// A stored entry plus the names of the fields it changed
#[derive(Debug, Clone, Serialize)]
pub struct AuditItem {
    pub changed_fields: Vec<String>,
    #[serde(flatten)]
    pub record: AuditLogEntry,
}

impl From<AuditLogEntry> for AuditItem {
    fn from(record: AuditLogEntry) -> Self {
        Self {
            changed_fields: diff(record.entry.before.as_ref(), record.entry.after.as_ref()),
            record,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub items: Vec<AuditItem>,
    pub total: usize,
}

/// Result of a successful chain walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub entries: u64,
    /// Hash of the newest entry (`genesis` for an empty log)
    pub head: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("audit chain broken at sequence {sequence}: {reason}")]
    Broken { reason: String, sequence: u64 },
}

/// Entry point for recording, querying and verifying audit records.
#[derive(Clone)]
pub struct AuditLogger {
    db: Database,
}

impl AuditLogger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a standalone entry.
    pub fn record(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, AuthError> {
        self.db.append_audit(entry).map_err(|e| {
            error!(error = %e, "Failed to write audit entry");
            AuthError::AuditWriteFailure(e.to_string())
        })
    }

    /// Matching entries, newest first.
    pub fn query(&self, filter: &AuditFilter, page: PageRequest) -> Result<AuditPage, AuthError> {
        let matching: Vec<AuditLogEntry> = self
            .db
            .audit_entries_newest_first()?
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect();

        let total = matching.len();
        Ok(AuditPage {
            items: page
                .apply(matching)
                .into_iter()
                .map(AuditItem::from)
                .collect(),
            total,
        })
    }

    /// Recompute every link of the chain.
    ///
    /// The outer error is a storage failure; the inner one names the first
    /// broken sequence number.
    pub fn verify_chain(&self) -> Result<Result<ChainReport, ChainError>, AuthError> {
        let entries = self.db.audit_entries_in_order()?;
        let report = verify_entries(&entries);
        if let Err(ChainError::Broken { sequence, reason }) = &report {
            warn!(sequence, reason = %reason, "Audit chain verification failed");
        }
        Ok(report)
    }
}

/// Walk entries in chain order and check sequence, links and hashes.
pub fn verify_entries(entries: &[AuditLogEntry]) -> Result<ChainReport, ChainError> {
    let mut prev_hash = AUDIT_CHAIN_GENESIS.to_string();
    let mut expected_sequence = 1u64;

    for record in entries {
        let broken = |reason: &str| ChainError::Broken {
            reason: reason.to_string(),
            sequence: record.sequence,
        };

        if record.sequence != expected_sequence {
            return Err(broken("sequence gap"));
        }
        if record.prev_hash != prev_hash {
            return Err(broken("previous hash mismatch"));
        }
        let recomputed = compute_entry_hash(
            &record.prev_hash,
            record.sequence,
            &record.created_at,
            &record.entry,
        )
        .map_err(|e| broken(&e.to_string()))?;
        if recomputed != record.entry_hash {
            return Err(broken("entry hash mismatch"));
        }

        prev_hash = record.entry_hash.clone();
        expected_sequence += 1;
    }

    Ok(ChainReport {
        entries: expected_sequence - 1,
        head: prev_hash,
    })
}

/// Names of fields whose values differ between two snapshots, sorted.
///
/// A field present on one side only counts as changed.
pub fn diff(before: Option<&AuditSnapshot>, after: Option<&AuditSnapshot>) -> Vec<String> {
    let before = before.map(AuditSnapshot::fields).unwrap_or_default();
    let after = after.map(AuditSnapshot::fields).unwrap_or_default();

    let mut changed: Vec<String> = before
        .keys()
        .chain(after.keys())
        .filter(|key| before.get(*key) != after.get(*key))
        .cloned()
        .collect();
    changed.sort();
    changed.dedup();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{Actor, Role, UserSnapshot};
    use crate::testutil::setup_db;

    fn entry(entity_id: &str, action: AuditAction, actor: Actor) -> NewAuditEntry {
        NewAuditEntry {
            action,
            after: None,
            before: None,
            entity_id: entity_id.to_string(),
            entity_type: EntityType::Session,
            ip_address: None,
            organization_id: Some("org-1".to_string()),
            performed_by: actor,
        }
    }

    fn user_snapshot(active: bool, role: Role) -> AuditSnapshot {
        AuditSnapshot::User(UserSnapshot {
            email: "a@example.com".to_string(),
            full_name: None,
            is_active: active,
            organization_id: Some("org-1".to_string()),
            password_changed_at: None,
            role,
        })
    }

    #[test]
    fn test_query_filters_and_order() {
        let (db, _temp) = setup_db();
        let logger = AuditLogger::new(db);

        logger
            .record(entry("s1", AuditAction::Create, Actor::User("u1".into())))
            .unwrap();
        logger
            .record(entry("s1", AuditAction::Rotate, Actor::User("u1".into())))
            .unwrap();
        logger
            .record(entry("s2", AuditAction::Revoke, Actor::System))
            .unwrap();

        let all = logger
            .query(&AuditFilter::default(), PageRequest::default())
            .unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.items[0].record.entry.entity_id, "s2");

        let by_entity = AuditFilter {
            entity_id: Some("s1".to_string()),
            ..Default::default()
        };
        assert_eq!(logger.query(&by_entity, PageRequest::default()).unwrap().total, 2);

        let by_system = AuditFilter {
            performed_by: Some("system".to_string()),
            ..Default::default()
        };
        let page = logger.query(&by_system, PageRequest::default()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].record.entry.action, AuditAction::Revoke);

        let future = AuditFilter {
            since: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert_eq!(logger.query(&future, PageRequest::default()).unwrap().total, 0);
    }

    #[test]
    fn test_verify_chain_after_normal_operation() {
        let (db, _temp) = setup_db();
        let logger = AuditLogger::new(db);

        let empty = logger.verify_chain().unwrap().unwrap();
        assert_eq!(empty.entries, 0);
        assert_eq!(empty.head, AUDIT_CHAIN_GENESIS);

        for i in 0..4 {
            logger
                .record(entry(&format!("s{i}"), AuditAction::Create, Actor::System))
                .unwrap();
        }
        let report = logger.verify_chain().unwrap().unwrap();
        assert_eq!(report.entries, 4);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let (db, _temp) = setup_db();
        let logger = AuditLogger::new(db.clone());
        for i in 0..3 {
            logger
                .record(entry(&format!("s{i}"), AuditAction::Create, Actor::System))
                .unwrap();
        }

        let mut entries = db.audit_entries_in_order().unwrap();
        entries[1].entry.entity_id = "forged".to_string();
        assert_eq!(
            verify_entries(&entries),
            Err(ChainError::Broken {
                reason: "entry hash mismatch".to_string(),
                sequence: 2,
            })
        );

        let mut entries = db.audit_entries_in_order().unwrap();
        entries.remove(1);
        assert!(matches!(
            verify_entries(&entries),
            Err(ChainError::Broken { sequence: 3, .. })
        ));
    }

    #[test]
    fn test_diff_by_key() {
        let before = user_snapshot(true, Role::Agent);
        let after = user_snapshot(false, Role::Agent);
        assert_eq!(diff(Some(&before), Some(&after)), vec!["is_active"]);

        let promoted = user_snapshot(false, Role::Admin);
        assert_eq!(
            diff(Some(&before), Some(&promoted)),
            vec!["is_active", "role"]
        );

        // Creation: every field is new
        assert_eq!(diff(None, Some(&after)).len(), 6);
        assert!(diff(Some(&before), Some(&before)).is_empty());
    }
}
