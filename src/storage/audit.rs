use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use sha2::{Digest, Sha256};

use super::db::{decode, encode, Database, DatabaseError};
use super::models::{AuditLogEntry, NewAuditEntry};
use super::tables::AUDIT_LOG;

/// `prev_hash` of the first entry in the chain
pub const AUDIT_CHAIN_GENESIS: &str = "genesis";

const AUDIT_HASH_DOMAIN: &[u8] = b"jumla-audit-entry-v1";

/// Hash of an entry given its position in the chain.
pub fn compute_entry_hash(
    prev_hash: &str,
    sequence: u64,
    created_at: &DateTime<Utc>,
    entry: &NewAuditEntry,
) -> Result<String, serde_json::Error> {
    let body = serde_json::to_vec(entry)?;
    let mut hasher = Sha256::new();
    hasher.update(AUDIT_HASH_DOMAIN);
    hasher.update(prev_hash.as_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(created_at.to_rfc3339().as_bytes());
    hasher.update(&body);
    Ok(hex::encode(hasher.finalize()))
}

/// Append an entry inside an open write transaction.
///
/// Any failure is reported as `DatabaseError::Audit` so the caller aborts the
/// whole transaction, mutation included.
pub(crate) fn append_in(
    txn: &WriteTransaction,
    entry: NewAuditEntry,
    now: DateTime<Utc>,
) -> Result<AuditLogEntry, DatabaseError> {
    append_inner(txn, entry, now).map_err(|e| match e {
        DatabaseError::Audit(msg) => DatabaseError::Audit(msg),
        other => DatabaseError::Audit(other.to_string()),
    })
}

fn append_inner(
    txn: &WriteTransaction,
    entry: NewAuditEntry,
    now: DateTime<Utc>,
) -> Result<AuditLogEntry, DatabaseError> {
    let mut table = txn.open_table(AUDIT_LOG)?;

    let last: Option<AuditLogEntry> = match table.last()? {
        Some((_, value)) => Some(decode(value.value())?),
        None => None,
    };
    let (sequence, prev_hash) = match last {
        Some(last) => (last.sequence + 1, last.entry_hash),
        None => (1, AUDIT_CHAIN_GENESIS.to_string()),
    };

    let entry_hash = compute_entry_hash(&prev_hash, sequence, &now, &entry)
        .map_err(|e| DatabaseError::Audit(format!("failed to hash audit entry: {e}")))?;

    let record = AuditLogEntry {
        created_at: now,
        entry,
        entry_hash,
        prev_hash,
        sequence,
    };
    let data = encode(&record)?;
    table.insert(sequence, data.as_slice())?;
    Ok(record)
}

impl Database {
    /// Append a standalone audit entry in its own transaction.
    pub fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditLogEntry, DatabaseError> {
        let write_txn = self.begin_write()?;
        let record = append_in(&write_txn, entry, Utc::now())?;
        write_txn
            .commit()
            .map_err(|e| DatabaseError::Audit(e.to_string()))?;
        Ok(record)
    }

    /// All audit entries, newest first.
    pub fn audit_entries_newest_first(&self) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(AUDIT_LOG)?;

        let mut entries = Vec::new();
        for result in table.iter()?.rev() {
            let (_, value) = result?;
            entries.push(decode(value.value())?);
        }
        Ok(entries)
    }

    /// All audit entries in chain order (oldest first).
    pub fn audit_entries_in_order(&self) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(AUDIT_LOG)?;

        let mut entries = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            entries.push(decode(value.value())?);
        }
        Ok(entries)
    }
}
