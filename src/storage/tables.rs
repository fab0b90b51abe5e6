use redb::TableDefinition;

/// Users: user_id -> User (msgpack)
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Secondary index: lowercase email -> user_id
pub const USER_EMAILS: TableDefinition<&str, &str> = TableDefinition::new("user_emails");

/// Sessions: session_id -> Session (msgpack)
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Secondary index: user_id -> Vec<session_id> (msgpack)
pub const USER_SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("user_sessions");

/// Current refresh-token hash -> session_id
pub const REFRESH_HASHES: TableDefinition<&str, &str> = TableDefinition::new("refresh_hashes");

/// Rotated-out refresh-token hash -> session_id (reuse detection)
pub const RETIRED_REFRESH_HASHES: TableDefinition<&str, &str> =
    TableDefinition::new("retired_refresh_hashes");

/// Audit log: sequence_number -> AuditLogEntry (msgpack). Append-only.
pub const AUDIT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_log");
