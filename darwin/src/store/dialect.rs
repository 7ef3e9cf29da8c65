use rusqlite::ffi;
use rusqlite::ErrorCode;

/// Platform specific SQL used by the bookkeeping store and the lock.
///
/// Statements use positional `?N` parameters. Every statement that differs
/// between database platforms goes through a dialect, so a store works on any
/// platform a dialect exists for.
pub trait SqlDialect: Send + Sync {
    /// Platform name, also the resource directory scripts are read from.
    fn platform(&self) -> &str;

    fn begin_transaction(&self) -> &str;

    fn commit_transaction(&self) -> &str {
        "COMMIT"
    }

    fn rollback_transaction(&self) -> &str {
        "ROLLBACK"
    }

    /// Single row, single column query returning the database clock in epoch
    /// milliseconds.
    fn current_time_millis(&self) -> &str;

    /// Count query taking the table name as `?1`.
    fn table_exists(&self) -> &str;

    /// Statements run once on every new connection.
    fn connection_setup(&self) -> &str;

    fn create_lock_table(&self) -> &str;

    /// The driver error is a duplicate key on a unique or primary key.
    fn is_unique_violation(&self, error: &rusqlite::Error) -> bool;

    /// The driver error is a missing parent row.
    fn is_foreign_key_violation(&self, error: &rusqlite::Error) -> bool;

    /// The driver error means another connection holds the write lock.
    fn is_busy(&self, error: &rusqlite::Error) -> bool;

    // component versions
    fn select_version(&self) -> &str;
    fn upsert_version(&self) -> &str;
    fn insert_component(&self) -> &str;

    // patches
    fn select_patch(&self) -> &str;
    fn insert_patch(&self) -> &str;
    fn finish_patch(&self) -> &str;
    fn count_component_patches(&self) -> &str;
    fn count_named_patches(&self) -> &str;
    fn count_finished_patch_by_id(&self) -> &str;
    fn count_finished_patch_by_name(&self) -> &str;
    fn probe_patch_table(&self) -> &str;

    // statements
    fn select_statement_status(&self) -> &str;
    fn upsert_statement(&self) -> &str;
    fn update_statement(&self) -> &str;
    fn probe_statement_table(&self) -> &str;

    // locks
    fn select_lock(&self) -> &str;
    fn insert_lock(&self) -> &str;
    fn renew_lock(&self) -> &str;
    fn delete_lock(&self) -> &str;
    fn delete_expired_lock(&self) -> &str;
}

/// SQLite flavour of [`SqlDialect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    fn constraint_code(error: &rusqlite::Error) -> Option<i32> {
        match error {
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
                Some(err.extended_code)
            }
            _ => None,
        }
    }
}

impl SqlDialect for SqliteDialect {
    fn platform(&self) -> &str {
        "sqlite"
    }

    fn begin_transaction(&self) -> &str {
        // take the write lock up front so two connections never deadlock
        // upgrading a read transaction
        "BEGIN IMMEDIATE"
    }

    fn current_time_millis(&self) -> &str {
        "SELECT CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)"
    }

    fn table_exists(&self) -> &str {
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1"
    }

    fn connection_setup(&self) -> &str {
        "PRAGMA foreign_keys = ON;"
    }

    fn create_lock_table(&self) -> &str {
        "CREATE TABLE IF NOT EXISTS darwin_lock (
            process_name TEXT PRIMARY KEY NOT NULL,
            lease_until INTEGER NOT NULL,
            unlock_key TEXT NOT NULL
        )"
    }

    fn is_unique_violation(&self, error: &rusqlite::Error) -> bool {
        matches!(
            Self::constraint_code(error),
            Some(ffi::SQLITE_CONSTRAINT_UNIQUE) | Some(ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        )
    }

    fn is_foreign_key_violation(&self, error: &rusqlite::Error) -> bool {
        Self::constraint_code(error) == Some(ffi::SQLITE_CONSTRAINT_FOREIGNKEY)
    }

    fn is_busy(&self, error: &rusqlite::Error) -> bool {
        matches!(
            error,
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }

    fn select_version(&self) -> &str {
        "SELECT version FROM darwin WHERE component = ?1"
    }

    fn upsert_version(&self) -> &str {
        "INSERT INTO darwin (component, version, modified) VALUES (?1, ?2, ?3)
         ON CONFLICT(component) DO UPDATE SET version = excluded.version, modified = excluded.modified"
    }

    fn insert_component(&self) -> &str {
        "INSERT OR IGNORE INTO darwin (component, version, modified) VALUES (?1, NULL, ?2)"
    }

    fn select_patch(&self) -> &str {
        "SELECT id, detected_on, process_time, finished_on FROM darwin_patch
         WHERE patch_name = ?1 AND component = ?2 AND platform = ?3"
    }

    fn insert_patch(&self) -> &str {
        "INSERT INTO darwin_patch (patch_name, component, platform, detected_on, finished_on, process_time)
         VALUES (?1, ?2, ?3, ?4, NULL, 0)"
    }

    fn finish_patch(&self) -> &str {
        "UPDATE darwin_patch SET finished_on = ?1, process_time = ?2 WHERE id = ?3"
    }

    fn count_component_patches(&self) -> &str {
        // guess patches only record a probe, not an applied change
        "SELECT COUNT(*) FROM darwin_patch WHERE component = ?1 AND lower(patch_name) NOT LIKE 'guess\\_%' ESCAPE '\\'"
    }

    fn count_named_patches(&self) -> &str {
        "SELECT COUNT(*) FROM darwin_patch WHERE patch_name = ?1 AND component = ?2"
    }

    fn count_finished_patch_by_id(&self) -> &str {
        "SELECT COUNT(*) FROM darwin_patch WHERE id = ?1 AND finished_on IS NOT NULL"
    }

    fn count_finished_patch_by_name(&self) -> &str {
        "SELECT COUNT(*) FROM darwin_patch
         WHERE patch_name = ?1 AND component = ?2 AND platform = ?3 AND finished_on IS NOT NULL"
    }

    fn probe_patch_table(&self) -> &str {
        "SELECT COUNT(*) FROM darwin_patch WHERE 1 = 0"
    }

    fn select_statement_status(&self) -> &str {
        "SELECT finished_on, failure FROM darwin_sql
         WHERE patch_id = ?1 AND statement_hash = ?2 AND occurrence = ?3"
    }

    fn upsert_statement(&self) -> &str {
        "INSERT INTO darwin_sql (patch_id, statement_hash, occurrence, statement, finished_on, process_time, failure)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(patch_id, statement_hash, occurrence) DO UPDATE SET
            statement = excluded.statement,
            finished_on = excluded.finished_on,
            process_time = excluded.process_time,
            failure = excluded.failure"
    }

    fn update_statement(&self) -> &str {
        "UPDATE darwin_sql SET statement = ?4, finished_on = ?5, process_time = ?6, failure = ?7
         WHERE patch_id = ?1 AND statement_hash = ?2 AND occurrence = ?3"
    }

    fn probe_statement_table(&self) -> &str {
        "SELECT COUNT(*) FROM darwin_sql WHERE 1 = 0"
    }

    fn select_lock(&self) -> &str {
        "SELECT lease_until, unlock_key FROM darwin_lock WHERE process_name = ?1"
    }

    fn insert_lock(&self) -> &str {
        "INSERT INTO darwin_lock (process_name, lease_until, unlock_key) VALUES (?1, ?2, ?3)"
    }

    fn renew_lock(&self) -> &str {
        "UPDATE darwin_lock SET lease_until = ?3 WHERE process_name = ?1 AND unlock_key = ?2"
    }

    fn delete_lock(&self) -> &str {
        "DELETE FROM darwin_lock WHERE process_name = ?1 AND unlock_key = ?2"
    }

    fn delete_expired_lock(&self) -> &str {
        "DELETE FROM darwin_lock WHERE process_name = ?1 AND lease_until <= ?2"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SqliteDialect.connection_setup()).unwrap();
        conn.execute_batch(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER NOT NULL REFERENCES parent(id), name TEXT UNIQUE);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_unique_violation_detection() {
        let conn = connection();
        conn.execute("INSERT INTO parent (id) VALUES (1)", []).unwrap();
        let err = conn.execute("INSERT INTO parent (id) VALUES (1)", []).unwrap_err();
        assert!(SqliteDialect.is_unique_violation(&err));
        assert!(!SqliteDialect.is_foreign_key_violation(&err));

        conn.execute("INSERT INTO child (id, parent_id, name) VALUES (1, 1, 'a')", [])
            .unwrap();
        let err = conn
            .execute("INSERT INTO child (id, parent_id, name) VALUES (2, 1, 'a')", [])
            .unwrap_err();
        assert!(SqliteDialect.is_unique_violation(&err));
    }

    #[test]
    fn test_foreign_key_violation_detection() {
        let conn = connection();
        let err = conn
            .execute("INSERT INTO child (id, parent_id, name) VALUES (1, 42, 'a')", [])
            .unwrap_err();
        assert!(SqliteDialect.is_foreign_key_violation(&err));
        assert!(!SqliteDialect.is_unique_violation(&err));
    }

    #[test]
    fn test_other_errors_are_not_constraint_violations() {
        let conn = connection();
        let err = conn.execute("INSERT INTO missing VALUES (1)", []).unwrap_err();
        assert!(!SqliteDialect.is_unique_violation(&err));
        assert!(!SqliteDialect.is_foreign_key_violation(&err));
    }

    #[test]
    fn test_busy_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db");
        let writer = Connection::open(&path).unwrap();
        writer.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
        let other = Connection::open(&path).unwrap();
        other.busy_timeout(std::time::Duration::ZERO).unwrap();

        writer.execute_batch(SqliteDialect.begin_transaction()).unwrap();
        let err = other.execute("INSERT INTO t VALUES (1)", []).unwrap_err();
        assert!(SqliteDialect.is_busy(&err));
        assert!(!SqliteDialect.is_unique_violation(&err));
        writer.execute_batch(SqliteDialect.rollback_transaction()).unwrap();

        let err = other.execute("INSERT INTO missing VALUES (1)", []).unwrap_err();
        assert!(!SqliteDialect.is_busy(&err));
    }

    #[test]
    fn test_current_time_is_close_to_local_clock() {
        let conn = connection();
        let millis: i64 = conn
            .query_row(SqliteDialect.current_time_millis(), [], |row| row.get(0))
            .unwrap();
        let local = chrono::Utc::now().timestamp_millis();
        assert!((local - millis).abs() < 5_000);
    }

    #[test]
    fn test_table_exists() {
        let conn = connection();
        let count: i64 = conn
            .query_row(SqliteDialect.table_exists(), ["parent"], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let count: i64 = conn
            .query_row(SqliteDialect.table_exists(), ["nope"], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
