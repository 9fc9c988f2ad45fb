/*!
SQLite-backed record store (primary tier and collection cache).

The table is created lazily on first use with `CREATE TABLE IF NOT EXISTS`.
If it disappears underneath us ("no such table"), the store recreates it
and retries the statement once instead of failing the caller.
*/

use super::RecordStore;
use crate::record::{RecordKind, StorageRecord};
use crate::{Result, StatewardError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Schema version written to `PRAGMA user_version`
pub const SCHEMA_VERSION: i32 = 2;

/// Structured local database keyed by record id
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
    table: String,
    ready: AtomicBool,
}

impl SqliteRecordStore {
    /// Open (or create) a database file; parent directories are created
    pub fn open<P: AsRef<Path>>(path: P, table: &str) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StatewardError::storage(format!(
                        "Failed to create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, table)
    }

    /// Database that lives only as long as this store
    pub fn open_in_memory(table: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(StatewardError::validation(format!(
                "invalid table name: {table:?}"
            )));
        }
        conn.busy_timeout(std::time::Duration::from_secs(2))?;

        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
            ready: AtomicBool::new(false),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StatewardError::tier_unavailable("primary", "connection lock poisoned"))
    }

    fn create_table(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                data TEXT NOT NULL,
                compressed INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                count INTEGER NOT NULL,
                checksum TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_collection ON {table}(collection);
            CREATE INDEX IF NOT EXISTS idx_{table}_timestamp ON {table}(timestamp);
            PRAGMA user_version = {SCHEMA_VERSION};",
            table = self.table
        ))?;
        self.ready.store(true, Ordering::SeqCst);
        debug!(table = %self.table, "Ensured record table exists");
        Ok(())
    }

    /// Run `op`, creating the table first if needed and once more on "no such table"
    fn with_table<T>(&self, op: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.lock()?;
        if !self.ready.load(Ordering::SeqCst) {
            self.create_table(&conn)?;
        }

        match op(&conn) {
            Err(e) if is_missing_table(&e) => {
                warn!(table = %self.table, "Record table missing, recreating");
                self.ready.store(false, Ordering::SeqCst);
                self.create_table(&conn)?;
                Ok(op(&conn)?)
            }
            other => Ok(other?),
        }
    }

    #[cfg(test)]
    pub(crate) fn drop_table(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.table))?;
        Ok(())
    }
}

fn is_missing_table(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(_, Some(message)) if message.contains("no such table")
    )
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StorageRecord> {
    let collection: String = row.get(1)?;
    let count: i64 = row.get(5)?;
    Ok(StorageRecord {
        id: row.get(0)?,
        kind: RecordKind::from_label(&collection),
        data: row.get(2)?,
        compressed: row.get(3)?,
        timestamp: row.get(4)?,
        count: usize::try_from(count).unwrap_or(0),
        checksum: row.get(6)?,
    })
}

impl RecordStore for SqliteRecordStore {
    fn put(&self, record: &StorageRecord) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (id, collection, data, compressed, timestamp, count, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            self.table
        );
        self.with_table(|conn| {
            conn.execute(
                &sql,
                params![
                    record.id,
                    record.kind.label(),
                    record.data,
                    record.compressed,
                    record.timestamp,
                    i64::try_from(record.count).unwrap_or(i64::MAX),
                    record.checksum,
                ],
            )
        })?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<StorageRecord>> {
        let sql = format!(
            "SELECT id, collection, data, compressed, timestamp, count, checksum
             FROM {} WHERE id = ?1",
            self.table
        );
        self.with_table(|conn| conn.query_row(&sql, params![id], record_from_row).optional())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", self.table);
        self.with_table(|conn| conn.execute(&sql, params![id]))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<StorageRecord>> {
        let sql = format!(
            "SELECT id, collection, data, compressed, timestamp, count, checksum
             FROM {} ORDER BY id",
            self.table
        );
        self.with_table(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], record_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    fn clear(&self) -> Result<()> {
        let sql = format!("DELETE FROM {}", self.table);
        self.with_table(|conn| conn.execute(&sql, []))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::APP_STATE_ID;
    use tempfile::TempDir;

    fn record(id: &str, data: &str) -> StorageRecord {
        StorageRecord::plain(id, RecordKind::Collection(id.into()), data.into(), 2)
    }

    #[test]
    fn test_put_get_replace() {
        let store = SqliteRecordStore::open_in_memory("cached_data").unwrap();
        assert!(store.get("tarefas").unwrap().is_none());

        store.put(&record("tarefas", "[1,2]")).unwrap();
        store.put(&record("tarefas", "[3]")).unwrap();

        let loaded = store.get("tarefas").unwrap().unwrap();
        assert_eq!(loaded.data, "[3]");
        assert_eq!(loaded.kind, RecordKind::Collection("tarefas".into()));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_app_state_kind_round_trips() {
        let store = SqliteRecordStore::open_in_memory("states").unwrap();
        let original = StorageRecord::new(
            APP_STATE_ID,
            RecordKind::AppState,
            "{}",
            "1f8b".into(),
            true,
            1,
        );
        store.put(&original).unwrap();
        assert_eq!(store.get(APP_STATE_ID).unwrap(), Some(original));
    }

    #[test]
    fn test_missing_table_is_recreated() {
        let store = SqliteRecordStore::open_in_memory("states").unwrap();
        store.put(&record("a", "[]")).unwrap();

        store.drop_table().unwrap();
        assert!(store.get("a").unwrap().is_none());

        store.drop_table().unwrap();
        store.put(&record("b", "[]")).unwrap();
        assert!(store.get("b").unwrap().is_some());
    }

    #[test]
    fn test_delete_and_clear() {
        let store = SqliteRecordStore::open_in_memory("cached_data").unwrap();
        store.put(&record("a", "[]")).unwrap();
        store.put(&record("b", "[]")).unwrap();

        store.delete("a").unwrap();
        store.delete("missing").unwrap();
        assert_eq!(store.list().unwrap().len(), 1);

        store.clear().unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_two_tables_share_one_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.db");
        let states = SqliteRecordStore::open(&path, "states").unwrap();
        let cache = SqliteRecordStore::open(&path, "cached_data").unwrap();

        states.put(&record("x", "{}")).unwrap();
        cache.put(&record("y", "[]")).unwrap();

        assert!(states.get("y").unwrap().is_none());
        assert!(cache.get("x").unwrap().is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_rejects_bad_table_name() {
        assert!(SqliteRecordStore::open_in_memory("states; DROP").is_err());
    }
}
