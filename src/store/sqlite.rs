//! SQLite writer for `sqlite` connection URLs.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, TransactionBehavior, params};

use super::{Binding, Engine, Store};
use crate::deliver::Payload;
use crate::error::{Error, InsertFailure};

/// Table holding one row per edge record.
pub const TABLE: &str = "performance_statistics";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS performance_statistics (
    id                        INTEGER PRIMARY KEY AUTOINCREMENT,
    test_id                   TEXT    NOT NULL,
    sample_id                 TEXT    NOT NULL,
    test_case_name            TEXT    NOT NULL,
    name_of_method_under_test TEXT    NOT NULL,
    epoch_timestamp           REAL    NOT NULL,
    human_timestamp           TEXT    NOT NULL,
    child_path                TEXT    NOT NULL,
    child_line_number         INTEGER NOT NULL,
    child_function_name       TEXT    NOT NULL,
    parent_path               TEXT    NOT NULL,
    parent_line_number        INTEGER NOT NULL,
    parent_function_name      TEXT    NOT NULL,
    number_of_calls           INTEGER NOT NULL,
    total_time                REAL    NOT NULL,
    cumulative_time           REAL    NOT NULL,
    total_response_time       REAL    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_performance_statistics_sample
    ON performance_statistics (test_id, sample_id);
";

const INSERT: &str = "
INSERT INTO performance_statistics (
    test_id, sample_id, test_case_name, name_of_method_under_test,
    epoch_timestamp, human_timestamp,
    child_path, child_line_number, child_function_name,
    parent_path, parent_line_number, parent_function_name,
    number_of_calls, total_time, cumulative_time, total_response_time
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)";

/// Writes payloads into one SQLite file per logical database.
///
/// Connections are opened on first use and cached for the life of the store.
#[derive(Debug)]
pub struct SqliteStore {
    base: Option<String>,
    connections: Mutex<HashMap<PathBuf, Connection>>,
}

impl SqliteStore {
    /// Store resolving names against `base` (a `sqlite` URL prefix, or the
    /// temp directory when `None`).
    pub fn new(base: Option<&str>) -> Self {
        Self {
            base: base.map(str::to_owned),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Create the database file and its schema. Existing databases are kept.
    pub fn create_database(&self, database_name: &str) -> Result<Binding, Error> {
        let binding = self.resolve(database_name)?;
        let path = db_path(&binding)?;
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if !connections.contains_key(&path) {
            connections.insert(path.clone(), open(&path)?);
        }
        Ok(binding)
    }

    /// Delete the database file. Returns whether it existed.
    pub fn drop_database(&self, database_name: &str) -> Result<bool, Error> {
        let binding = self.resolve(database_name)?;
        let path = db_path(&binding)?;
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Rows stored for `database_name`; zero when the database does not exist.
    pub fn count_records(&self, database_name: &str) -> Result<u64, Error> {
        let binding = self.resolve(database_name)?;
        let path = db_path(&binding)?;
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if !connections.contains_key(&path) {
            if !path.exists() {
                return Ok(0);
            }
            connections.insert(path.clone(), open(&path)?);
        }
        let conn = &connections[&path];
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {TABLE}"), [], |row| {
            row.get(0)
        })?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn write(&self, payload: &Payload, binding: &Binding) -> Result<usize, Error> {
        let path = db_path(binding)?;
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let conn = match connections.entry(path) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let conn = open(entry.key())?;
                entry.insert(conn)
            }
        };

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(INSERT)?;
            for r in payload.rows() {
                stmt.execute(params![
                    r.test_id,
                    r.sample_id,
                    r.test_case_name,
                    r.name_of_method_under_test,
                    r.epoch_timestamp,
                    r.human_timestamp.to_rfc3339(),
                    r.child_path,
                    r.child_line_number,
                    r.child_function_name,
                    r.parent_path,
                    r.parent_line_number,
                    r.parent_function_name,
                    i64::try_from(r.number_of_calls).unwrap_or(i64::MAX),
                    r.total_time,
                    r.cumulative_time,
                    r.total_response_time,
                ])?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }
}

impl Store for SqliteStore {
    fn resolve(&self, database_name: &str) -> Result<Binding, Error> {
        let binding = Binding::resolve(self.base.as_deref(), database_name);
        if binding.engine != Engine::Serverless {
            return Err(Error::UnsupportedEngine { url: binding.url });
        }
        Ok(binding)
    }

    fn insert(&self, payload: &Payload, binding: &Binding) -> Result<(), InsertFailure> {
        let written = self
            .write(payload, binding)
            .map_err(|e| InsertFailure::new(&binding.database_name, e))?;
        tracing::debug!(database = %binding.database_name, rows = written, "inserted payload");
        Ok(())
    }
}

fn db_path(binding: &Binding) -> Result<PathBuf, Error> {
    binding
        .local_path()
        .filter(|_| binding.is_serverless())
        .ok_or_else(|| Error::UnsupportedEngine {
            url: binding.url.clone(),
        })
}

fn open(path: &Path) -> Result<Connection, Error> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    tracing::debug!(path = %path.display(), "opened statistics database");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SqliteStore {
        SqliteStore::new(Some(&format!("sqlite:///{}/", dir.path().display())))
    }

    #[test]
    fn create_then_drop() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let binding = store.create_database("bench").unwrap();
        let path = binding.local_path().unwrap();
        assert!(path.exists());
        assert_eq!(store.count_records("bench").unwrap(), 0);

        assert!(store.drop_database("bench").unwrap());
        assert!(!path.exists());
        assert!(!store.drop_database("bench").unwrap());
    }

    #[test]
    fn missing_database_counts_zero_without_creating_it() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.count_records("absent").unwrap(), 0);
        assert!(!dir.path().join("absent.db").exists());
    }

    #[test]
    fn server_base_is_rejected() {
        let store = SqliteStore::new(Some("postgresql://db"));
        assert!(matches!(
            store.resolve("bench"),
            Err(Error::UnsupportedEngine { .. })
        ));
    }
}
