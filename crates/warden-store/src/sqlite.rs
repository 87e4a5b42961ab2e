//! SQLite-based store implementation

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use warden_api::{LeaseSet, Tx};

use crate::{LeaseStore, StoreError, StoreResult};

/// Lease store backed by a SQLite database
///
/// Each resource is one row holding its revision and its JSON-encoded lease
/// set.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS lease (
                resource TEXT PRIMARY KEY,
                revision INTEGER NOT NULL,
                leases TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Lease schema initialized");
        Ok(())
    }
}

fn read_record(conn: &Connection, resource: &str) -> StoreResult<Option<(u64, LeaseSet)>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT revision, leases FROM lease WHERE resource = ?",
            [resource],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((revision, json)) => {
            let leases: LeaseSet = serde_json::from_str(&json)?;
            Ok(Some((revision as u64, leases)))
        }
        None => Ok(None),
    }
}

impl LeaseStore for SqliteStore {
    fn name(&self) -> String {
        match &self.path {
            Some(path) => format!("SQLite ({})", path.display()),
            None => "SQLite (:memory:)".to_string(),
        }
    }

    fn resources(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT resource, leases FROM lease ORDER BY resource")?;
        let rows = stmt.query_map([], |row| {
            let resource: String = row.get(0)?;
            let leases: String = row.get(1)?;
            Ok((resource, leases))
        })?;

        let mut resources = Vec::new();
        for row in rows {
            let (resource, json) = row?;
            let leases: LeaseSet = serde_json::from_str(&json)?;
            if !leases.is_empty() {
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    fn view(&self, resource: &str) -> StoreResult<(u64, LeaseSet)> {
        let conn = self.conn.lock().unwrap();
        Ok(read_record(&conn, resource)?.unwrap_or_default())
    }

    fn commit(&self, tx: &Tx) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (revision, mut leases) = read_record(&txn, tx.resource())?.unwrap_or_default();
        if revision != tx.revision() {
            return Err(StoreError::Conflict {
                resource: tx.resource().to_string(),
                expected: tx.revision(),
                actual: revision,
            });
        }

        leases.apply(tx.ops());
        let next = revision + 1;
        let json = serde_json::to_string(&leases)?;
        txn.execute(
            "INSERT INTO lease (resource, revision, leases) VALUES (?1, ?2, ?3)
             ON CONFLICT(resource) DO UPDATE SET revision = excluded.revision, leases = excluded.leases",
            params![tx.resource(), next as i64, json],
        )?;
        txn.commit()?;

        debug!(resource = tx.resource(), revision = next, ops = tx.ops().len(), "Lease commit");
        Ok(())
    }
}
