//! SQLite storage for users and records.

pub mod models;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use keepsafe_core::model::{format_timestamp, parse_timestamp, DataItem, DataKind};
use keepsafe_core::{merge, Error, MergeOutcome, Result};
use rusqlite::{Connection, OptionalExtension, Transaction};

use models::UserRow;

/// Thread-safe server storage.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS data_items (
                id TEXT NOT NULL,
                kind INTEGER NOT NULL,
                content TEXT NOT NULL,
                meta TEXT NOT NULL,
                user_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, id)
            );

            CREATE INDEX IF NOT EXISTS idx_data_items_user
                ON data_items(user_id);",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Internal(format!("lock error: {}", e)))
    }

    // --- users ---

    /// Insert a new account. Fails with `Conflict` when the username is
    /// already taken.
    pub fn create_user(&self, user: &UserRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, username, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![user.id, user.username, user.password_hash, user.created_at],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => {
                Error::Conflict(format!("username {:?} already taken", user.username))
            }
            _ => db_err(e),
        })?;
        Ok(())
    }

    pub fn user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, username, password_hash, created_at FROM users WHERE username = ?1",
            [username],
            |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    password_hash: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    // --- records ---

    /// All records belonging to one user.
    pub fn items_for_user(&self, user_id: &str) -> Result<Vec<DataItem>> {
        let conn = self.conn()?;
        load_items(&conn, user_id)
    }

    /// Upsert a batch of records in one transaction.
    pub fn save_items(&self, items: &[DataItem]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        upsert_items(&tx, items)?;
        tx.commit().map_err(db_err)
    }

    /// Load the user's records, merge them with `client_items`, and
    /// persist the result, all inside one transaction. Concurrent syncs
    /// for the same user serialize on commit order.
    pub fn merge_user_items(
        &self,
        user_id: &str,
        client_items: &[DataItem],
    ) -> Result<MergeOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let server_items = load_items(&tx, user_id)?;
        let outcome = merge(client_items, &server_items)?;
        upsert_items(&tx, &outcome.merged)?;
        tx.commit().map_err(db_err)?;
        Ok(outcome)
    }
}

fn load_items(conn: &Connection, user_id: &str) -> Result<Vec<DataItem>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, kind, content, meta, user_id, updated_at
             FROM data_items WHERE user_id = ?1",
        )
        .map_err(db_err)?;

    let rows = stmt
        .query_map([user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .map_err(db_err)?;

    let mut items = Vec::new();
    for row in rows {
        let (id, kind, content, meta, user_id, updated_at) = row.map_err(db_err)?;
        items.push(DataItem {
            id,
            kind: DataKind::from_code(kind)?,
            content,
            meta,
            user_id,
            updated_at: parse_timestamp(&updated_at)?,
        });
    }
    Ok(items)
}

fn upsert_items(tx: &Transaction<'_>, items: &[DataItem]) -> Result<()> {
    // The guard keeps `updated_at` monotonic per (user_id, id) even if a
    // stale batch arrives after a fresher one committed.
    let mut stmt = tx
        .prepare(
            "INSERT INTO data_items (id, kind, content, meta, user_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (user_id, id) DO UPDATE SET
                kind = excluded.kind,
                content = excluded.content,
                meta = excluded.meta,
                updated_at = excluded.updated_at
             WHERE excluded.updated_at >= data_items.updated_at",
        )
        .map_err(db_err)?;

    for item in items {
        stmt.execute(rusqlite::params![
            item.id,
            item.kind.code(),
            item.content,
            item.meta,
            item.user_id,
            format_timestamp(item.updated_at),
        ])
        .map_err(db_err)?;
    }
    Ok(())
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Transient(format!("database error: {}", e))
}
