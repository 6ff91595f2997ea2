//! Local record store: a single-bucket keyed byte store.
//!
//! Records are kept as JSON-encoded bytes in one `records` table keyed
//! by id. The sync engine only ever needs load-all / save-all / get /
//! delete, so the store exposes exactly that.

use std::path::Path;

use keepsafe_core::model::DataItem;
use keepsafe_core::{Error, Result};
use rusqlite::{Connection, OptionalExtension};

pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                data BLOB NOT NULL
            )",
            [],
        )
        .map_err(db_err)?;
        Ok(Self { conn })
    }

    /// Insert or overwrite one record.
    pub fn save_item(&self, item: &DataItem) -> Result<()> {
        let data = encode(item)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO records (id, data) VALUES (?1, ?2)",
                rusqlite::params![item.id, data],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Upsert a batch atomically. Existing rows with ids outside the
    /// batch are left untouched.
    pub fn save_all(&mut self, items: &[DataItem]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare("INSERT OR REPLACE INTO records (id, data) VALUES (?1, ?2)")
                .map_err(db_err)?;
            for item in items {
                let data = encode(item)?;
                stmt.execute(rusqlite::params![item.id, data]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    /// All records in the bucket.
    pub fn load_all(&self) -> Result<Vec<DataItem>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM records")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))
            .map_err(db_err)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(decode(&row.map_err(db_err)?)?);
        }
        Ok(items)
    }

    pub fn get(&self, id: &str) -> Result<Option<DataItem>> {
        let data = self
            .conn
            .query_row("SELECT data FROM records WHERE id = ?1", [id], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
            .map_err(db_err)?;
        data.map(|bytes| decode(&bytes)).transpose()
    }

    /// Remove a record; returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM records WHERE id = ?1", [id])
            .map_err(db_err)?;
        Ok(changed > 0)
    }
}

fn encode(item: &DataItem) -> Result<Vec<u8>> {
    serde_json::to_vec(item).map_err(|e| Error::Internal(format!("encode record: {e}")))
}

fn decode(bytes: &[u8]) -> Result<DataItem> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::MalformedInput(format!("stored record is unreadable: {e}")))
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Transient(format!("local store error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepsafe_core::model::DataKind;

    fn open_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(&dir.path().join("client.db")).unwrap();
        (dir, store)
    }

    fn item(id: &str, content: &str) -> DataItem {
        DataItem::new(id.into(), DataKind::Text, content.into(), String::new())
    }

    #[test]
    fn save_get_roundtrip() {
        let (_dir, store) = open_store();
        let original = item("a", "hello");
        store.save_item(&original).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(original));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn save_all_overwrites_by_id_and_retains_the_rest() {
        let (_dir, mut store) = open_store();
        store.save_item(&item("keep", "untouched")).unwrap();
        store.save_item(&item("both", "old")).unwrap();

        store
            .save_all(&[item("both", "new"), item("added", "fresh")])
            .unwrap();

        let mut all = store.load_all().unwrap();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let contents: Vec<&str> = all.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, ["fresh", "new", "untouched"]);
    }

    #[test]
    fn delete_reports_presence() {
        let (_dir, store) = open_store();
        store.save_item(&item("a", "x")).unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");
        {
            let store = LocalStore::open(&path).unwrap();
            store.save_item(&item("a", "persisted")).unwrap();
        }
        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().content, "persisted");
    }
}
