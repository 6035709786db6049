//! The keyed record store.
//!
//! The core only needs four operations from its store: get, put, delete,
//! and get-all, by collection and key. [`RecordStore`] is that contract;
//! [`SqliteStore`] implements it over a single `records` table. Records
//! are opaque JSON values; anything sensitive inside them is already an
//! `EncryptedField` by the time it arrives here.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// The opaque keyed store the core consumes.
pub trait RecordStore: Send {
    /// Fetch one record, `None` if absent.
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Insert or replace a record. A missing `key` gets a generated one.
    /// Returns the key the record is stored under.
    fn put(&self, collection: &str, record: &Value, key: Option<&str>) -> Result<String>;

    /// Remove a record. Removing an absent key is a no-op.
    fn delete(&self, collection: &str, key: &str) -> Result<()>;

    /// Every record in a collection, in insertion order.
    fn get_all(&self, collection: &str) -> Result<Vec<Value>>;
}

/// SQLite-backed [`RecordStore`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the default application database in the
    /// platform-appropriate data directory.
    pub fn open_default() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "couloir", "couloir").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("couloir.db");
        tracing::info!(path = %db_path.display(), "opening record store");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path. Useful for tests
    /// and custom directory layouts.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                key        TEXT NOT NULL,
                body       TEXT NOT NULL,
                PRIMARY KEY (collection, key)
            )",
            [],
        )?;

        Ok(Self { conn })
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

impl RecordStore for SqliteStore {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    fn put(&self, collection: &str, record: &Value, key: Option<&str>) -> Result<String> {
        let key = key
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let body = serde_json::to_string(record)?;

        self.conn.execute(
            "INSERT OR REPLACE INTO records (collection, key, body) VALUES (?1, ?2, ?3)",
            params![collection, key, body],
        )?;

        Ok(key)
    }

    fn delete(&self, collection: &str, key: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![collection, key],
        )?;
        Ok(())
    }

    fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM records WHERE collection = ?1 ORDER BY rowid")?;

        let bodies = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_at(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = open_temp();

        let record = json!({"name": "general", "kind": "group"});
        let key = store.put("rooms", &record, Some("r1")).unwrap();
        assert_eq!(key, "r1");

        let loaded = store.get("rooms", "r1").unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_get_absent_is_none() {
        let (_dir, store) = open_temp();
        assert!(store.get("rooms", "nope").unwrap().is_none());
    }

    #[test]
    fn test_put_without_key_generates_one() {
        let (_dir, store) = open_temp();

        let key = store.put("messages", &json!({"n": 1}), None).unwrap();
        assert!(!key.is_empty());
        assert!(store.get("messages", &key).unwrap().is_some());
    }

    #[test]
    fn test_put_replaces_whole_record() {
        let (_dir, store) = open_temp();

        store.put("rooms", &json!({"name": "old", "members": [1]}), Some("r1")).unwrap();
        store.put("rooms", &json!({"name": "new"}), Some("r1")).unwrap();

        let loaded = store.get("rooms", "r1").unwrap().unwrap();
        assert_eq!(loaded, json!({"name": "new"}));
        assert_eq!(store.get_all("rooms").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = open_temp();

        store.put("invites", &json!({"x": 1}), Some("i1")).unwrap();
        store.delete("invites", "i1").unwrap();
        store.delete("invites", "i1").unwrap();
        assert!(store.get("invites", "i1").unwrap().is_none());
    }

    #[test]
    fn test_get_all_scoped_to_collection() {
        let (_dir, store) = open_temp();

        store.put("rooms", &json!({"n": 1}), None).unwrap();
        store.put("rooms", &json!({"n": 2}), None).unwrap();
        store.put("invites", &json!({"n": 3}), None).unwrap();

        assert_eq!(store.get_all("rooms").unwrap().len(), 2);
        assert_eq!(store.get_all("invites").unwrap().len(), 1);
        assert!(store.get_all("messages").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.db");

        {
            let store = SqliteStore::open_at(&path).unwrap();
            store.put("rooms", &json!({"kept": true}), Some("r1")).unwrap();
        }

        let store = SqliteStore::open_at(&path).unwrap();
        assert!(store.get("rooms", "r1").unwrap().is_some());
    }
}
