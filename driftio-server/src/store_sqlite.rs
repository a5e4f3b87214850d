//! SQLite-backed [`SyncStore`].
//!
//! Status objects, their attributes, OMAP entries and advisory locks map
//! onto four tables. One connection per operation with WAL keeps writers
//! from tripping over the engine's concurrent shard pumps.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use driftio_core::{DriftError, Result, SyncStore};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS objects (
                oid TEXT PRIMARY KEY,
                data BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS attrs (
                oid TEXT NOT NULL,
                name TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (oid, name)
            );
            CREATE TABLE IF NOT EXISTS omap (
                oid TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (oid, key)
            );
            CREATE TABLE IF NOT EXISTS locks (
                oid TEXT NOT NULL,
                name TEXT NOT NULL,
                cookie TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (oid, name)
            );",
        )
        .map_err(db_error)?;
        Ok(())
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).map_err(db_error)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_error)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_error)?;
        Ok(conn)
    }
}

fn db_error(error: rusqlite::Error) -> DriftError {
    DriftError::Database(error.to_string())
}

#[async_trait]
impl SyncStore for SqliteStore {
    async fn read_object(&self, oid: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT data FROM objects WHERE oid = ?1",
            params![oid],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_error)
    }

    async fn write_object(&self, oid: &str, data: &[u8]) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO objects (oid, data) VALUES (?1, ?2)
             ON CONFLICT(oid) DO UPDATE SET data = excluded.data",
            params![oid, data],
        )
        .map_err(db_error)?;
        // The write recreates the object: locks do not survive it.
        conn.execute("DELETE FROM locks WHERE oid = ?1", params![oid])
            .map_err(db_error)?;
        Ok(())
    }

    async fn read_attrs(&self, oid: &str) -> Result<Option<HashMap<String, Vec<u8>>>> {
        let conn = self.connection()?;

        let exists: Option<String> = conn
            .query_row(
                "SELECT oid FROM objects WHERE oid = ?1
                 UNION SELECT oid FROM attrs WHERE oid = ?1 LIMIT 1",
                params![oid],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_error)?;
        if exists.is_none() {
            return Ok(None);
        }

        let mut stmt = conn
            .prepare("SELECT name, value FROM attrs WHERE oid = ?1")
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![oid], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_error)?;

        let mut attrs = HashMap::new();
        for row in rows {
            let (name, value): (String, Vec<u8>) = row.map_err(db_error)?;
            attrs.insert(name, value);
        }
        Ok(Some(attrs))
    }

    async fn write_attrs(&self, oid: &str, attrs: HashMap<String, Vec<u8>>) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(db_error)?;
        for (name, value) in attrs {
            tx.execute(
                "INSERT INTO attrs (oid, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(oid, name) DO UPDATE SET value = excluded.value",
                params![oid, name, value],
            )
            .map_err(db_error)?;
        }
        tx.commit().map_err(db_error)
    }

    async fn omap_set(&self, oid: &str, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(db_error)?;
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO omap (oid, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(oid, key) DO UPDATE SET value = excluded.value",
                params![oid, key, value],
            )
            .map_err(db_error)?;
        }
        tx.commit().map_err(db_error)
    }

    async fn omap_list(&self, oid: &str, marker: &str, max_entries: usize) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT key FROM omap WHERE oid = ?1 AND key > ?2
                 ORDER BY key LIMIT ?3",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![oid, marker, max_entries as i64], |row| row.get(0))
            .map_err(db_error)?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.map_err(db_error)?);
        }
        Ok(keys)
    }

    async fn lock(
        &self,
        oid: &str,
        lock_name: &str,
        cookie: &str,
        duration: Duration,
    ) -> Result<()> {
        let conn = self.connection()?;
        let now = Utc::now();

        let held: Option<(String, String)> = conn
            .query_row(
                "SELECT cookie, expires_at FROM locks WHERE oid = ?1 AND name = ?2",
                params![oid, lock_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_error)?;

        if let Some((holder, expires_at)) = held {
            let live = DateTime::parse_from_rfc3339(&expires_at)
                .map(|at| at.with_timezone(&Utc) > now)
                .unwrap_or(false);
            if live && holder != cookie {
                return Err(DriftError::LockBusy {
                    oid: oid.to_string(),
                });
            }
        }

        let expires_at = now
            + ChronoDuration::from_std(duration)
                .map_err(|e| DriftError::Internal(e.to_string()))?;
        conn.execute(
            "INSERT INTO locks (oid, name, cookie, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(oid, name) DO UPDATE SET
                cookie = excluded.cookie,
                expires_at = excluded.expires_at",
            params![oid, lock_name, cookie, expires_at.to_rfc3339()],
        )
        .map_err(db_error)?;
        Ok(())
    }

    async fn unlock(&self, oid: &str, lock_name: &str, cookie: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM locks WHERE oid = ?1 AND name = ?2 AND cookie = ?3",
            params![oid, lock_name, cookie],
        )
        .map_err(db_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("sync.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn object_and_attr_roundtrip() {
        let (_dir, store) = store();

        assert!(store.read_object("s").await.unwrap().is_none());
        assert!(store.read_attrs("s").await.unwrap().is_none());

        store.write_object("s", b"{}").await.unwrap();
        assert_eq!(store.read_object("s").await.unwrap().unwrap(), b"{}");

        store
            .write_attrs("s", HashMap::from([("state".to_string(), b"1".to_vec())]))
            .await
            .unwrap();
        store
            .write_attrs("s", HashMap::from([("inc".to_string(), b"2".to_vec())]))
            .await
            .unwrap();

        let attrs = store.read_attrs("s").await.unwrap().unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["state"], b"1");
    }

    #[tokio::test]
    async fn omap_pages_in_key_order() {
        let (_dir, store) = store();
        store
            .omap_set(
                "idx",
                vec![
                    ("b".to_string(), Vec::new()),
                    ("a".to_string(), Vec::new()),
                    ("c".to_string(), Vec::new()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.omap_list("idx", "", 2).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.omap_list("idx", "b", 10).await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn locks_conflict_until_released_or_recreated() {
        let (_dir, store) = store();

        store
            .lock("s", "sync_lock", "c1", Duration::from_secs(30))
            .await
            .unwrap();
        let err = store
            .lock("s", "sync_lock", "c2", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, DriftError::LockBusy { .. }));

        // Recreating the object invalidates the lock.
        store.write_object("s", b"{}").await.unwrap();
        store
            .lock("s", "sync_lock", "c2", Duration::from_secs(30))
            .await
            .unwrap();
    }
}
