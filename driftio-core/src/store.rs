//! Object-KV seam used for all sync-status persistence.
//!
//! The engine only ever touches durable state through [`SyncStore`]: whole
//! objects, extended attributes, ordered OMAP listings and advisory locks.
//! Backends plug in behind the trait; [`MemoryStore`] ships here for tests
//! and single-process deployments.

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;

#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Read a whole object value. `None` when the object does not exist.
    async fn read_object(&self, oid: &str) -> Result<Option<Vec<u8>>>;

    /// Write a whole object value. This recreates the object: any advisory
    /// lock held on it becomes invalid and must be re-acquired.
    async fn write_object(&self, oid: &str, data: &[u8]) -> Result<()>;

    /// Read all extended attributes. `None` when the object does not exist.
    async fn read_attrs(&self, oid: &str) -> Result<Option<HashMap<String, Vec<u8>>>>;

    /// Merge extended attributes into the object, creating it if absent.
    async fn write_attrs(&self, oid: &str, attrs: HashMap<String, Vec<u8>>) -> Result<()>;

    /// Set OMAP entries on the object, creating it if absent.
    async fn omap_set(&self, oid: &str, entries: Vec<(String, Vec<u8>)>) -> Result<()>;

    /// List up to `max_entries` OMAP keys strictly greater than `marker`,
    /// in key order. An empty `marker` starts from the beginning.
    async fn omap_list(&self, oid: &str, marker: &str, max_entries: usize) -> Result<Vec<String>>;

    /// Take or renew an advisory lock. Fails with [`crate::DriftError::LockBusy`]
    /// when a different cookie holds an unexpired lock of the same name.
    async fn lock(&self, oid: &str, lock_name: &str, cookie: &str, duration: Duration)
        -> Result<()>;

    /// Release an advisory lock. Releasing a lock that is no longer held is
    /// not an error.
    async fn unlock(&self, oid: &str, lock_name: &str, cookie: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct LockState {
    name: String,
    cookie: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StoredObject {
    data: Vec<u8>,
    attrs: HashMap<String, Vec<u8>>,
    omap: BTreeMap<String, Vec<u8>>,
    lock: Option<LockState>,
}

/// In-process [`SyncStore`].
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn read_object(&self, oid: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.lock().await;
        Ok(objects.get(oid).map(|obj| obj.data.clone()))
    }

    async fn write_object(&self, oid: &str, data: &[u8]) -> Result<()> {
        let mut objects = self.objects.lock().await;
        let obj = objects.entry(oid.to_string()).or_default();
        obj.data = data.to_vec();
        // A full write recreates the object, dropping any lock with it.
        obj.lock = None;
        Ok(())
    }

    async fn read_attrs(&self, oid: &str) -> Result<Option<HashMap<String, Vec<u8>>>> {
        let objects = self.objects.lock().await;
        Ok(objects.get(oid).map(|obj| obj.attrs.clone()))
    }

    async fn write_attrs(&self, oid: &str, attrs: HashMap<String, Vec<u8>>) -> Result<()> {
        let mut objects = self.objects.lock().await;
        let obj = objects.entry(oid.to_string()).or_default();
        obj.attrs.extend(attrs);
        Ok(())
    }

    async fn omap_set(&self, oid: &str, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        let mut objects = self.objects.lock().await;
        let obj = objects.entry(oid.to_string()).or_default();
        obj.omap.extend(entries);
        Ok(())
    }

    async fn omap_list(&self, oid: &str, marker: &str, max_entries: usize) -> Result<Vec<String>> {
        let objects = self.objects.lock().await;
        let Some(obj) = objects.get(oid) else {
            return Ok(Vec::new());
        };

        let keys = obj
            .omap
            .range::<str, _>((
                std::ops::Bound::Excluded(marker),
                std::ops::Bound::Unbounded,
            ))
            .take(max_entries)
            .map(|(key, _)| key.clone())
            .collect();

        Ok(keys)
    }

    async fn lock(
        &self,
        oid: &str,
        lock_name: &str,
        cookie: &str,
        duration: Duration,
    ) -> Result<()> {
        let mut objects = self.objects.lock().await;
        let obj = objects.entry(oid.to_string()).or_default();

        if let Some(lock) = &obj.lock {
            let held = lock.name == lock_name
                && lock.cookie != cookie
                && lock.expires_at > Utc::now();
            if held {
                return Err(crate::DriftError::LockBusy {
                    oid: oid.to_string(),
                });
            }
        }

        let expires_at = Utc::now()
            + ChronoDuration::from_std(duration)
                .map_err(|e| crate::DriftError::Internal(e.to_string()))?;
        obj.lock = Some(LockState {
            name: lock_name.to_string(),
            cookie: cookie.to_string(),
            expires_at,
        });
        Ok(())
    }

    async fn unlock(&self, oid: &str, lock_name: &str, cookie: &str) -> Result<()> {
        let mut objects = self.objects.lock().await;
        if let Some(obj) = objects.get_mut(oid) {
            let ours = obj
                .lock
                .as_ref()
                .map(|lock| lock.name == lock_name && lock.cookie == cookie)
                .unwrap_or(false);
            if ours {
                obj.lock = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DriftError;

    #[tokio::test]
    async fn object_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.read_object("a").await.unwrap().is_none());

        store.write_object("a", b"hello").await.unwrap();
        assert_eq!(store.read_object("a").await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn attrs_merge_not_replace() {
        let store = MemoryStore::new();
        store
            .write_attrs("a", HashMap::from([("x".to_string(), b"1".to_vec())]))
            .await
            .unwrap();
        store
            .write_attrs("a", HashMap::from([("y".to_string(), b"2".to_vec())]))
            .await
            .unwrap();

        let attrs = store.read_attrs("a").await.unwrap().unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["x"], b"1");
        assert_eq!(attrs["y"], b"2");
    }

    #[tokio::test]
    async fn omap_lists_after_marker_in_order() {
        let store = MemoryStore::new();
        let entries = ["b", "a", "d", "c"]
            .iter()
            .map(|key| (key.to_string(), Vec::new()))
            .collect();
        store.omap_set("idx", entries).await.unwrap();

        let keys = store.omap_list("idx", "", 10).await.unwrap();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);

        let keys = store.omap_list("idx", "b", 1).await.unwrap();
        assert_eq!(keys, vec!["c"]);
    }

    #[tokio::test]
    async fn lock_conflicts_and_renewal() {
        let store = MemoryStore::new();
        store
            .lock("s", "sync_lock", "cookie-1", Duration::from_secs(30))
            .await
            .unwrap();

        let err = store
            .lock("s", "sync_lock", "cookie-2", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, DriftError::LockBusy { .. }));

        // Same cookie renews.
        store
            .lock("s", "sync_lock", "cookie-1", Duration::from_secs(30))
            .await
            .unwrap();

        store.unlock("s", "sync_lock", "cookie-1").await.unwrap();
        store
            .lock("s", "sync_lock", "cookie-2", Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn whole_object_write_invalidates_lock() {
        let store = MemoryStore::new();
        store
            .lock("s", "sync_lock", "cookie-1", Duration::from_secs(30))
            .await
            .unwrap();
        store.write_object("s", b"{}").await.unwrap();

        // The object was recreated; anyone may lock it now.
        store
            .lock("s", "sync_lock", "cookie-2", Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_lock_can_be_stolen() {
        let store = MemoryStore::new();
        store
            .lock("s", "sync_lock", "cookie-1", Duration::from_secs(0))
            .await
            .unwrap();
        store
            .lock("s", "sync_lock", "cookie-2", Duration::from_secs(30))
            .await
            .unwrap();
    }
}
