//! Persisted sync-status records and the typed store wrapper around them.
//!
//! Zone and datalog-shard records are whole-object JSON values. Bucket-shard
//! state is split across the `state`, `full_marker` and `inc_marker` extended
//! attributes so the phases can commit independently.

use crate::store::SyncStore;
use crate::{DriftError, ObjKey, Result};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const ZONE_STATUS_PREFIX: &str = "datalog.sync-status";
const SHARD_STATUS_PREFIX: &str = "datalog.sync-status.shard";
const FULL_SYNC_INDEX_PREFIX: &str = "data.full-sync.index";
const BUCKET_STATUS_PREFIX: &str = "bucket.sync-status";

pub const LOCK_NAME: &str = "sync_lock";
pub const LOCK_DURATION: Duration = Duration::from_secs(30);
const COOKIE_LEN: usize = 16;

pub fn zone_status_oid(source_zone: &str) -> String {
    format!("{}.{}", ZONE_STATUS_PREFIX, source_zone)
}

pub fn shard_status_oid(source_zone: &str, shard_id: u32) -> String {
    format!("{}.{}.{}", SHARD_STATUS_PREFIX, source_zone, shard_id)
}

pub fn full_sync_index_oid(source_zone: &str, shard_id: u32) -> String {
    format!("{}.{}.{}", FULL_SYNC_INDEX_PREFIX, source_zone, shard_id)
}

pub fn bucket_status_oid(source_zone: &str, bucket: &crate::BucketShard) -> String {
    format!("{}.{}:{}", BUCKET_STATUS_PREFIX, source_zone, bucket.instance_key())
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random cookie identifying one lock acquisition.
pub fn generate_lock_cookie() -> String {
    random_token(COOKIE_LEN)
}

/// Random id identifying one lifetime of a zone's sync state.
pub fn generate_instance_id() -> String {
    random_token(COOKIE_LEN)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneSyncState {
    #[default]
    Init,
    BuildingFullSyncMaps,
    Sync,
}

/// Top-level sync state for one source zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSyncInfo {
    pub num_shards: u32,
    pub state: ZoneSyncState,
    pub instance_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataShardState {
    #[default]
    FullSync,
    IncrementalSync,
}

/// Durable progress for one datalog shard.
///
/// `next_step_marker` is the datalog position captured before full sync
/// began; the transition to incremental adopts it as the starting marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataShardMarker {
    pub state: DataShardState,
    pub marker: String,
    pub next_step_marker: String,
    pub pos: u64,
    pub total_entries: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketShardState {
    #[default]
    Init,
    FullSync,
    IncrementalSync,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketFullSyncMarker {
    pub position: ObjKey,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketIncSyncMarker {
    pub position: String,
}

/// Sync state for one bucket shard, stored as three independent xattrs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketShardSyncInfo {
    pub state: BucketShardState,
    pub full_marker: BucketFullSyncMarker,
    pub inc_marker: BucketIncSyncMarker,
}

pub const ATTR_STATE: &str = "state";
pub const ATTR_FULL_MARKER: &str = "full_marker";
pub const ATTR_INC_MARKER: &str = "inc_marker";

impl BucketShardSyncInfo {
    pub fn encode_all_attrs(&self) -> Result<HashMap<String, Vec<u8>>> {
        let mut attrs = HashMap::new();
        attrs.insert(ATTR_STATE.to_string(), serde_json::to_vec(&self.state)?);
        attrs.insert(
            ATTR_FULL_MARKER.to_string(),
            serde_json::to_vec(&self.full_marker)?,
        );
        attrs.insert(
            ATTR_INC_MARKER.to_string(),
            serde_json::to_vec(&self.inc_marker)?,
        );
        Ok(attrs)
    }

    pub fn decode_from_attrs(attrs: &HashMap<String, Vec<u8>>) -> Self {
        Self {
            state: decode_attr(attrs, ATTR_STATE),
            full_marker: decode_attr(attrs, ATTR_FULL_MARKER),
            inc_marker: decode_attr(attrs, ATTR_INC_MARKER),
        }
    }
}

/// A missing or undecodable attribute yields the default value; a status
/// object written by an older phase still decodes.
fn decode_attr<T: DeserializeOwned + Default>(attrs: &HashMap<String, Vec<u8>>, name: &str) -> T {
    let Some(raw) = attrs.get(name) else {
        return T::default();
    };
    match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(error) => {
            tracing::error!("failed to decode status attribute {}: {}", name, error);
            T::default()
        }
    }
}

/// Typed access to sync-status objects on top of the raw [`SyncStore`].
#[derive(Clone)]
pub struct StatusStore {
    store: Arc<dyn SyncStore>,
}

impl StatusStore {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    pub fn raw(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub async fn read_zone_info(&self, source_zone: &str) -> Result<Option<ZoneSyncInfo>> {
        self.read_json(&zone_status_oid(source_zone)).await
    }

    pub async fn write_zone_info(&self, source_zone: &str, info: &ZoneSyncInfo) -> Result<()> {
        self.write_json(&zone_status_oid(source_zone), info).await
    }

    pub async fn read_shard_marker(
        &self,
        source_zone: &str,
        shard_id: u32,
    ) -> Result<Option<DataShardMarker>> {
        self.read_json(&shard_status_oid(source_zone, shard_id)).await
    }

    pub async fn write_shard_marker(
        &self,
        source_zone: &str,
        shard_id: u32,
        marker: &DataShardMarker,
    ) -> Result<()> {
        self.write_json(&shard_status_oid(source_zone, shard_id), marker)
            .await
    }

    pub async fn read_bucket_status(&self, oid: &str) -> Result<Option<BucketShardSyncInfo>> {
        let Some(attrs) = self.store.read_attrs(oid).await? else {
            return Ok(None);
        };
        Ok(Some(BucketShardSyncInfo::decode_from_attrs(&attrs)))
    }

    pub async fn write_bucket_attrs(
        &self,
        oid: &str,
        attrs: HashMap<String, Vec<u8>>,
    ) -> Result<()> {
        self.store.write_attrs(oid, attrs).await
    }

    /// Reset a status object to a fresh whole-object record. The write
    /// recreates the object, so any lock taken before it must be taken
    /// again afterwards.
    pub async fn create_status_object(&self, oid: &str) -> Result<()> {
        self.store.write_object(oid, b"{}").await
    }

    pub async fn lock_status(&self, oid: &str, cookie: &str) -> Result<()> {
        self.store.lock(oid, LOCK_NAME, cookie, LOCK_DURATION).await
    }

    pub async fn unlock_status(&self, oid: &str, cookie: &str) -> Result<()> {
        self.store.unlock(oid, LOCK_NAME, cookie).await
    }

    async fn read_json<T: DeserializeOwned>(&self, oid: &str) -> Result<Option<T>> {
        let Some(raw) = self.store.read_object(oid).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(DriftError::from)
    }

    async fn write_json<T: Serialize>(&self, oid: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.store.write_object(oid, &raw).await
    }
}
