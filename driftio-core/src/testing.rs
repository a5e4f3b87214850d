//! Shared fakes for the sync state-machine tests: a scripted peer and a
//! recording transfer layer.

use crate::remote_log::{
    BucketIndexInfo, BucketInstanceMetaInfo, BucketListEntry, BucketListing, BucketLogEntry,
    DataLogEntry, DataLogInfo, DataLogShardInfo, DataLogShardListing, RemoteLog,
};
use crate::transfer::ObjectTransfer;
use crate::{BucketShard, DriftError, ObjKey, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct RemoteState {
    pub num_shards: u32,
    pub shard_heads: HashMap<u32, DataLogShardInfo>,
    /// Datalog entries per shard, sorted by log id.
    pub datalog: HashMap<u32, Vec<DataLogEntry>>,
    pub bucket_instances: Vec<String>,
    pub instance_meta: HashMap<String, BucketInstanceMetaInfo>,
    /// Bucket index heads by instance key.
    pub index_heads: HashMap<String, BucketIndexInfo>,
    /// Versioned listings by instance key, sorted by (key, version).
    pub bucket_objects: HashMap<String, Vec<BucketListEntry>>,
    /// Bucket index logs by instance key, sorted by id.
    pub bucket_logs: HashMap<String, Vec<BucketLogEntry>>,
    pub page_size: usize,
    /// Instance keys whose index log was listed, in call order.
    pub bilog_list_calls: Vec<String>,
}

pub struct FakeRemote {
    pub state: Mutex<RemoteState>,
}

impl FakeRemote {
    pub fn new(state: RemoteState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl RemoteLog for FakeRemote {
    async fn datalog_info(&self) -> Result<DataLogInfo> {
        let state = self.state.lock().unwrap();
        Ok(DataLogInfo {
            num_shards: state.num_shards,
        })
    }

    async fn datalog_shard_info(&self, shard_id: u32) -> Result<DataLogShardInfo> {
        let state = self.state.lock().unwrap();
        Ok(state.shard_heads.get(&shard_id).cloned().unwrap_or_default())
    }

    async fn list_datalog_shard(
        &self,
        shard_id: u32,
        marker: &str,
    ) -> Result<DataLogShardListing> {
        let state = self.state.lock().unwrap();
        let page_size = if state.page_size == 0 {
            100
        } else {
            state.page_size
        };
        let entries: Vec<DataLogEntry> = state
            .datalog
            .get(&shard_id)
            .map(|log| {
                log.iter()
                    .filter(|entry| entry.log_id.as_str() > marker)
                    .take(page_size)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let next_marker = entries
            .last()
            .map(|entry| entry.log_id.clone())
            .unwrap_or_else(|| marker.to_string());
        let remaining = state
            .datalog
            .get(&shard_id)
            .map(|log| {
                log.iter()
                    .any(|entry| entry.log_id.as_str() > next_marker.as_str())
            })
            .unwrap_or(false);

        Ok(DataLogShardListing {
            marker: next_marker,
            truncated: remaining,
            entries,
        })
    }

    async fn bucket_index_info(&self, bucket: &BucketShard) -> Result<BucketIndexInfo> {
        let state = self.state.lock().unwrap();
        state
            .index_heads
            .get(&bucket.instance_key())
            .cloned()
            .ok_or_else(|| DriftError::ObjectNotFound(bucket.instance_key()))
    }

    async fn list_bucket_index_log(
        &self,
        bucket: &BucketShard,
        marker: &str,
    ) -> Result<Vec<BucketLogEntry>> {
        let mut state = self.state.lock().unwrap();
        let instance_key = bucket.instance_key();
        state.bilog_list_calls.push(instance_key);
        let page_size = if state.page_size == 0 {
            100
        } else {
            state.page_size
        };
        Ok(state
            .bucket_logs
            .get(&bucket.instance_key())
            .map(|log| {
                log.iter()
                    .filter(|entry| entry.id.as_str() > marker)
                    .take(page_size)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_bucket_instances(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.bucket_instances.clone())
    }

    async fn bucket_instance_info(&self, key: &str) -> Result<BucketInstanceMetaInfo> {
        let state = self.state.lock().unwrap();
        state
            .instance_meta
            .get(key)
            .cloned()
            .ok_or_else(|| DriftError::ObjectNotFound(key.to_string()))
    }

    async fn list_bucket_shard(
        &self,
        bucket: &BucketShard,
        key_marker: &str,
        version_id_marker: &str,
    ) -> Result<BucketListing> {
        let state = self.state.lock().unwrap();
        let page_size = if state.page_size == 0 {
            100
        } else {
            state.page_size
        };
        let position = (key_marker.to_string(), version_id_marker.to_string());
        let entries: Vec<BucketListEntry> = state
            .bucket_objects
            .get(&bucket.instance_key())
            .map(|objects| {
                objects
                    .iter()
                    .filter(|entry| (entry.key.clone(), entry.version_id.clone()) > position)
                    .take(page_size)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let is_truncated = state
            .bucket_objects
            .get(&bucket.instance_key())
            .map(|objects| {
                let last = entries
                    .last()
                    .map(|entry| (entry.key.clone(), entry.version_id.clone()))
                    .unwrap_or(position);
                objects
                    .iter()
                    .any(|entry| (entry.key.clone(), entry.version_id.clone()) > last)
            })
            .unwrap_or(false);

        Ok(BucketListing {
            name: bucket.bucket_name.clone(),
            is_truncated,
            entries,
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Fetch {
        bucket: String,
        key: ObjKey,
        versioned_epoch: u64,
    },
    Remove {
        bucket: String,
        key: ObjKey,
        versioned_epoch: u64,
    },
}

/// Transfer fake that records every call, optionally failing configured
/// object names, and tracks peak concurrency.
#[derive(Default)]
pub struct RecordingTransfer {
    pub events: Mutex<Vec<TransferEvent>>,
    pub fail_objects: Mutex<HashSet<String>>,
    pub delay: Option<Duration>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn fail_object(&self, name: &str) {
        self.fail_objects.lock().unwrap().insert(name.to_string());
    }

    pub fn events(&self) -> Vec<TransferEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn fetched_names(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TransferEvent::Fetch { key, .. } => Some(key.name),
                _ => None,
            })
            .collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn run_one(&self, event: TransferEvent, name: &str) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.events.lock().unwrap().push(event);
        if self.fail_objects.lock().unwrap().contains(name) {
            return Err(DriftError::Http(format!("injected failure for {}", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectTransfer for RecordingTransfer {
    async fn fetch_object(
        &self,
        _source_zone: &str,
        bucket: &BucketShard,
        key: &ObjKey,
        versioned_epoch: u64,
    ) -> Result<()> {
        self.run_one(
            TransferEvent::Fetch {
                bucket: bucket.instance_key(),
                key: key.clone(),
                versioned_epoch,
            },
            &key.name,
        )
        .await
    }

    async fn remove_object(
        &self,
        _source_zone: &str,
        bucket: &BucketShard,
        key: &ObjKey,
        versioned_epoch: u64,
        _timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.run_one(
            TransferEvent::Remove {
                bucket: bucket.instance_key(),
                key: key.clone(),
                versioned_epoch,
            },
            &key.name,
        )
        .await
    }
}

pub fn datalog_entry(log_id: &str, key: &str) -> DataLogEntry {
    DataLogEntry {
        log_id: log_id.to_string(),
        log_timestamp: Some(Utc::now()),
        entry: crate::remote_log::DataLogEntryBody {
            key: key.to_string(),
        },
    }
}

pub fn list_entry(name: &str, version_id: &str, versioned_epoch: u64) -> BucketListEntry {
    BucketListEntry {
        key: name.to_string(),
        version_id: version_id.to_string(),
        is_latest: true,
        last_modified: Some(Utc::now()),
        size: 1,
        versioned_epoch,
        ..Default::default()
    }
}

pub fn log_entry(id: &str, op: crate::LogOp, object: &str, instance: &str, pool: i64, epoch: u64) -> BucketLogEntry {
    BucketLogEntry {
        id: id.to_string(),
        op,
        object: object.to_string(),
        instance: instance.to_string(),
        timestamp: Some(Utc::now()),
        ver: crate::remote_log::LogEntryVersion { pool, epoch },
    }
}
