//! Typed client for the source zone's admin endpoints.
//!
//! Everything the engine learns about a peer comes through [`RemoteLog`]:
//! datalog shard heads and listings, bucket index heads and logs, bucket
//! instance metadata and versioned bucket listings. [`HttpRemoteLog`] is the
//! production implementation over the peer's REST admin API.

use crate::{BucketShard, DriftError, LogOp, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Deserialize)]
pub struct DataLogInfo {
    #[serde(rename = "num_objects")]
    pub num_shards: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataLogShardInfo {
    #[serde(default)]
    pub marker: String,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataLogEntryBody {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataLogEntry {
    pub log_id: String,
    #[serde(default)]
    pub log_timestamp: Option<DateTime<Utc>>,
    pub entry: DataLogEntryBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataLogShardListing {
    #[serde(default)]
    pub marker: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub entries: Vec<DataLogEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketIndexInfo {
    #[serde(default)]
    pub bucket_ver: String,
    #[serde(default)]
    pub master_ver: String,
    #[serde(default)]
    pub max_marker: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LogEntryVersion {
    #[serde(default)]
    pub pool: i64,
    #[serde(default)]
    pub epoch: u64,
}

/// One entry of a bucket shard's index log.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketLogEntry {
    pub id: String,
    pub op: LogOp,
    pub object: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ver: LogEntryVersion,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketInstanceRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bucket_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketInstanceInfo {
    #[serde(default)]
    pub bucket: BucketInstanceRef,
    #[serde(default)]
    pub num_shards: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketInstanceData {
    #[serde(default)]
    pub bucket_info: BucketInstanceInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketInstanceMetaInfo {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: BucketInstanceData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketEntryOwner {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "DisplayName", default)]
    pub display_name: String,
}

/// One entry of an S3-style versioned bucket listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BucketListEntry {
    #[serde(default)]
    pub is_delete_marker: bool,
    pub key: String,
    #[serde(default)]
    pub version_id: String,
    #[serde(default)]
    pub is_latest: bool,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(rename = "ETag", default)]
    pub etag: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default)]
    pub owner: BucketEntryOwner,
    #[serde(default)]
    pub versioned_epoch: u64,
    #[serde(rename = "RgwxTag", default)]
    pub rgwx_tag: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BucketListing {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key_marker: String,
    #[serde(default)]
    pub version_id_marker: String,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default)]
    pub entries: Vec<BucketListEntry>,
}

#[async_trait]
pub trait RemoteLog: Send + Sync {
    /// Datalog shard count of the source zone.
    async fn datalog_info(&self) -> Result<DataLogInfo>;

    /// Current head (marker + mtime) of one datalog shard.
    async fn datalog_shard_info(&self, shard_id: u32) -> Result<DataLogShardInfo>;

    /// One page of datalog entries after `marker`.
    async fn list_datalog_shard(&self, shard_id: u32, marker: &str)
        -> Result<DataLogShardListing>;

    /// Current head of one bucket shard's index log.
    async fn bucket_index_info(&self, bucket: &BucketShard) -> Result<BucketIndexInfo>;

    /// One page of bucket index log entries after `marker`.
    async fn list_bucket_index_log(
        &self,
        bucket: &BucketShard,
        marker: &str,
    ) -> Result<Vec<BucketLogEntry>>;

    /// All bucket instance metadata keys of the source zone.
    async fn list_bucket_instances(&self) -> Result<Vec<String>>;

    /// Metadata for one bucket instance key.
    async fn bucket_instance_info(&self, key: &str) -> Result<BucketInstanceMetaInfo>;

    /// One page of a versioned bucket shard listing, starting after the
    /// given key/version markers.
    async fn list_bucket_shard(
        &self,
        bucket: &BucketShard,
        key_marker: &str,
        version_id_marker: &str,
    ) -> Result<BucketListing>;
}

/// Datalog shard that carries the change events of one bucket shard. The
/// same mapping drives the full-sync index layout and the out-of-band
/// wake-ups from the local write path, so it must stay stable.
pub fn log_shard_id(bucket_name: &str, shard_id: i32, num_shards: u32) -> u32 {
    let key = if shard_id >= 0 {
        format!("{}:{}", bucket_name, shard_id)
    } else {
        bucket_name.to_string()
    };

    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % num_shards.max(1) as u64) as u32
}

#[derive(Clone)]
pub struct HttpRemoteLog {
    client: Client,
    endpoint: String,
}

impl HttpRemoteLog {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{}", self.endpoint, path))
            .map_err(|error| DriftError::Http(error.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let path = url.path().to_string();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| DriftError::Http(error.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(DriftError::ObjectNotFound(path));
        }

        if !response.status().is_success() {
            return Err(DriftError::Http(format!(
                "request to {} failed: status={}",
                path,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|error| DriftError::Http(error.to_string()))
    }
}

#[async_trait]
impl RemoteLog for HttpRemoteLog {
    async fn datalog_info(&self) -> Result<DataLogInfo> {
        let mut url = self.url("/admin/log")?;
        url.query_pairs_mut().append_pair("type", "data");
        self.get_json(url).await
    }

    async fn datalog_shard_info(&self, shard_id: u32) -> Result<DataLogShardInfo> {
        let mut url = self.url("/admin/log")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("type", "data");
            pairs.append_pair("id", &shard_id.to_string());
            pairs.append_key_only("info");
        }
        self.get_json(url).await
    }

    async fn list_datalog_shard(
        &self,
        shard_id: u32,
        marker: &str,
    ) -> Result<DataLogShardListing> {
        let mut url = self.url("/admin/log")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("type", "data");
            pairs.append_pair("id", &shard_id.to_string());
            pairs.append_pair("marker", marker);
            pairs.append_pair("extra-info", "true");
        }
        self.get_json(url).await
    }

    async fn bucket_index_info(&self, bucket: &BucketShard) -> Result<BucketIndexInfo> {
        let mut url = self.url("/admin/log")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("type", "bucket-index");
            pairs.append_pair("bucket-instance", &bucket.instance_key());
            pairs.append_key_only("info");
        }
        self.get_json(url).await
    }

    async fn list_bucket_index_log(
        &self,
        bucket: &BucketShard,
        marker: &str,
    ) -> Result<Vec<BucketLogEntry>> {
        let mut url = self.url("/admin/log")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("type", "bucket-index");
            pairs.append_pair("bucket-instance", &bucket.instance_key());
            pairs.append_pair("marker", marker);
            pairs.append_pair("format", "json");
        }
        self.get_json(url).await
    }

    async fn list_bucket_instances(&self) -> Result<Vec<String>> {
        // TODO: page this once the peer grows a streaming metadata listing;
        // one response for the whole zone does not scale past some point.
        let url = self.url("/admin/metadata/bucket.instance")?;
        self.get_json(url).await
    }

    async fn bucket_instance_info(&self, key: &str) -> Result<BucketInstanceMetaInfo> {
        let mut url = self.url("/admin/metadata/bucket.instance")?;
        url.query_pairs_mut().append_pair("key", key);
        self.get_json(url).await
    }

    async fn list_bucket_shard(
        &self,
        bucket: &BucketShard,
        key_marker: &str,
        version_id_marker: &str,
    ) -> Result<BucketListing> {
        let mut url = self.url(&format!("/{}", bucket.bucket_name))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("rgwx-bucket-instance", &bucket.instance_key());
            pairs.append_key_only("versions");
            pairs.append_pair("format", "json");
            pairs.append_pair("objs-container", "true");
            pairs.append_pair("key-marker", key_marker);
            pairs.append_pair("version-id-marker", version_id_marker);
        }
        self.get_json(url).await
    }
}
