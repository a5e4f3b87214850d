//! Object-level transfer primitives invoked as the leaves of bucket sync.
//!
//! Fetching and removing actual object payloads belongs to the local object
//! layer; the engine only decides *which* operations to replay and in what
//! order. Conflict handling is the transfer layer's business: the latest
//! versioned epoch wins there.

use crate::{BucketShard, ObjKey, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait ObjectTransfer: Send + Sync {
    /// Copy one object (or one version of it) from the source zone into the
    /// local zone.
    async fn fetch_object(
        &self,
        source_zone: &str,
        bucket: &BucketShard,
        key: &ObjKey,
        versioned_epoch: u64,
    ) -> Result<()>;

    /// Delete one object locally, mirroring a source-side delete.
    async fn remove_object(
        &self,
        source_zone: &str,
        bucket: &BucketShard,
        key: &ObjKey,
        versioned_epoch: u64,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()>;
}
