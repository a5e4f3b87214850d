//! Driftio Core - asynchronous data replication engine for multi-zone
//! object storage.
//!
//! For each configured source zone the engine tails the zone's sharded data
//! changelog and per-bucket index logs and replays the object mutations
//! locally. Progress is tracked per shard through durable markers; the
//! object payloads themselves move through an external transfer layer.

pub mod bucket_sync;
pub mod data_sync;
pub mod error;
pub mod marker;
pub mod remote_log;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod transfer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bucket_sync::BucketShardSync;
pub use data_sync::{ShardHandle, ZoneDataSync};
pub use error::{DriftError, Result};
pub use remote_log::{HttpRemoteLog, RemoteLog};
pub use status::{
    BucketShardState, BucketShardSyncInfo, DataShardMarker, DataShardState, StatusStore,
    ZoneSyncInfo, ZoneSyncState,
};
pub use store::{MemoryStore, SyncStore};
pub use transfer::ObjectTransfer;
pub use types::{parse_bucket_shard, BucketShard, LogOp, ObjKey};

use std::sync::Arc;

/// Dependency context handed to every sync component: the peer client, the
/// status store and the object transfer layer.
#[derive(Clone)]
pub struct SyncDeps {
    pub remote: Arc<dyn RemoteLog>,
    pub status: StatusStore,
    pub transfer: Arc<dyn ObjectTransfer>,
}
