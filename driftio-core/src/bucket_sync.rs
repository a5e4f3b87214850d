//! Replication of a single bucket shard.
//!
//! A bucket shard moves Init → FullSync → IncrementalSync and never back.
//! Init captures the remote index-log head *before* the bulk listing starts,
//! so every mutation racing with full sync is replayed from the log
//! afterwards. Full sync walks the remote listing; incremental sync tails
//! the bucket index log.

use crate::marker::{MarkerUpdate, SharedTracker, StoreMarker, TrackedMarkers};
use crate::remote_log::BucketIndexInfo;
use crate::scheduler::ChildSet;
use crate::status::{
    bucket_status_oid, generate_lock_cookie, BucketFullSyncMarker, BucketIncSyncMarker,
    BucketShardState, BucketShardSyncInfo, StatusStore, ATTR_FULL_MARKER, ATTR_INC_MARKER,
    ATTR_STATE,
};
use crate::{BucketShard, DriftError, LogOp, ObjKey, Result, SyncDeps};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Debug;

const UPDATE_MARKER_WINDOW: usize = 10;
const SPAWN_WINDOW: usize = 20;

struct FullMarkerStore {
    status: StatusStore,
    oid: String,
    marker: BucketFullSyncMarker,
}

#[async_trait::async_trait]
impl StoreMarker<ObjKey> for FullMarkerStore {
    async fn store_marker(&mut self, update: &MarkerUpdate<ObjKey>) -> Result<()> {
        self.marker.position = update.marker.clone();
        self.marker.count = update.pos;

        tracing::debug!(
            "updating full marker oid={} marker={}",
            self.oid,
            update.marker
        );
        let mut attrs = HashMap::new();
        attrs.insert(
            ATTR_FULL_MARKER.to_string(),
            serde_json::to_vec(&self.marker)?,
        );
        self.status.write_bucket_attrs(&self.oid, attrs).await
    }
}

struct IncMarkerStore {
    status: StatusStore,
    oid: String,
    marker: BucketIncSyncMarker,
}

#[async_trait::async_trait]
impl StoreMarker<String> for IncMarkerStore {
    async fn store_marker(&mut self, update: &MarkerUpdate<String>) -> Result<()> {
        self.marker.position = update.marker.clone();

        tracing::debug!(
            "updating inc marker oid={} marker={}",
            self.oid,
            update.marker
        );
        let mut attrs = HashMap::new();
        attrs.insert(
            ATTR_INC_MARKER.to_string(),
            serde_json::to_vec(&self.marker)?,
        );
        self.status.write_bucket_attrs(&self.oid, attrs).await
    }
}

pub struct BucketShardSync {
    deps: SyncDeps,
    source_zone: String,
    bucket: BucketShard,
    status_oid: String,
}

impl BucketShardSync {
    pub fn new(deps: SyncDeps, source_zone: impl Into<String>, bucket: BucketShard) -> Self {
        let source_zone = source_zone.into();
        let status_oid = bucket_status_oid(&source_zone, &bucket);
        Self {
            deps,
            source_zone,
            bucket,
            status_oid,
        }
    }

    /// Run this bucket shard through whatever phases it still owes. Full
    /// sync runs to completion; incremental sync returns once the log has
    /// no new entries, and the datalog layer re-enters on the next event.
    pub async fn run(&self) -> Result<()> {
        let mut info = self
            .deps
            .status
            .read_bucket_status(&self.status_oid)
            .await?
            .unwrap_or_default();

        tracing::debug!(
            "bucket shard {} sync state: {:?}",
            self.bucket,
            info.state
        );

        if info.state == BucketShardState::Init {
            self.init_sync_status(&mut info).await?;
        }
        if info.state == BucketShardState::FullSync {
            self.full_sync(&mut info).await?;
        }
        if info.state == BucketShardState::IncrementalSync {
            self.incremental_sync(&mut info).await?;
        }
        Ok(())
    }

    /// Create the status object and capture the remote index-log head as the
    /// incremental starting position, all under the status lock.
    async fn init_sync_status(&self, info: &mut BucketShardSyncInfo) -> Result<()> {
        let cookie = generate_lock_cookie();

        self.deps.status.lock_status(&self.status_oid, &cookie).await?;
        self.deps.status.create_status_object(&self.status_oid).await?;
        // The write recreated the object; the lock has to be taken again.
        self.deps.status.lock_status(&self.status_oid, &cookie).await?;

        let index_info = match self.deps.remote.bucket_index_info(&self.bucket).await {
            Ok(head) => head,
            Err(error) if error.is_not_found() => BucketIndexInfo::default(),
            Err(error) => {
                tracing::error!(
                    "failed to fetch bucket index head for {}: {}",
                    self.bucket,
                    error
                );
                return Err(error);
            }
        };

        info.state = BucketShardState::FullSync;
        info.inc_marker.position = index_info.max_marker;
        self.deps
            .status
            .write_bucket_attrs(&self.status_oid, info.encode_all_attrs()?)
            .await?;

        self.deps.status.unlock_status(&self.status_oid, &cookie).await?;
        Ok(())
    }

    async fn full_sync(&self, info: &mut BucketShardSyncInfo) -> Result<()> {
        let committer = TrackedMarkers::shared(
            UPDATE_MARKER_WINDOW,
            FullMarkerStore {
                status: self.deps.status.clone(),
                oid: self.status_oid.clone(),
                marker: info.full_marker.clone(),
            },
        );

        let mut total_entries = info.full_marker.count;
        let mut list_marker = info.full_marker.position.clone();
        let mut children = ChildSet::new();
        let mut errors = Vec::new();

        loop {
            tracing::debug!("listing bucket shard {} for full sync", self.bucket);
            let listing = match self
                .deps
                .remote
                .list_bucket_shard(&self.bucket, &list_marker.name, &list_marker.instance)
                .await
            {
                Ok(listing) => listing,
                Err(error) if error.is_not_found() => break,
                Err(error) => {
                    children.drain().await;
                    return Err(error);
                }
            };

            for entry in &listing.entries {
                tracing::debug!(
                    "full sync {}: object={}[{}]",
                    self.bucket,
                    entry.key,
                    entry.version_id
                );

                total_entries += 1;
                let key = ObjKey::new(entry.key.clone(), entry.version_id.clone());
                committer
                    .lock()
                    .await
                    .start(key.clone(), total_entries, entry.last_modified);
                list_marker = key.clone();

                // The listing is a synthetic view, not a change log: every
                // entry replays as an add. The entry worker skips versioned
                // keys, which arrive through their olh link events instead.
                children.spawn(sync_entry(
                    self.deps.clone(),
                    self.source_zone.clone(),
                    self.bucket.clone(),
                    LogOp::Add,
                    key.clone(),
                    entry.versioned_epoch,
                    entry.last_modified,
                    key,
                    committer.clone(),
                ));
                children.keep_within(SPAWN_WINDOW, &mut errors).await;
                log_entry_errors(&self.bucket, &mut errors);
            }

            if !listing.is_truncated {
                break;
            }
        }

        errors.extend(children.drain().await);
        log_entry_errors(&self.bucket, &mut errors);

        // Fold the final marker flush into the state transition write.
        let mut attrs = HashMap::new();
        if let Some(update) = committer.lock().await.take_flush() {
            info.full_marker.position = update.marker;
            info.full_marker.count = update.pos;
            attrs.insert(
                ATTR_FULL_MARKER.to_string(),
                serde_json::to_vec(&info.full_marker)?,
            );
        }
        info.state = BucketShardState::IncrementalSync;
        attrs.insert(ATTR_STATE.to_string(), serde_json::to_vec(&info.state)?);
        self.deps
            .status
            .write_bucket_attrs(&self.status_oid, attrs)
            .await?;

        Ok(())
    }

    async fn incremental_sync(&self, info: &mut BucketShardSyncInfo) -> Result<()> {
        let committer = TrackedMarkers::shared(
            UPDATE_MARKER_WINDOW,
            IncMarkerStore {
                status: self.deps.status.clone(),
                oid: self.status_oid.clone(),
                marker: info.inc_marker.clone(),
            },
        );

        let mut position = info.inc_marker.position.clone();
        let mut children = ChildSet::new();
        let mut errors = Vec::new();

        loop {
            tracing::debug!(
                "listing bucket index log {} after {:?}",
                self.bucket,
                position
            );
            let entries = match self
                .deps
                .remote
                .list_bucket_index_log(&self.bucket, &position)
                .await
            {
                Ok(entries) => entries,
                Err(error) if error.is_not_found() => Vec::new(),
                Err(error) => {
                    children.drain().await;
                    return Err(error);
                }
            };

            if entries.is_empty() {
                break;
            }

            for entry in entries {
                let key = ObjKey::new(entry.object, entry.instance);
                tracing::debug!("inc sync {}: op={:?} object={}", self.bucket, entry.op, key);

                let versioned_epoch = if entry.ver.pool < 0 { entry.ver.epoch } else { 0 };
                committer
                    .lock()
                    .await
                    .start(entry.id.clone(), 0, entry.timestamp);
                position = entry.id.clone();

                children.spawn(sync_entry(
                    self.deps.clone(),
                    self.source_zone.clone(),
                    self.bucket.clone(),
                    entry.op,
                    key,
                    versioned_epoch,
                    entry.timestamp,
                    entry.id,
                    committer.clone(),
                ));
                children.keep_within(SPAWN_WINDOW, &mut errors).await;
                log_entry_errors(&self.bucket, &mut errors);
            }
        }

        errors.extend(children.drain().await);
        log_entry_errors(&self.bucket, &mut errors);
        committer.lock().await.commit_flush().await?;

        info.inc_marker.position = position;
        Ok(())
    }
}

fn log_entry_errors(bucket: &BucketShard, errors: &mut Vec<DriftError>) {
    for error in errors.drain(..) {
        tracing::error!("bucket shard {} sync operation failed: {}", bucket, error);
    }
}

/// Apply one object-level operation and finish its marker. A failed
/// operation leaves the marker pending so durable progress stalls at the
/// failure and the next pass retries it.
#[allow(clippy::too_many_arguments)]
async fn sync_entry<T, S>(
    deps: SyncDeps,
    source_zone: String,
    bucket: BucketShard,
    op: LogOp,
    key: ObjKey,
    versioned_epoch: u64,
    timestamp: Option<DateTime<Utc>>,
    entry_marker: T,
    committer: SharedTracker<T, S>,
) -> Result<()>
where
    T: Ord + Clone + Debug + Send + 'static,
    S: StoreMarker<T> + 'static,
{
    let result = match op {
        LogOp::Add | LogOp::LinkOlh => {
            if op == LogOp::Add && key.has_instance() {
                tracing::debug!(
                    "skipping {}/{}/{}: versioned object will be synced on link_olh",
                    source_zone,
                    bucket,
                    key
                );
                Ok(())
            } else {
                tracing::info!(
                    "bucket sync: fetch {}/{}/{} versioned_epoch={}",
                    source_zone,
                    bucket,
                    key,
                    versioned_epoch
                );
                deps.transfer
                    .fetch_object(&source_zone, &bucket, &key, versioned_epoch)
                    .await
            }
        }
        LogOp::Del => {
            tracing::info!(
                "bucket sync: remove {}/{}/{} versioned_epoch={}",
                source_zone,
                bucket,
                key,
                versioned_epoch
            );
            deps.transfer
                .remove_object(&source_zone, &bucket, &key, versioned_epoch, timestamp)
                .await
        }
        // Ops with no local counterpart still advance the marker.
        LogOp::Other => Ok(()),
    };

    match result {
        Err(error) if !error.is_not_found() => {
            tracing::error!(
                "failed to sync object {}/{}: {}",
                bucket,
                key,
                error
            );
            Err(error)
        }
        _ => committer.lock().await.finish(&entry_marker).await,
    }
}
