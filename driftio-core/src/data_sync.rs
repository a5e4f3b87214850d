//! Zone-level data sync: one driver per source zone, one pump per datalog
//! shard.
//!
//! The driver walks Init → BuildingFullSyncMaps → Sync. Init persists the
//! zone record and captures every shard's remote head so incremental sync
//! can later start exactly where full sync began. BuildingFullSyncMaps
//! enumerates the source's bucket instances into per-shard full-sync
//! indexes. Sync runs the shard pumps forever.

use crate::bucket_sync::BucketShardSync;
use crate::marker::{MarkerUpdate, SharedTracker, StoreMarker, TrackedMarkers};
use crate::remote_log::log_shard_id;
use crate::scheduler::ChildSet;
use crate::status::{
    full_sync_index_oid, generate_instance_id, generate_lock_cookie, zone_status_oid,
    DataShardMarker, DataShardState, StatusStore, ZoneSyncInfo, ZoneSyncState,
};
use crate::{parse_bucket_shard, DriftError, Result, SyncDeps};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

const OMAP_GET_MAX_ENTRIES: usize = 100;
const UPDATE_MARKER_WINDOW: usize = 1;
const INCREMENTAL_INTERVAL: Duration = Duration::from_secs(20);

struct ShardMarkerStore {
    status: StatusStore,
    source_zone: String,
    shard_id: u32,
    marker: DataShardMarker,
}

#[async_trait::async_trait]
impl StoreMarker<String> for ShardMarkerStore {
    async fn store_marker(&mut self, update: &MarkerUpdate<String>) -> Result<()> {
        self.marker.marker = update.marker.clone();
        self.marker.pos = update.pos;

        tracing::debug!(
            "updating shard marker zone={} shard_id={} marker={}",
            self.source_zone,
            self.shard_id,
            update.marker
        );
        self.status
            .write_shard_marker(&self.source_zone, self.shard_id, &self.marker)
            .await
    }
}

type ShardCommitter = SharedTracker<String, ShardMarkerStore>;

/// Wake-up side of one running shard pump. The local write path appends the
/// bucket shards it touched and pokes the pump out of its idle wait.
pub struct ShardHandle {
    modified: Mutex<HashSet<String>>,
    wake: Notify,
}

impl ShardHandle {
    fn new() -> Self {
        Self {
            modified: Mutex::new(HashSet::new()),
            wake: Notify::new(),
        }
    }

    fn append_modified(&self, keys: impl IntoIterator<Item = String>) {
        self.modified.lock().unwrap().extend(keys);
    }

    fn drain_modified(&self) -> HashSet<String> {
        std::mem::take(&mut *self.modified.lock().unwrap())
    }
}

struct DataShardSync {
    deps: SyncDeps,
    source_zone: String,
    shard_id: u32,
    marker: DataShardMarker,
    handle: Arc<ShardHandle>,
}

impl DataShardSync {
    fn new(
        deps: SyncDeps,
        source_zone: String,
        shard_id: u32,
        marker: DataShardMarker,
        handle: Arc<ShardHandle>,
    ) -> Self {
        Self {
            deps,
            source_zone,
            shard_id,
            marker,
            handle,
        }
    }

    async fn run(mut self) -> Result<()> {
        loop {
            match self.marker.state {
                DataShardState::FullSync => self.full_sync().await?,
                DataShardState::IncrementalSync => self.incremental_sync().await?,
            }
        }
    }

    fn committer(&self) -> ShardCommitter {
        TrackedMarkers::shared(
            UPDATE_MARKER_WINDOW,
            ShardMarkerStore {
                status: self.deps.status.clone(),
                source_zone: self.source_zone.clone(),
                shard_id: self.shard_id,
                marker: self.marker.clone(),
            },
        )
    }

    /// Walk the pre-built full-sync index for this shard, syncing every
    /// bucket shard it names, then adopt the captured head marker and move
    /// to incremental.
    async fn full_sync(&mut self) -> Result<()> {
        let index_oid = full_sync_index_oid(&self.source_zone, self.shard_id);
        let committer = self.committer();
        let mut total_entries = self.marker.pos;
        let mut children = ChildSet::new();
        let mut errors = Vec::new();

        loop {
            let keys = self
                .deps
                .status
                .raw()
                .omap_list(&index_oid, &self.marker.marker, OMAP_GET_MAX_ENTRIES)
                .await?;
            let page_len = keys.len();

            for raw_key in keys {
                tracing::debug!("shard {} full sync: {}", self.shard_id, raw_key);
                total_entries += 1;
                committer
                    .lock()
                    .await
                    .start(raw_key.clone(), total_entries, None);
                children.spawn(sync_single_entry(
                    self.deps.clone(),
                    self.source_zone.clone(),
                    raw_key.clone(),
                    Some(raw_key.clone()),
                    committer.clone(),
                ));
                self.marker.marker = raw_key;
            }

            children.try_collect(&mut errors);
            self.surface_errors(&mut errors)?;

            if page_len < OMAP_GET_MAX_ENTRIES {
                break;
            }
        }

        errors.extend(children.drain().await);
        self.surface_errors(&mut errors)?;

        // Full sync is done: continue from the datalog position captured
        // before it started.
        self.marker.state = DataShardState::IncrementalSync;
        self.marker.marker = std::mem::take(&mut self.marker.next_step_marker);
        self.deps
            .status
            .write_shard_marker(&self.source_zone, self.shard_id, &self.marker)
            .await?;

        Ok(())
    }

    async fn incremental_sync(&mut self) -> Result<()> {
        let committer = self.committer();
        let mut children = ChildSet::new();
        let mut errors = Vec::new();

        loop {
            // Out-of-band notifications first; they carry no log marker and
            // never gate durable progress.
            for raw_key in self.handle.drain_modified() {
                tracing::debug!(
                    "shard {} async update notification: {}",
                    self.shard_id,
                    raw_key
                );
                children.spawn(sync_single_entry(
                    self.deps.clone(),
                    self.source_zone.clone(),
                    raw_key,
                    None,
                    committer.clone(),
                ));
            }

            children.try_collect(&mut errors);
            self.surface_errors(&mut errors)?;

            let shard_info = match self.deps.remote.datalog_shard_info(self.shard_id).await {
                Ok(info) => info,
                Err(error) => {
                    tracing::warn!(
                        "failed to read remote datalog shard {} head: {}",
                        self.shard_id,
                        error
                    );
                    self.idle_wait().await;
                    continue;
                }
            };

            let datalog_marker = shard_info.marker;
            tracing::debug!(
                "shard {} datalog_marker={:?} sync_marker={:?}",
                self.shard_id,
                datalog_marker,
                self.marker.marker
            );

            if datalog_marker > self.marker.marker {
                let listing = match self
                    .deps
                    .remote
                    .list_datalog_shard(self.shard_id, &self.marker.marker)
                    .await
                {
                    Ok(listing) => listing,
                    Err(error) => {
                        tracing::warn!(
                            "failed to list remote datalog shard {}: {}",
                            self.shard_id,
                            error
                        );
                        self.idle_wait().await;
                        continue;
                    }
                };

                for entry in listing.entries {
                    let mut tracker = committer.lock().await;
                    if !tracker.index_key_to_marker(&entry.entry.key, &entry.log_id) {
                        tracing::debug!(
                            "skipping entry {}: sync already in progress for bucket shard {}",
                            entry.log_id,
                            entry.entry.key
                        );
                        continue;
                    }
                    tracker.start(entry.log_id.clone(), 0, entry.log_timestamp);
                    drop(tracker);

                    children.spawn(sync_single_entry(
                        self.deps.clone(),
                        self.source_zone.clone(),
                        entry.entry.key,
                        Some(entry.log_id),
                        committer.clone(),
                    ));
                }
                self.marker.marker = listing.marker;
            } else {
                self.idle_wait().await;
            }
        }
    }

    /// Sleep out the idle interval unless a wake-up lands first.
    async fn idle_wait(&self) {
        tokio::select! {
            _ = tokio::time::sleep(INCREMENTAL_INTERVAL) => {}
            _ = self.handle.wake.notified() => {
                tracing::debug!("shard {} woken up", self.shard_id);
            }
        }
    }

    /// A malformed datalog key is fatal for the shard; every other entry
    /// failure is logged and retried by a later pass.
    fn surface_errors(&self, errors: &mut Vec<DriftError>) -> Result<()> {
        let mut fatal = None;
        for error in errors.drain(..) {
            if fatal.is_none() && matches!(error, DriftError::InvalidEntry(_)) {
                fatal = Some(error);
            } else {
                tracing::error!(
                    "shard {} sync entry failed (will retry on a later pass): {}",
                    self.shard_id,
                    error
                );
            }
        }
        match fatal {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Sync one raw datalog key through the bucket layer, repeating while
/// another entry for the same bucket shard flagged it for retry, then
/// finish the datalog marker.
async fn sync_single_entry(
    deps: SyncDeps,
    source_zone: String,
    raw_key: String,
    entry_marker: Option<String>,
    committer: ShardCommitter,
) -> Result<()> {
    let bucket = parse_bucket_shard(&raw_key)?;

    loop {
        committer.lock().await.reset_need_retry(&raw_key);

        BucketShardSync::new(deps.clone(), source_zone.clone(), bucket.clone())
            .run()
            .await?;

        if !committer.lock().await.need_retry(&raw_key) {
            break;
        }
        tracing::debug!(
            "re-running bucket shard sync for {}: entries arrived while in flight",
            raw_key
        );
    }

    if let Some(marker) = entry_marker {
        committer.lock().await.finish(&marker).await?;
    }
    Ok(())
}

/// Driver for one source zone.
pub struct ZoneDataSync {
    deps: SyncDeps,
    source_zone: String,
    shards: RwLock<HashMap<u32, Arc<ShardHandle>>>,
}

impl ZoneDataSync {
    pub fn new(deps: SyncDeps, source_zone: impl Into<String>) -> Self {
        Self {
            deps,
            source_zone: source_zone.into(),
            shards: RwLock::new(HashMap::new()),
        }
    }

    pub fn source_zone(&self) -> &str {
        &self.source_zone
    }

    /// Read the zone record and its per-shard markers. `None` means the
    /// zone was never initialized.
    pub async fn read_sync_status(
        &self,
    ) -> Result<Option<(ZoneSyncInfo, HashMap<u32, DataShardMarker>)>> {
        let Some(info) = self.deps.status.read_zone_info(&self.source_zone).await? else {
            return Ok(None);
        };

        let reads = (0..info.num_shards).map(|shard_id| {
            let status = self.deps.status.clone();
            let source_zone = self.source_zone.clone();
            async move {
                let marker = status.read_shard_marker(&source_zone, shard_id).await;
                (shard_id, marker)
            }
        });

        let mut markers = HashMap::new();
        for (shard_id, marker) in join_all(reads).await {
            markers.insert(shard_id, marker?.unwrap_or_default());
        }
        Ok(Some((info, markers)))
    }

    /// Run the zone forever: initialize on first contact, build the
    /// full-sync maps, then pump every datalog shard.
    pub async fn run(&self) -> Result<()> {
        let markers = self.bootstrap().await?;
        self.run_shards(markers).await
    }

    /// Bring the persisted zone state up to `Sync` and return the shard
    /// markers to pump from.
    pub(crate) async fn bootstrap(&self) -> Result<HashMap<u32, DataShardMarker>> {
        let datalog_info = self.deps.remote.datalog_info().await?;
        tracing::debug!(
            "remote datalog for zone {}: num_shards={}",
            self.source_zone,
            datalog_info.num_shards
        );

        let (mut info, mut markers) = match self.read_sync_status().await? {
            Some(state) => state,
            None => {
                tracing::info!(
                    "no sync status for zone {}, initializing",
                    self.source_zone
                );
                self.init_sync_status(datalog_info.num_shards).await?
            }
        };

        if info.state == ZoneSyncState::Init {
            // A previous init never completed; redo it from the top.
            let (new_info, new_markers) = self.init_sync_status(info.num_shards).await?;
            info = new_info;
            markers = new_markers;
        }

        if info.state == ZoneSyncState::BuildingFullSyncMaps {
            tracing::info!("building full sync maps for zone {}", self.source_zone);
            self.build_full_sync_maps(&info, &mut markers).await?;

            info.state = ZoneSyncState::Sync;
            self.deps
                .status
                .write_zone_info(&self.source_zone, &info)
                .await?;
        }

        Ok(markers)
    }

    async fn run_shards(&self, markers: HashMap<u32, DataShardMarker>) -> Result<()> {
        let mut children = ChildSet::new();

        {
            let mut shards = self.shards.write().unwrap();
            for (shard_id, marker) in markers {
                let handle = Arc::new(ShardHandle::new());
                shards.insert(shard_id, handle.clone());

                let shard = DataShardSync::new(
                    self.deps.clone(),
                    self.source_zone.clone(),
                    shard_id,
                    marker,
                    handle,
                );
                children.spawn(async move { shard.run().await });
            }
        }

        // Shard pumps only return on fatal errors; one shard dying does not
        // take its peers down.
        while let Some(result) = children.wait_for_child().await {
            if let Err(error) = result {
                tracing::error!(
                    "datalog shard sync for zone {} terminated: {}",
                    self.source_zone,
                    error
                );
            }
        }

        Err(DriftError::Internal(format!(
            "all datalog shard syncs for zone {} terminated",
            self.source_zone
        )))
    }

    /// Notification from the local write path that `keys` have new entries
    /// on the source side. Unknown shard ids are dropped; the log tail will
    /// pick the change up anyway.
    pub fn wakeup(&self, shard_id: u32, keys: impl IntoIterator<Item = String>) {
        let shards = self.shards.read().unwrap();
        let Some(handle) = shards.get(&shard_id) else {
            return;
        };
        handle.append_modified(keys);
        handle.wake.notify_one();
    }

    /// Create the zone record and per-shard markers under the status lock,
    /// capturing every shard's current remote head as the position
    /// incremental sync will later start from.
    pub(crate) async fn init_sync_status(
        &self,
        num_shards: u32,
    ) -> Result<(ZoneSyncInfo, HashMap<u32, DataShardMarker>)> {
        let status_oid = zone_status_oid(&self.source_zone);
        let cookie = generate_lock_cookie();

        let mut info = ZoneSyncInfo {
            num_shards,
            state: ZoneSyncState::Init,
            instance_id: generate_instance_id(),
        };

        self.deps.status.lock_status(&status_oid, &cookie).await?;
        self.deps
            .status
            .write_zone_info(&self.source_zone, &info)
            .await?;
        // The write recreated the object; the lock has to be taken again.
        self.deps.status.lock_status(&status_oid, &cookie).await?;

        let heads = join_all((0..num_shards).map(|shard_id| {
            let remote = self.deps.remote.clone();
            async move { (shard_id, remote.datalog_shard_info(shard_id).await) }
        }))
        .await;

        let mut markers = HashMap::new();
        for (shard_id, head) in heads {
            let head = head?;
            let marker = DataShardMarker {
                next_step_marker: head.marker,
                timestamp: head.last_update,
                ..Default::default()
            };
            self.deps
                .status
                .write_shard_marker(&self.source_zone, shard_id, &marker)
                .await?;
            markers.insert(shard_id, marker);
        }

        info.state = ZoneSyncState::BuildingFullSyncMaps;
        self.deps
            .status
            .write_zone_info(&self.source_zone, &info)
            .await?;
        self.deps.status.unlock_status(&status_oid, &cookie).await?;

        Ok((info, markers))
    }

    /// Enumerate every bucket shard of the source zone into the full-sync
    /// index of the datalog shard that carries its events, then record the
    /// per-shard totals.
    pub(crate) async fn build_full_sync_maps(
        &self,
        info: &ZoneSyncInfo,
        markers: &mut HashMap<u32, DataShardMarker>,
    ) -> Result<()> {
        let instance_keys = self.deps.remote.list_bucket_instances().await?;

        let mut index: HashMap<u32, Vec<(String, Vec<u8>)>> = HashMap::new();
        let mut totals: HashMap<u32, u64> = HashMap::new();

        for instance_key in instance_keys {
            tracing::debug!("list metadata: bucket.instance key={}", instance_key);
            let meta = self.deps.remote.bucket_instance_info(&instance_key).await?;
            let bucket_name = meta.data.bucket_info.bucket.name.clone();
            let bucket_shards = meta.data.bucket_info.num_shards;

            if bucket_shards > 0 {
                for i in 0..bucket_shards {
                    let target = log_shard_id(&bucket_name, i as i32, info.num_shards);
                    index
                        .entry(target)
                        .or_default()
                        .push((format!("{}:{}", instance_key, i), Vec::new()));
                    *totals.entry(target).or_default() += 1;
                }
            } else {
                let target = log_shard_id(&bucket_name, -1, info.num_shards);
                index
                    .entry(target)
                    .or_default()
                    .push((instance_key.clone(), Vec::new()));
                *totals.entry(target).or_default() += 1;
            }
        }

        for (shard_id, entries) in index {
            self.deps
                .status
                .raw()
                .omap_set(&full_sync_index_oid(&self.source_zone, shard_id), entries)
                .await?;
        }

        for (shard_id, marker) in markers.iter_mut() {
            marker.total_entries = totals.get(shard_id).copied().unwrap_or(0);
            self.deps
                .status
                .write_shard_marker(&self.source_zone, *shard_id, marker)
                .await?;
        }

        Ok(())
    }
}
