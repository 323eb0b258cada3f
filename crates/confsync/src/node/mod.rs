//! Node volume lifecycle.
//!
//! [`VolumeManager`] drives stage, unstage, publish and unpublish. Each call
//! holds one lock over the persisted store and the worker supervisor for its
//! whole duration, so the idempotence checks and the mutations they guard
//! are atomic with respect to other requests.
//!
//! Every operation may be retried with the same arguments and succeeds
//! without side effects once its outcome is already in place. A retry with
//! different arguments against committed state returns
//! [`ConfsyncError::Conflict`].

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use confsync_common::{ConfsyncError, ConfsyncResult};

use crate::filesystem::{self, MountOps, Unmounted};
use crate::state::{StateStore, VolumeRecord};
use crate::volume::{VolumeCapability, read_volume_capability, read_volume_context};
use crate::worker::{LaunchMode, Supervisor, WorkerFactory};

/// Node plugin settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identifier reported to the orchestrator.
    pub node_id: String,
    /// Location of the persisted state document.
    pub state_file: PathBuf,
    /// Accept single-node-writer capabilities.
    pub allow_single_writer: bool,
}

/// Stage request.
#[derive(Clone, Default)]
pub struct StageVolume {
    /// Volume ID.
    pub volume_id: String,
    /// Directory the volume is synchronized into.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: Option<VolumeCapability>,
    /// Volume context as returned by volume creation.
    pub volume_context: HashMap<String, String>,
    /// Source credentials.
    pub secrets: HashMap<String, String>,
}

/// Unstage request.
#[derive(Debug, Clone, Default)]
pub struct UnstageVolume {
    /// Volume ID.
    pub volume_id: String,
    /// Staging directory to release.
    pub staging_target_path: String,
}

/// Publish request.
#[derive(Debug, Clone, Default)]
pub struct PublishVolume {
    /// Volume ID.
    pub volume_id: String,
    /// Where the volume should appear.
    pub target_path: String,
    /// Staging directory the volume was staged to.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: Option<VolumeCapability>,
}

/// Unpublish request.
#[derive(Debug, Clone, Default)]
pub struct UnpublishVolume {
    /// Volume ID.
    pub volume_id: String,
    /// Target path to release.
    pub target_path: String,
}

#[derive(Debug)]
struct NodeState {
    store: StateStore,
    workers: Supervisor,
}

/// Owns the persisted volume state and the running workers.
pub struct VolumeManager {
    config: NodeConfig,
    mounts: Arc<dyn MountOps>,
    state: Mutex<NodeState>,
}

impl VolumeManager {
    /// Open the state file and build a manager. No worker is started;
    /// call [`VolumeManager::recover`] for that.
    pub fn new(
        config: NodeConfig,
        mounts: Arc<dyn MountOps>,
        factory: Arc<dyn WorkerFactory>,
    ) -> ConfsyncResult<Self> {
        let store = StateStore::open(&config.state_file)?;
        Ok(Self {
            config,
            mounts,
            state: Mutex::new(NodeState {
                store,
                workers: Supervisor::new(factory),
            }),
        })
    }

    /// Node settings.
    #[must_use]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Relaunch workers for every persisted volume whose staging directory
    /// still exists. Returns the number of workers started.
    ///
    /// Records whose directory is gone are kept but left without a worker.
    pub async fn recover(&self) -> usize {
        let mut state = self.state.lock().await;
        let NodeState { store, workers } = &mut *state;

        let mut launched = 0;
        for (volume_id, record) in store.volumes() {
            if !record.data_dir.exists() {
                tracing::warn!(
                    volume_id,
                    data_dir = %record.data_dir.display(),
                    "Staging directory is gone, not restoring worker"
                );
                continue;
            }
            match workers.launch(volume_id, record, LaunchMode::Restore).await {
                Ok(()) => launched += 1,
                Err(e) => tracing::error!(volume_id, error = %e, "Failed to restore worker"),
            }
        }

        tracing::info!(
            volumes = store.len(),
            workers = launched,
            "Recovered node state"
        );
        launched
    }

    /// Stage a volume: create its directory, start its worker, persist it.
    pub async fn stage_volume(&self, req: StageVolume) -> ConfsyncResult<()> {
        tracing::debug!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeStageVolume"
        );

        require(&req.volume_id, "VolumeId missing in request")?;
        require(&req.staging_target_path, "StagingTargetPath missing in request")?;
        let capability = read_volume_capability(
            req.volume_capability.as_ref(),
            self.config.allow_single_writer,
        )?;
        let context = read_volume_context(&req.volume_context)?;
        let staging = Path::new(&req.staging_target_path);

        let mut state = self.state.lock().await;

        if let Some(record) = state.store.get(&req.volume_id) {
            if record.data_dir == staging {
                return Ok(());
            }
            return Err(ConfsyncError::conflict(
                "volume is already staged to another StagingTargetPath",
            ));
        }

        let recorded_owner = state
            .store
            .volumes()
            .iter()
            .find(|(_, record)| record.data_dir == staging)
            .map(|(volume_id, _)| volume_id.as_str());
        if let Some(owner) = state.workers.owner(staging).or(recorded_owner) {
            tracing::debug!(owner, "Staging path is in use");
            return Err(ConfsyncError::conflict(
                "another volume is already staged to requested StagingTargetPath",
            ));
        }

        filesystem::create_dir_all_with_mode(staging, capability.mode)
            .map_err(internal("failed to mkdir StagingTargetPath"))?;

        let record = VolumeRecord::new(staging, &context, &req.secrets);
        if let Err(e) = state
            .workers
            .launch(&req.volume_id, &record, LaunchMode::Stage)
            .await
        {
            tracing::error!(volume_id = %req.volume_id, error = %e, "Failed to start worker");
            return Err(ConfsyncError::internal("failed to start worker"));
        }

        if let Err(e) = state.store.insert(req.volume_id.clone(), record) {
            tracing::error!(volume_id = %req.volume_id, error = %e, "Failed to save state");
            state.workers.stop(staging).await;
            return Err(ConfsyncError::internal("failed to save state"));
        }

        Ok(())
    }

    /// Unstage a volume: stop its worker, remove its directory, forget it.
    ///
    /// Unknown volumes, or a staging path other than the recorded one, are
    /// treated as already unstaged.
    pub async fn unstage_volume(&self, req: UnstageVolume) -> ConfsyncResult<()> {
        tracing::debug!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeUnstageVolume"
        );

        require(&req.volume_id, "VolumeId missing in request")?;
        require(&req.staging_target_path, "StagingTargetPath missing in request")?;
        let staging = Path::new(&req.staging_target_path);

        let mut state = self.state.lock().await;

        match state.store.get(&req.volume_id) {
            Some(record) if record.data_dir == staging => {}
            _ => return Ok(()),
        }

        let other_owner = state
            .workers
            .owner(staging)
            .filter(|owner| *owner != req.volume_id)
            .map(str::to_owned);
        if let Some(owner) = other_owner {
            tracing::warn!(
                volume_id = %req.volume_id,
                owner = %owner,
                "Staging path is held by another volume, leaving it in place"
            );
        } else {
            state.workers.stop(staging).await;
            filesystem::remove_dir_all_if_exists(staging)
                .map_err(internal("failed to remove StagingTargetPath"))?;
        }

        state
            .store
            .remove(&req.volume_id)
            .map_err(internal("failed to save state"))?;

        Ok(())
    }

    /// Publish a staged volume at its target path as a read-only bind mount.
    pub async fn publish_volume(&self, req: PublishVolume) -> ConfsyncResult<()> {
        tracing::debug!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            staging_target_path = %req.staging_target_path,
            "NodePublishVolume"
        );

        require(&req.volume_id, "VolumeId missing in request")?;
        require(&req.target_path, "TargetPath missing in request")?;
        read_volume_capability(
            req.volume_capability.as_ref(),
            self.config.allow_single_writer,
        )?;
        if req.staging_target_path.is_empty() {
            return Err(ConfsyncError::FailedPrecondition {
                message: "StagingTargetPath missing in request".to_string(),
            });
        }
        let staging = Path::new(&req.staging_target_path);
        let target = Path::new(&req.target_path);

        let state = self.state.lock().await;

        match state.store.get(&req.volume_id) {
            None => {
                return Err(ConfsyncError::NotFound {
                    message: "unknown VolumeId".to_string(),
                });
            }
            Some(record) if record.data_dir != staging => {
                return Err(ConfsyncError::invalid_argument(
                    "incompatible VolumeId and StagingTargetPath",
                ));
            }
            Some(_) => {}
        }

        let table = self
            .mounts
            .read_mount_table()
            .map_err(internal("failed to read mountinfo"))?;
        if let Some(mount) = table.get_by_mount_point(&req.target_path) {
            if table.verify_mount_source(mount, &req.staging_target_path) {
                return Ok(());
            }
            tracing::warn!(
                target_path = %req.target_path,
                mount_id = %mount.id,
                "Target path is mounted from another source"
            );
            return Err(ConfsyncError::conflict("incompatible StagingTargetPath"));
        }

        filesystem::create_dir_all_with_mode(target, None)
            .map_err(internal("failed to mkdir TargetPath"))?;
        if let Err(e) = self.mounts.bind_mount_readonly(staging, target) {
            tracing::error!(target_path = %req.target_path, error = %e, "failed to mount");
            // A bind that succeeded before the read-only remount failed must
            // not be found by a retry.
            if let Err(e) = self.mounts.unmount(target) {
                tracing::error!(target_path = %req.target_path, error = %e, "failed to roll back mount");
            }
            return Err(ConfsyncError::internal("failed to mount"));
        }

        Ok(())
    }

    /// Unmount and remove a target path. Missing mounts and paths are fine.
    pub async fn unpublish_volume(&self, req: UnpublishVolume) -> ConfsyncResult<()> {
        tracing::debug!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume"
        );

        require(&req.volume_id, "VolumeId missing in request")?;
        require(&req.target_path, "TargetPath missing in request")?;
        let target = Path::new(&req.target_path);

        let _state = self.state.lock().await;

        if self.mounts.unmount(target).map_err(internal("failed to unmount"))?
            == Unmounted::NotMounted
        {
            tracing::debug!(target_path = %req.target_path, "Target path was not mounted");
        }

        filesystem::remove_dir_all_if_exists(target)
            .map_err(internal("failed to remove TargetPath"))?;

        Ok(())
    }

    /// Stop every worker and wait for all of them.
    pub async fn stop_all(&self) {
        self.state.lock().await.workers.stop_all().await;
    }

    /// Persisted record for a volume.
    pub async fn record(&self, volume_id: &str) -> Option<VolumeRecord> {
        self.state.lock().await.store.get(volume_id).cloned()
    }

    /// Staging directories with a running worker.
    pub async fn running_workers(&self) -> Vec<PathBuf> {
        self.state.lock().await.workers.running()
    }
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn require(value: &str, message: &str) -> ConfsyncResult<()> {
    if value.is_empty() {
        Err(ConfsyncError::invalid_argument(message))
    } else {
        Ok(())
    }
}

/// Log `err` and replace it with a fixed caller-facing message.
fn internal<E: Display>(message: &'static str) -> impl FnOnce(E) -> ConfsyncError {
    move |err| {
        tracing::error!(error = %err, "{message}");
        ConfsyncError::internal(message)
    }
}
