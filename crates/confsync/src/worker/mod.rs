//! Background synchronization workers.
//!
//! A worker keeps one staging directory in sync with its configuration
//! source. How it fetches data is up to the implementation; the supervisor
//! only needs a first sync, a run loop and a way to stop it.

mod supervisor;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use confsync_common::ConfsyncResult;

use crate::state::VolumeRecord;

pub use supervisor::Supervisor;

/// A per-volume synchronization worker.
#[async_trait]
pub trait SyncWorker: Send + Sync {
    /// Perform a single synchronization pass.
    async fn sync_once(&self) -> ConfsyncResult<()>;

    /// Keep synchronizing until `stop` is cancelled.
    ///
    /// Must return promptly once `stop` fires.
    async fn run(&self, stop: CancellationToken);
}

/// Builds workers from persisted volume records.
pub trait WorkerFactory: Send + Sync {
    /// Create a worker for `record`. The worker must not start syncing yet.
    fn create(&self, record: &VolumeRecord) -> ConfsyncResult<Arc<dyn SyncWorker>>;
}

impl<F> WorkerFactory for F
where
    F: Fn(&VolumeRecord) -> ConfsyncResult<Arc<dyn SyncWorker>> + Send + Sync,
{
    fn create(&self, record: &VolumeRecord) -> ConfsyncResult<Arc<dyn SyncWorker>> {
        self(record)
    }
}

/// Why a worker is being launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Fresh stage request: a failed first sync aborts the launch.
    Stage,
    /// Startup recovery: a failed first sync is logged and the worker keeps
    /// retrying on its own.
    Restore,
}
