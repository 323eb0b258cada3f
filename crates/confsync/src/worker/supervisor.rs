//! One worker per staging directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use confsync_common::{ConfsyncError, ConfsyncResult};

use super::{LaunchMode, WorkerFactory};
use crate::state::VolumeRecord;

/// Bookkeeping for a launched worker.
#[derive(Debug)]
struct WorkerHandle {
    volume_id: String,
    stop: CancellationToken,
    /// Cancelled when the run loop has exited, including by panic.
    done: CancellationToken,
}

impl WorkerHandle {
    fn is_running(&self) -> bool {
        !self.done.is_cancelled()
    }
}

/// Owns the running workers, keyed by staging directory.
///
/// Handles whose run loop has already exited are treated as absent and
/// dropped on the next mutation.
pub struct Supervisor {
    factory: Arc<dyn WorkerFactory>,
    workers: HashMap<PathBuf, WorkerHandle>,
}

impl Supervisor {
    /// Create an empty supervisor.
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            workers: HashMap::new(),
        }
    }

    /// Whether a worker is running against `data_dir`.
    #[must_use]
    pub fn is_running(&self, data_dir: &Path) -> bool {
        self.workers.get(data_dir).is_some_and(WorkerHandle::is_running)
    }

    /// Volume ID of the worker running against `data_dir`.
    #[must_use]
    pub fn owner(&self, data_dir: &Path) -> Option<&str> {
        self.workers
            .get(data_dir)
            .filter(|h| h.is_running())
            .map(|h| h.volume_id.as_str())
    }

    /// Number of running workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.values().filter(|h| h.is_running()).count()
    }

    /// Whether no worker is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Staging directories with a running worker.
    #[must_use]
    pub fn running(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<_> = self
            .workers
            .iter()
            .filter(|(_, h)| h.is_running())
            .map(|(dir, _)| dir.clone())
            .collect();
        dirs.sort();
        dirs
    }

    /// Create a worker for `record`, run its first sync and start its loop.
    ///
    /// In [`LaunchMode::Stage`] a failed first sync is returned and nothing
    /// is registered. In [`LaunchMode::Restore`] it is only logged.
    pub async fn launch(
        &mut self,
        volume_id: &str,
        record: &VolumeRecord,
        mode: LaunchMode,
    ) -> ConfsyncResult<()> {
        self.reap();

        if let Some(owner) = self.owner(&record.data_dir) {
            return Err(ConfsyncError::conflict(format!(
                "a worker for volume {owner} is already running"
            )));
        }

        let worker = self.factory.create(record)?;

        if let Err(e) = worker.sync_once().await {
            match mode {
                LaunchMode::Stage => return Err(e),
                LaunchMode::Restore => tracing::warn!(
                    volume_id,
                    data_dir = %record.data_dir.display(),
                    error = %e,
                    "Initial sync failed, worker will keep retrying"
                ),
            }
        }

        let stop = CancellationToken::new();
        let done = CancellationToken::new();
        let guard = done.clone().drop_guard();
        let task_stop = stop.clone();
        let task_volume = volume_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            worker.run(task_stop).await;
            tracing::debug!(volume_id = %task_volume, "Worker loop exited");
        });

        tracing::info!(
            volume_id,
            data_dir = %record.data_dir.display(),
            ?mode,
            "Started worker"
        );

        self.workers.insert(
            record.data_dir.clone(),
            WorkerHandle {
                volume_id: volume_id.to_string(),
                stop,
                done,
            },
        );
        Ok(())
    }

    /// Stop the worker at `data_dir` and wait for its loop to exit.
    ///
    /// Returns whether a worker was registered there.
    pub async fn stop(&mut self, data_dir: &Path) -> bool {
        self.reap();

        let Some(handle) = self.workers.remove(data_dir) else {
            return false;
        };

        tracing::info!(
            volume_id = %handle.volume_id,
            data_dir = %data_dir.display(),
            "Stopping worker"
        );
        handle.stop.cancel();
        handle.done.cancelled().await;
        true
    }

    /// Stop every worker.
    ///
    /// All workers are signalled before any is waited on, so this takes as
    /// long as the slowest worker.
    pub async fn stop_all(&mut self) {
        let handles: Vec<_> = self.workers.drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }

        tracing::info!(count = handles.len(), "Stopping all workers");
        for handle in &handles {
            handle.stop.cancel();
        }
        for handle in handles {
            handle.done.cancelled().await;
        }
    }

    fn reap(&mut self) {
        self.workers.retain(|_, h| h.is_running());
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::SyncWorker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeWorker {
        fail_sync: bool,
        stop_latency: Duration,
        syncs: AtomicUsize,
        exited: AtomicBool,
    }

    #[async_trait]
    impl SyncWorker for FakeWorker {
        async fn sync_once(&self) -> ConfsyncResult<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            if self.fail_sync {
                Err(ConfsyncError::internal("source unreachable"))
            } else {
                Ok(())
            }
        }

        async fn run(&self, stop: CancellationToken) {
            stop.cancelled().await;
            tokio::time::sleep(self.stop_latency).await;
            self.exited.store(true, Ordering::SeqCst);
        }
    }

    struct ExitingWorker;

    #[async_trait]
    impl SyncWorker for ExitingWorker {
        async fn sync_once(&self) -> ConfsyncResult<()> {
            Ok(())
        }

        async fn run(&self, _stop: CancellationToken) {}
    }

    fn record(dir: &str) -> VolumeRecord {
        VolumeRecord {
            data_dir: PathBuf::from(dir),
            uri: "u".into(),
            username: String::new(),
            password: String::new(),
            update_interval: None,
            variables: std::collections::BTreeMap::new(),
        }
    }

    fn supervisor_for(worker: Arc<FakeWorker>) -> Supervisor {
        Supervisor::new(Arc::new(move |_: &VolumeRecord| -> ConfsyncResult<Arc<dyn SyncWorker>> {
            Ok(Arc::clone(&worker) as Arc<dyn SyncWorker>)
        }))
    }

    #[tokio::test]
    async fn launch_and_stop() {
        let worker = Arc::new(FakeWorker::default());
        let mut supervisor = supervisor_for(Arc::clone(&worker));

        supervisor
            .launch("v1", &record("/stage/v1"), LaunchMode::Stage)
            .await
            .unwrap();
        assert!(supervisor.is_running(Path::new("/stage/v1")));
        assert_eq!(supervisor.owner(Path::new("/stage/v1")), Some("v1"));
        assert_eq!(worker.syncs.load(Ordering::SeqCst), 1);

        assert!(supervisor.stop(Path::new("/stage/v1")).await);
        assert!(worker.exited.load(Ordering::SeqCst));
        assert!(supervisor.is_empty());
        assert!(!supervisor.stop(Path::new("/stage/v1")).await);
    }

    #[tokio::test]
    async fn failed_first_sync_aborts_stage() {
        let worker = Arc::new(FakeWorker {
            fail_sync: true,
            ..FakeWorker::default()
        });
        let mut supervisor = supervisor_for(worker);

        let result = supervisor
            .launch("v1", &record("/stage/v1"), LaunchMode::Stage)
            .await;
        assert!(result.is_err());
        assert!(supervisor.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn failed_first_sync_is_tolerated_on_restore() {
        let worker = Arc::new(FakeWorker {
            fail_sync: true,
            ..FakeWorker::default()
        });
        let mut supervisor = supervisor_for(worker);

        supervisor
            .launch("v1", &record("/stage/v1"), LaunchMode::Restore)
            .await
            .unwrap();
        assert!(supervisor.is_running(Path::new("/stage/v1")));
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn second_worker_on_same_directory_conflicts() {
        let worker = Arc::new(FakeWorker::default());
        let mut supervisor = supervisor_for(worker);

        supervisor
            .launch("v1", &record("/stage/shared"), LaunchMode::Stage)
            .await
            .unwrap();
        let err = supervisor
            .launch("v2", &record("/stage/shared"), LaunchMode::Stage)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfsyncError::Conflict { .. }));
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn exited_workers_are_not_running() {
        let mut supervisor = Supervisor::new(Arc::new(|_: &VolumeRecord| -> ConfsyncResult<Arc<dyn SyncWorker>> {
            Ok(Arc::new(ExitingWorker) as Arc<dyn SyncWorker>)
        }));
        supervisor
            .launch("v1", &record("/stage/v1"), LaunchMode::Stage)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while supervisor.is_running(Path::new("/stage/v1")) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // The directory is free again.
        supervisor
            .launch("v2", &record("/stage/v1"), LaunchMode::Stage)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_all_waits_for_every_worker() {
        let workers: Vec<_> = [100, 400, 200]
            .into_iter()
            .map(|ms| {
                Arc::new(FakeWorker {
                    stop_latency: Duration::from_millis(ms),
                    ..FakeWorker::default()
                })
            })
            .collect();

        let pool = workers.clone();
        let mut supervisor = Supervisor::new(Arc::new(move |record: &VolumeRecord| -> ConfsyncResult<Arc<dyn SyncWorker>> {
            let index = match record.data_dir.to_str() {
                Some("/stage/0") => 0,
                Some("/stage/1") => 1,
                _ => 2,
            };
            Ok(Arc::clone(&pool[index]) as Arc<dyn SyncWorker>)
        }));

        for i in 0..3 {
            supervisor
                .launch(&format!("v{i}"), &record(&format!("/stage/{i}")), LaunchMode::Stage)
                .await
                .unwrap();
        }
        assert_eq!(supervisor.len(), 3);

        let started = tokio::time::Instant::now();
        supervisor.stop_all().await;
        let elapsed = started.elapsed();

        assert!(workers.iter().all(|w| w.exited.load(Ordering::SeqCst)));
        assert!(supervisor.is_empty());
        // Signalled together: bounded by the slowest, not the sum.
        assert!(elapsed < Duration::from_millis(650), "took {elapsed:?}");
    }
}
