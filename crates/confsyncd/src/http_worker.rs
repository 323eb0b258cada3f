//! HTTP synchronization worker.
//!
//! Fetches the volume URI, fills in template variables and keeps
//! `<dataDir>/config` up to date.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use confsync::worker::{SyncWorker, WorkerFactory};
use confsync::VolumeRecord;
use confsync_common::{ConfsyncError, ConfsyncResult};

/// Refresh period when the volume does not set one.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// File name the fetched configuration is written to.
pub const CONFIG_FILE: &str = "config";

const CONFIG_FILE_MODE: u32 = 0o644;

/// Creates an [`HttpWorker`] per volume, sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct HttpWorkerFactory {
    client: reqwest::Client,
}

impl HttpWorkerFactory {
    /// Create a factory using `client` for every worker.
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl WorkerFactory for HttpWorkerFactory {
    fn create(&self, record: &VolumeRecord) -> ConfsyncResult<Arc<dyn SyncWorker>> {
        Ok(Arc::new(HttpWorker::new(self.client.clone(), record)?))
    }
}

/// Keeps one staging directory in sync with an HTTP resource.
pub struct HttpWorker {
    client: reqwest::Client,
    uri: reqwest::Url,
    username: String,
    password: String,
    config_path: PathBuf,
    interval: Duration,
    variables: BTreeMap<String, String>,
}

impl HttpWorker {
    /// Build a worker for a persisted volume.
    pub fn new(client: reqwest::Client, record: &VolumeRecord) -> ConfsyncResult<Self> {
        let uri = reqwest::Url::parse(&record.uri)
            .map_err(|e| ConfsyncError::invalid_argument(format!("invalid uri: {e}")))?;
        Ok(Self {
            client,
            uri,
            username: record.username.clone(),
            password: record.password.clone(),
            config_path: record.data_dir.join(CONFIG_FILE),
            interval: record
                .update_interval
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_UPDATE_INTERVAL),
            variables: record.variables.clone(),
        })
    }

    async fn fetch(&self) -> reqwest::Result<String> {
        let mut request = self.client.get(self.uri.clone());
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        request.send().await?.error_for_status()?.text().await
    }
}

#[async_trait]
impl SyncWorker for HttpWorker {
    async fn sync_once(&self) -> ConfsyncResult<()> {
        let body = self.fetch().await.map_err(|e| ConfsyncError::Internal {
            message: format!("failed to fetch {}: {e}", self.uri),
        })?;
        let content = substitute(&body, &self.variables);

        if write_if_changed(&self.config_path, content.as_bytes())? {
            tracing::info!(path = %self.config_path.display(), "Configuration updated");
        }
        Ok(())
    }

    async fn run(&self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                () = stop.cancelled() => break,
                result = self.sync_once() => {
                    if let Err(e) = result {
                        tracing::warn!(
                            path = %self.config_path.display(),
                            error = %e,
                            "Sync failed, retrying next interval"
                        );
                    }
                }
            }
        }

        tracing::debug!(path = %self.config_path.display(), "Worker stopped");
    }
}

/// Replace `${name}` with the value of a known variable.
///
/// Unknown references are left as they are. Substituted values are not
/// scanned again.
fn substitute(body: &str, variables: &BTreeMap<String, String>) -> String {
    if variables.is_empty() {
        return body.to_string();
    }

    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after
            .find('}')
            .and_then(|end| variables.get(&after[..end]).map(|value| (end, value)))
        {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Atomically replace `path` with `contents` unless it already holds them.
/// Returns whether the file was written.
fn write_if_changed(path: &Path, contents: &[u8]) -> std::io::Result<bool> {
    match std::fs::read(path) {
        Ok(existing) if existing == contents => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(CONFIG_FILE_MODE))?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(true)
}
