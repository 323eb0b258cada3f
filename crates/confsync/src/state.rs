//! Persisted volume state.
//!
//! The store is a single JSON document mapping volume IDs to the records
//! needed to restart their workers. Every mutation rewrites the whole file
//! through a temporary file and a rename, and the in-memory map only changes
//! once the write has succeeded.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use confsync_common::ConfsyncResult;

use crate::volume::VolumeContext;

/// Secret key carrying the source username.
pub const USERNAME_SECRET: &str = "username";

/// Secret key carrying the source password.
pub const PASSWORD_SECRET: &str = "password";

/// Everything needed to (re)start the worker of a staged volume.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    /// Staging directory the volume is synchronized into.
    pub data_dir: PathBuf,
    /// Configuration source.
    pub uri: String,
    /// Source username.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Source password.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Refresh interval; the worker picks its own default when unset.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub update_interval: Option<Duration>,
    /// Template variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

impl VolumeRecord {
    /// Build a record from a parsed context and the request secrets.
    #[must_use]
    pub fn new(
        data_dir: impl Into<PathBuf>,
        context: &VolumeContext,
        secrets: &HashMap<String, String>,
    ) -> Self {
        let secret = |key: &str| secrets.get(key).cloned().unwrap_or_default();
        Self {
            data_dir: data_dir.into(),
            uri: context.uri.clone(),
            username: secret(USERNAME_SECRET),
            password: secret(PASSWORD_SECRET),
            update_interval: context.update_interval,
            variables: context.variables.clone(),
        }
    }
}

impl fmt::Debug for VolumeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeRecord")
            .field("data_dir", &self.data_dir)
            .field("uri", &self.uri)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("update_interval", &self.update_interval)
            .field("variables", &self.variables)
            .finish()
    }
}

#[derive(Deserialize)]
struct StateDocument {
    #[serde(default)]
    volumes: BTreeMap<String, VolumeRecord>,
}

#[derive(Serialize)]
struct StateDocumentRef<'a> {
    volumes: &'a BTreeMap<String, VolumeRecord>,
}

/// Durable `volume ID -> record` map.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    volumes: BTreeMap<String, VolumeRecord>,
}

impl StateStore {
    /// Load the store at `path`, creating an empty one if the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> ConfsyncResult<Self> {
        let path = path.into();

        if !path.exists() {
            let store = Self {
                path,
                volumes: BTreeMap::new(),
            };
            store.write(&store.volumes)?;
            tracing::info!(path = %store.path.display(), "Initialized empty state");
            return Ok(store);
        }

        let json = std::fs::read_to_string(&path)?;
        let document: StateDocument = serde_json::from_str(&json)?;

        tracing::debug!(
            path = %path.display(),
            volumes = document.volumes.len(),
            "Loaded state"
        );

        Ok(Self {
            path,
            volumes: document.volumes,
        })
    }

    /// Location of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a volume.
    #[must_use]
    pub fn get(&self, volume_id: &str) -> Option<&VolumeRecord> {
        self.volumes.get(volume_id)
    }

    /// All records, ordered by volume ID.
    #[must_use]
    pub const fn volumes(&self) -> &BTreeMap<String, VolumeRecord> {
        &self.volumes
    }

    /// Number of staged volumes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Whether no volume is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Insert or replace a record and persist.
    pub fn insert(&mut self, volume_id: impl Into<String>, record: VolumeRecord) -> ConfsyncResult<()> {
        let mut next = self.volumes.clone();
        next.insert(volume_id.into(), record);
        self.write(&next)?;
        self.volumes = next;
        Ok(())
    }

    /// Remove a record and persist. Returns the removed record, if any.
    pub fn remove(&mut self, volume_id: &str) -> ConfsyncResult<Option<VolumeRecord>> {
        if !self.volumes.contains_key(volume_id) {
            return Ok(None);
        }
        let mut next = self.volumes.clone();
        let removed = next.remove(volume_id);
        self.write(&next)?;
        self.volumes = next;
        Ok(removed)
    }

    fn write(&self, volumes: &BTreeMap<String, VolumeRecord>) -> ConfsyncResult<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let json = serde_json::to_vec_pretty(&StateDocumentRef { volumes })?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        tracing::debug!(
            path = %self.path.display(),
            volumes = volumes.len(),
            "Saved state"
        );
        Ok(())
    }
}
