//! Standard filesystem paths for confsync.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default directory for node plugin state.
pub static CONFSYNC_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CONFSYNC_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/confsync-csi"))
});

/// Default CSI endpoint.
pub const DEFAULT_ENDPOINT: &str = "unix:///csi/csi.sock";

/// Standard paths used by the node plugin.
#[derive(Debug, Clone)]
pub struct ConfsyncPaths {
    /// State directory (default: /var/lib/confsync-csi).
    pub root: PathBuf,
}

impl ConfsyncPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom state directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Persisted volume state document.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }
}

impl Default for ConfsyncPaths {
    fn default() -> Self {
        Self {
            root: CONFSYNC_STATE_DIR.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = ConfsyncPaths::with_root("/tmp/confsync-test");
        assert_eq!(
            paths.state_file(),
            PathBuf::from("/tmp/confsync-test/state.json")
        );
    }
}
