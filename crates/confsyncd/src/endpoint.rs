//! CSI listen endpoint.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use confsync_common::{ConfsyncError, ConfsyncResult};

/// Address the gRPC server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket (`unix:///csi/csi.sock`).
    Unix(PathBuf),
    /// TCP address (`tcp://127.0.0.1:10000`).
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = ConfsyncError;

    fn from_str(s: &str) -> ConfsyncResult<Self> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ConfsyncError::Config {
                    message: format!("endpoint {s:?} has no socket path"),
                });
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(ConfsyncError::Config {
                    message: format!("endpoint {s:?} has no address"),
                });
            }
            return Ok(Self::Tcp(addr.to_string()));
        }
        Err(ConfsyncError::Config {
            message: format!("unsupported endpoint {s:?}, expected unix:// or tcp://"),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Remove a socket file left behind by a previous run.
pub fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
