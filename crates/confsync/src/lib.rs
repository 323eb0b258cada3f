//! # confsync
//!
//! Node-side volume lifecycle for a CSI plugin that exposes configuration
//! directories kept in sync by a background worker.
//!
//! ## Overview
//!
//! - **Stage** creates the staging directory, runs a first sync and starts a
//!   worker that keeps refreshing it.
//! - **Publish** bind-mounts the staging directory read-only at the target.
//! - **Unpublish** and **Unstage** undo those steps.
//!
//! Staged volumes are persisted so workers can be restored after a restart.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use confsync::filesystem::HostMounts;
//! use confsync::node::{NodeConfig, VolumeManager};
//! use confsync::worker::WorkerFactory;
//!
//! # async fn example(factory: Arc<dyn WorkerFactory>) -> confsync_common::ConfsyncResult<()> {
//! let config = NodeConfig {
//!     node_id: "node-1".to_string(),
//!     state_file: "/var/lib/confsync-csi/state.json".into(),
//!     allow_single_writer: false,
//! };
//! let manager = VolumeManager::new(config, Arc::new(HostMounts), factory)?;
//! manager.recover().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod filesystem;
pub mod mountinfo;
pub mod node;
pub mod state;
pub mod volume;
pub mod worker;

pub use node::{NodeConfig, VolumeManager};
pub use state::{StateStore, VolumeRecord};
pub use worker::{LaunchMode, SyncWorker, WorkerFactory};
