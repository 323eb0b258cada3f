//! Request field parsing for volumes.
//!
//! Capabilities and contexts arrive as loosely typed maps; they are turned
//! into fixed structures here and nowhere else.

mod capability;
mod context;

pub use capability::{
    ACCEPTED_FS_TYPE, AccessMode, AccessType, MountCapability, VolumeCapability,
    read_volume_capability,
};
pub use context::{UPDATE_INTERVAL_KEY, URI_KEY, VolumeContext, read_volume_context};
