//! CSI gRPC services.

use confsync::volume::{AccessMode, AccessType, VolumeCapability};
use confsync_common::{ConfsyncError, ErrorClass};
use tonic::Status;

mod controller;
mod identity;
mod node;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;

// Include generated protobuf code
#[allow(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

use csi::volume_capability::{self, access_mode::Mode};

/// Convert a wire capability into the core representation.
pub fn capability_from_wire(cap: &csi::VolumeCapability) -> VolumeCapability {
    let access_mode = match cap.access_mode.as_ref().map(volume_capability::AccessMode::mode) {
        Some(Mode::SingleNodeWriter) => AccessMode::SingleNodeWriter,
        Some(Mode::SingleNodeReaderOnly) => AccessMode::SingleNodeReaderOnly,
        Some(Mode::MultiNodeReaderOnly) => AccessMode::MultiNodeReaderOnly,
        Some(Mode::MultiNodeSingleWriter) => AccessMode::MultiNodeSingleWriter,
        Some(Mode::MultiNodeMultiWriter) => AccessMode::MultiNodeMultiWriter,
        Some(Mode::Unknown) | None => AccessMode::Unknown,
    };

    let access_type = cap.access_type.as_ref().map(|t| match t {
        volume_capability::AccessType::Block(_) => AccessType::Block,
        volume_capability::AccessType::Mount(mount) => AccessType::Mount {
            fs_type: mount.fs_type.clone(),
            mount_flags: mount.mount_flags.clone(),
        },
    });

    VolumeCapability {
        access_mode,
        access_type,
    }
}

/// Map a core error onto a gRPC status.
pub fn to_status(err: ConfsyncError) -> Status {
    let message = err.to_string();
    match err.class() {
        ErrorClass::InvalidArgument => Status::invalid_argument(message),
        ErrorClass::FailedPrecondition => Status::failed_precondition(message),
        ErrorClass::NotFound => Status::not_found(message),
        ErrorClass::AlreadyExists => Status::already_exists(message),
        ErrorClass::Unimplemented => Status::unimplemented(message),
        ErrorClass::Internal => Status::internal(message),
    }
}
