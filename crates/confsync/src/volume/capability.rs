//! Volume capability validation.

use confsync_common::{ConfsyncError, ConfsyncResult};

/// Filesystem type accepted besides the empty string.
///
/// External provisioners fill this in by default even though the volume is
/// never formatted.
pub const ACCEPTED_FS_TYPE: &str = "ext4";

/// Mount flag prefix carrying an octal directory mode.
const MODE_FLAG_PREFIX: &str = "mode=";

/// Largest mode accepted: permission bits plus setuid, setgid and sticky.
const MAX_MODE: u32 = 0o7777;

/// How a volume may be accessed across nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Not specified.
    Unknown,
    /// One node, read-write.
    SingleNodeWriter,
    /// One node, read-only.
    SingleNodeReaderOnly,
    /// Many nodes, read-only.
    MultiNodeReaderOnly,
    /// Many nodes, one writer.
    MultiNodeSingleWriter,
    /// Many nodes, many writers.
    MultiNodeMultiWriter,
}

/// How the volume is presented to the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessType {
    /// Raw block device.
    Block,
    /// Mounted filesystem.
    Mount {
        /// Requested filesystem type, possibly empty.
        fs_type: String,
        /// Extra mount flags.
        mount_flags: Vec<String>,
    },
}

/// A requested volume capability, decoupled from any wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Requested access type, if any.
    pub access_type: Option<AccessType>,
}

impl VolumeCapability {
    /// A filesystem capability with the given mode and mount flags.
    #[must_use]
    pub fn mount(access_mode: AccessMode, mount_flags: Vec<String>) -> Self {
        Self {
            access_mode,
            access_type: Some(AccessType::Mount {
                fs_type: String::new(),
                mount_flags,
            }),
        }
    }
}

/// The parts of a capability the node acts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountCapability {
    /// Mode to apply to the staging directory.
    pub mode: Option<u32>,
}

impl MountCapability {
    /// Whether the staging directory needs an explicit chmod.
    #[must_use]
    pub const fn requires_chmod(&self) -> bool {
        self.mode.is_some()
    }
}

/// Validate a requested capability.
///
/// Only read-only access modes are accepted; `allow_single_writer` also
/// admits [`AccessMode::SingleNodeWriter`], which conformance suites request.
pub fn read_volume_capability(
    capability: Option<&VolumeCapability>,
    allow_single_writer: bool,
) -> ConfsyncResult<MountCapability> {
    let capability = capability
        .ok_or_else(|| ConfsyncError::invalid_argument("VolumeCapability missing in request"))?;

    match capability.access_mode {
        AccessMode::SingleNodeReaderOnly | AccessMode::MultiNodeReaderOnly => {}
        AccessMode::SingleNodeWriter if allow_single_writer => {}
        _ => return Err(ConfsyncError::invalid_argument("unsupported access mode")),
    }

    let Some(AccessType::Mount {
        fs_type,
        mount_flags,
    }) = &capability.access_type
    else {
        return Err(ConfsyncError::invalid_argument("AccessType must be mount"));
    };

    if !fs_type.is_empty() && fs_type != ACCEPTED_FS_TYPE {
        return Err(ConfsyncError::invalid_argument("unsupported filesystem type"));
    }

    let mut parsed = MountCapability::default();
    for flag in mount_flags {
        if let Some(value) = flag.strip_prefix(MODE_FLAG_PREFIX) {
            parsed.mode = Some(parse_mode(value)?);
        }
    }
    Ok(parsed)
}

fn parse_mode(value: &str) -> ConfsyncResult<u32> {
    match u32::from_str_radix(value, 8) {
        Ok(mode) if mode <= MAX_MODE => Ok(mode),
        result => {
            tracing::error!(value, ?result, "Failed to parse mode mount flag");
            Err(ConfsyncError::invalid_argument("invalid mount flags"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount_cap(mode: AccessMode, flags: &[&str]) -> VolumeCapability {
        VolumeCapability::mount(mode, flags.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn reader_modes_are_accepted() {
        for mode in [
            AccessMode::SingleNodeReaderOnly,
            AccessMode::MultiNodeReaderOnly,
        ] {
            let parsed = read_volume_capability(Some(&mount_cap(mode, &[])), false).unwrap();
            assert!(!parsed.requires_chmod());
        }
    }

    #[test]
    fn single_writer_needs_opt_in() {
        let cap = mount_cap(AccessMode::SingleNodeWriter, &[]);
        let err = read_volume_capability(Some(&cap), false).unwrap_err();
        assert_eq!(err.to_string(), "unsupported access mode");
        assert!(read_volume_capability(Some(&cap), true).is_ok());
    }

    #[test]
    fn writer_modes_are_rejected() {
        for mode in [
            AccessMode::Unknown,
            AccessMode::MultiNodeSingleWriter,
            AccessMode::MultiNodeMultiWriter,
        ] {
            assert!(read_volume_capability(Some(&mount_cap(mode, &[])), true).is_err());
        }
    }

    #[test]
    fn missing_capability() {
        let err = read_volume_capability(None, false).unwrap_err();
        assert_eq!(err.to_string(), "VolumeCapability missing in request");
    }

    #[test]
    fn block_access_is_rejected() {
        let cap = VolumeCapability {
            access_mode: AccessMode::MultiNodeReaderOnly,
            access_type: Some(AccessType::Block),
        };
        let err = read_volume_capability(Some(&cap), false).unwrap_err();
        assert_eq!(err.to_string(), "AccessType must be mount");

        let cap = VolumeCapability {
            access_mode: AccessMode::MultiNodeReaderOnly,
            access_type: None,
        };
        assert!(read_volume_capability(Some(&cap), false).is_err());
    }

    #[test]
    fn filesystem_type() {
        let mut cap = mount_cap(AccessMode::MultiNodeReaderOnly, &[]);
        cap.access_type = Some(AccessType::Mount {
            fs_type: ACCEPTED_FS_TYPE.to_string(),
            mount_flags: Vec::new(),
        });
        assert!(read_volume_capability(Some(&cap), false).is_ok());

        cap.access_type = Some(AccessType::Mount {
            fs_type: "xfs".to_string(),
            mount_flags: Vec::new(),
        });
        let err = read_volume_capability(Some(&cap), false).unwrap_err();
        assert_eq!(err.to_string(), "unsupported filesystem type");
    }

    #[test]
    fn mode_flag_is_octal() {
        let cap = mount_cap(AccessMode::MultiNodeReaderOnly, &["noatime", "mode=0750"]);
        let parsed = read_volume_capability(Some(&cap), false).unwrap();
        assert!(parsed.requires_chmod());
        assert_eq!(parsed.mode, Some(0o750));

        let cap = mount_cap(AccessMode::MultiNodeReaderOnly, &["mode=7777"]);
        assert_eq!(
            read_volume_capability(Some(&cap), false).unwrap().mode,
            Some(0o7777)
        );
    }

    #[test]
    fn bad_mode_flags() {
        for flag in ["mode=", "mode=0999", "mode=17777", "mode=rwx"] {
            let cap = mount_cap(AccessMode::MultiNodeReaderOnly, &[flag]);
            let err = read_volume_capability(Some(&cap), false).unwrap_err();
            assert_eq!(err.to_string(), "invalid mount flags", "flag {flag}");
        }
    }
}
