//! Kernel mount table reader.
//!
//! Parses `/proc/self/mountinfo` into [`MountRecord`]s and answers the two
//! questions the lifecycle manager needs: what is mounted at a path, and does
//! that mount trace back to a given source directory.
//!
//! Nothing is cached: every [`MountTable::read`] re-reads the kernel table.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use confsync_common::ConfsyncResult;

/// Location of the calling process' mount table.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Minimum number of space-separated fields in a usable mountinfo line.
const MIN_FIELDS: usize = 5;

/// One line of the mount table, reduced to the fields we need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Mount ID.
    pub id: String,
    /// Backing device (`major:minor`).
    pub device: String,
    /// Root of the mount within the device's filesystem.
    pub root: String,
    /// Mount point relative to the process root.
    pub mount_point: String,
}

impl MountRecord {
    /// Map an absolute path under this mount to its path on the device.
    ///
    /// Bind mounts expose a sub-tree of the device, recorded in `root`, so the
    /// mount point prefix is replaced by that root.
    #[must_use]
    pub fn path_on_device(&self, path: &str) -> String {
        if self.root == self.mount_point {
            path.to_string()
        } else if self.root == "/" {
            let rel = path.strip_prefix(self.mount_point.as_str()).unwrap_or(path);
            if rel.is_empty() {
                "/".to_string()
            } else {
                rel.to_string()
            }
        } else if self.mount_point == "/" {
            format!("{}{}", self.root, path)
        } else {
            let rel = path.strip_prefix(self.mount_point.as_str()).unwrap_or(path);
            format!("{}{}", self.root, rel)
        }
    }
}

/// Snapshot of the kernel mount table, in mount order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    mounts: Vec<MountRecord>,
}

impl MountTable {
    /// Read the current process' mount table.
    pub fn read() -> ConfsyncResult<Self> {
        Self::read_from(MOUNTINFO_PATH)
    }

    /// Read a mount table from a mountinfo-formatted file.
    pub fn read_from(path: impl AsRef<Path>) -> ConfsyncResult<Self> {
        let file = File::open(path)?;
        Ok(Self::parse(BufReader::new(file))?)
    }

    /// Parse mountinfo lines. Lines with too few fields are skipped.
    pub fn parse(reader: impl BufRead) -> std::io::Result<Self> {
        let mut mounts = Vec::new();
        for line in reader.lines() {
            if let Some(record) = parse_line(&line?) {
                mounts.push(record);
            }
        }
        Ok(Self { mounts })
    }

    /// Build a table from already parsed records.
    #[must_use]
    pub fn from_records(mounts: Vec<MountRecord>) -> Self {
        Self { mounts }
    }

    /// All records in mount order.
    #[must_use]
    pub fn records(&self) -> &[MountRecord] {
        &self.mounts
    }

    /// Number of mounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// The most recent mount whose mount point is exactly `mount_point`.
    ///
    /// Later mounts shadow earlier ones at the same path.
    #[must_use]
    pub fn get_by_mount_point(&self, mount_point: &str) -> Option<&MountRecord> {
        self.mounts
            .iter()
            .rev()
            .find(|m| m.mount_point == mount_point)
    }

    /// The most recent mount covering `path`.
    #[must_use]
    pub fn find_by_path(&self, path: &str) -> Option<&MountRecord> {
        self.mounts
            .iter()
            .rev()
            .find(|m| is_path_within(path, &m.mount_point))
    }

    /// Check that `mount` shows the same device location as `source`.
    ///
    /// Used to confirm that a bind mount really originates from `source`
    /// instead of trusting caller-supplied paths.
    #[must_use]
    pub fn verify_mount_source(&self, mount: &MountRecord, source: &str) -> bool {
        self.find_by_path(source).is_some_and(|sm| {
            sm.device == mount.device && sm.path_on_device(source) == mount.root
        })
    }
}

fn parse_line(line: &str) -> Option<MountRecord> {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() < MIN_FIELDS {
        return None;
    }
    Some(MountRecord {
        id: fields[0].to_string(),
        device: fields[2].to_string(),
        root: unescape(fields[3]),
        mount_point: unescape(fields[4]),
    })
}

/// Decode the octal escapes (`\040` and friends) the kernel uses for
/// whitespace and backslashes in paths.
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `mount` covers `path` at a path-segment boundary.
fn is_path_within(path: &str, mount: &str) -> bool {
    path.starts_with(mount)
        && (mount == "/" || path.len() == mount.len() || path.as_bytes()[mount.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MOUNTINFO: &str = "\
22 44 0:21 / /sys rw,nosuid,nodev,noexec,relatime shared:6 - sysfs sysfs rw
23 44 0:22 / /proc rw,nosuid,nodev,noexec,relatime shared:5 - proc proc rw
24 44 0:5 / /dev rw,nosuid shared:2 - devtmpfs devtmpfs rw,size=98841448k,nr_inodes=24710362,mode=755
26 24 0:23 / /dev/shm rw,nosuid,nodev shared:3 - tmpfs tmpfs rw
44 1 253:0 / / rw,relatime shared:1 - xfs /dev/mapper/system-root rw,attr2,inode64,logbufs=8,logbsize=32k,noquota
48 44 9:0 / /boot rw,relatime shared:28 - ext4 /dev/md0 rw
52 44 253:5 / /var rw,relatime shared:29 - xfs /dev/mapper/system-var rw,attr2,inode64,noquota
49 44 253:2 / /var rw,relatime shared:29 - xfs /dev/mapper/system-var rw,attr2,inode64,noquota
3927 49 253:6 /zzz /var/lib/kubelet/pods/0abd8cda/volumes/kubernetes.io~csi/xxx/mount rw,relatime shared:29 - xfs /dev/mapper/system-var rw
3926 49 253:2 /lib/kubelet/plugins/kubernetes.io/csi/pv/xxx/globalmount /var/lib/kubelet/pods/0abd8cda/volumes/kubernetes.io~csi/xxx/mount rw,relatime shared:29 - xfs /dev/mapper/system-var rw
50 44 253:3 /xxx /yyy rw,relatime shared:29 - xfs /dev/mapper/system-var rw
51 44 253:4 / /va rw,relatime shared:29 - xfs /dev/mapper/system-var rw
garbage line
";

    const SOURCE: &str = "/var/lib/kubelet/plugins/kubernetes.io/csi/pv/xxx/globalmount";
    const TARGET: &str = "/var/lib/kubelet/pods/0abd8cda/volumes/kubernetes.io~csi/xxx/mount";

    fn table() -> MountTable {
        MountTable::parse(MOUNTINFO.as_bytes()).unwrap()
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert_eq!(table().len(), 12);
    }

    #[test]
    fn latest_mount_shadows_earlier() {
        let table = table();
        let mount = table.get_by_mount_point(TARGET).unwrap();
        assert_eq!(mount.id, "3926");
        assert_eq!(table.get_by_mount_point("/var").unwrap().id, "49");
        assert!(table.get_by_mount_point("/nonexistent").is_none());
    }

    #[test]
    fn find_by_path_respects_segment_boundaries() {
        let table = table();
        assert_eq!(table.find_by_path(SOURCE).unwrap().id, "49");
        assert_eq!(table.find_by_path("/va").unwrap().id, "51");
        assert_eq!(table.find_by_path("/val/x").unwrap().id, "44");
    }

    #[test]
    fn bind_mount_traces_back_to_source() {
        let table = table();
        let source_mount = table.find_by_path(SOURCE).unwrap();
        assert_eq!(
            source_mount.path_on_device(SOURCE),
            "/lib/kubelet/plugins/kubernetes.io/csi/pv/xxx/globalmount"
        );

        let mount = table.get_by_mount_point(TARGET).unwrap();
        assert!(table.verify_mount_source(mount, SOURCE));
        assert!(!table.verify_mount_source(mount, "/var/lib/other"));
        assert!(!table.verify_mount_source(mount, "/boot/globalmount"));
    }

    #[test]
    fn path_on_device_arithmetic() {
        let table = table();
        let root = table.get_by_mount_point("/").unwrap();
        assert_eq!(root.path_on_device("/abc/def"), "/abc/def");

        let offset = table.get_by_mount_point("/yyy").unwrap();
        assert_eq!(offset.path_on_device("/yyy/def"), "/xxx/def");
        assert_eq!(offset.path_on_device("/yyy"), "/xxx");

        let var = table.get_by_mount_point("/var").unwrap();
        assert_eq!(var.path_on_device("/var"), "/");
    }

    #[test]
    fn root_mount_with_offset_prepends_root() {
        let mount = MountRecord {
            id: "1".into(),
            device: "0:1".into(),
            root: "/sub".into(),
            mount_point: "/".into(),
        };
        assert_eq!(mount.path_on_device("/etc/hosts"), "/sub/etc/hosts");
    }

    #[test]
    fn escaped_paths_are_decoded() {
        let table =
            MountTable::parse("7 1 0:9 /a\\040b /mnt/with\\040space rw - tmpfs tmpfs rw\n".as_bytes())
                .unwrap();
        let mount = table.get_by_mount_point("/mnt/with space").unwrap();
        assert_eq!(mount.root, "/a b");
    }

    proptest! {
        #[test]
        fn child_paths_are_within_their_mount(
            mount in "(/[a-z]{1,8}){1,4}",
            child in "(/[a-z]{1,8}){0,3}",
        ) {
            let path = format!("{mount}{child}");
            prop_assert!(is_path_within(&path, &mount));
            prop_assert!(is_path_within(&path, "/"));
        }

        #[test]
        fn sibling_prefixes_are_not_within(mount in "(/[a-z]{1,8}){1,4}", suffix in "[a-z]{1,4}") {
            let path = format!("{mount}{suffix}");
            prop_assert!(!is_path_within(&path, &mount));
        }

        #[test]
        fn offset_mounts_swap_prefix(
            root in "(/[a-z]{1,8}){1,3}",
            mount_point in "(/[A-Z]{1,8}){1,3}",
            rel in "(/[a-z0-9]{1,8}){1,3}",
        ) {
            let mount = MountRecord {
                id: "1".into(),
                device: "0:1".into(),
                root: root.clone(),
                mount_point: mount_point.clone(),
            };
            prop_assert_eq!(
                mount.path_on_device(&format!("{mount_point}{rel}")),
                format!("{root}{rel}")
            );
        }
    }
}
