//! On-disk layout under the mount root
//!
//! ```text
//! <mount-root>/<fsuuid>                          drive mount point
//! <mount-root>/<fsuuid>/.directpv/meta.info      drive metadata
//! <mount-root>/<fsuuid>/.FSUUID.<fsuuid>/<name>  volume data path
//! ```

use crate::crd::APP_NAME;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MOUNT_ROOT: &str = "/var/lib/directpv/mnt";
pub const DEFAULT_TMPFS_DIR: &str = "/var/lib/directpv/tmp";

const META_INFO_FILE: &str = "meta.info";

/// Where a drive is mounted
pub fn drive_mount_point(mount_root: &Path, fsuuid: &str) -> PathBuf {
    mount_root.join(fsuuid)
}

/// Per-drive metadata file
pub fn meta_info_path(mount_root: &Path, fsuuid: &str) -> PathBuf {
    drive_mount_point(mount_root, fsuuid)
        .join(format!(".{APP_NAME}"))
        .join(META_INFO_FILE)
}

/// Data directory of a volume
pub fn volume_data_path(mount_root: &Path, fsuuid: &str, volume_name: &str) -> PathBuf {
    drive_mount_point(mount_root, fsuuid)
        .join(format!(".FSUUID.{fsuuid}"))
        .join(volume_name)
}

/// Contents of `meta.info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaInfo {
    pub fsuuid: String,
    pub node_id: String,
    pub drive_name: String,
}

impl MetaInfo {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let root = Path::new(DEFAULT_MOUNT_ROOT);
        assert_eq!(
            drive_mount_point(root, "abc"),
            PathBuf::from("/var/lib/directpv/mnt/abc")
        );
        assert_eq!(
            meta_info_path(root, "abc"),
            PathBuf::from("/var/lib/directpv/mnt/abc/.directpv/meta.info")
        );
        assert_eq!(
            volume_data_path(root, "abc", "pvc-1"),
            PathBuf::from("/var/lib/directpv/mnt/abc/.FSUUID.abc/pvc-1")
        );
    }
}
