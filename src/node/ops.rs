//! Host capabilities consumed by the node server
//!
//! Every mount, quota, directory and device operation goes through
//! [`NodeOps`] so the CSI node service and the reconcilers can run against
//! [`FakeNodeOps`] in tests.

use crate::crd::Device;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// `<major>:<minor>` of the backing device
    pub major_minor: String,
    /// Path inside the backing filesystem that is mounted
    pub root: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
    pub read_only: bool,
}

impl MountEntry {
    /// Whether both entries expose the same directory of the same device
    pub fn same_source(&self, other: &MountEntry) -> bool {
        self.major_minor == other.major_minor && self.root == other.root
    }
}

/// Snapshot of the mount table
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn new(entries: Vec<MountEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// The topmost mount at `path`
    pub fn get(&self, path: &Path) -> Option<&MountEntry> {
        self.entries.iter().rev().find(|e| e.mount_point == path)
    }

    pub fn is_mount_point(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Whether any mount is backed by `major_minor`
    pub fn is_device_mounted(&self, major_minor: &str) -> bool {
        self.entries.iter().any(|e| e.major_minor == major_minor)
    }
}

/// Project quota of a volume, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    pub hard_limit: i64,
    pub soft_limit: i64,
    pub current_usage: i64,
}

/// Host operations the node server depends on
#[async_trait]
pub trait NodeOps: Send + Sync {
    /// Block device holding the filesystem with `fsuuid`
    async fn device_by_fsuuid(&self, fsuuid: &str) -> Result<PathBuf>;

    async fn mkdir_all(&self, path: &Path) -> Result<()>;

    /// Remove a directory tree; a missing path is not an error
    async fn remove_all(&self, path: &Path) -> Result<()>;

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;

    async fn mount_table(&self) -> Result<MountTable>;

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()>;

    /// Mount an XFS drive with project quotas enabled
    async fn mount_xfs(&self, device: &Path, target: &Path) -> Result<()>;

    async fn mount_tmpfs(&self, target: &Path) -> Result<()>;

    /// Unmount `target`; not mounted or missing is not an error
    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Apply `hard = soft = limit` to the project rooted at `data_path`
    async fn set_quota(&self, mount_point: &Path, data_path: &Path, volume_name: &str, limit: i64) -> Result<()>;

    async fn get_quota(&self, mount_point: &Path, volume_name: &str) -> Result<Quota>;

    async fn format_xfs(&self, device: &Path, fsuuid: &str, force: bool) -> Result<()>;

    async fn probe_devices(&self) -> Result<Vec<Device>>;
}

// =============================================================================
// In-memory host
// =============================================================================

#[derive(Default)]
struct FakeHost {
    devices: HashMap<String, PathBuf>,
    dirs: BTreeSet<PathBuf>,
    files: HashMap<PathBuf, Vec<u8>>,
    mounts: Vec<MountEntry>,
    quotas: HashMap<String, Quota>,
    probed: Vec<Device>,
    formatted: HashMap<PathBuf, String>,
}

/// In-memory [`NodeOps`] for tests
#[derive(Default)]
pub struct FakeNodeOps {
    host: Mutex<FakeHost>,
}

impl FakeNodeOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fsuuid` resolve to `device`
    pub fn add_device(&self, fsuuid: &str, device: impl Into<PathBuf>) {
        self.host.lock().devices.insert(fsuuid.to_string(), device.into());
    }

    /// Simulate a lost drive
    pub fn remove_device(&self, fsuuid: &str) {
        self.host.lock().devices.remove(fsuuid);
    }

    pub fn set_probed_devices(&self, devices: Vec<Device>) {
        self.host.lock().probed = devices;
    }

    pub fn mounts(&self) -> Vec<MountEntry> {
        self.host.lock().mounts.clone()
    }

    pub fn is_mount_point(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        self.host.lock().mounts.iter().any(|m| m.mount_point == path)
    }

    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        self.host.lock().dirs.contains(path.as_ref())
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.host.lock().files.get(path.as_ref()).cloned()
    }

    pub fn quota(&self, volume_name: &str) -> Option<Quota> {
        self.host.lock().quotas.get(volume_name).copied()
    }

    /// Report `used` bytes for a volume's project
    pub fn set_usage(&self, volume_name: &str, used: i64) {
        let mut host = self.host.lock();
        let quota = host.quotas.entry(volume_name.to_string()).or_default();
        quota.current_usage = used;
    }

    /// FSUUID `device` was formatted with, if any
    pub fn formatted(&self, device: impl AsRef<Path>) -> Option<String> {
        self.host.lock().formatted.get(device.as_ref()).cloned()
    }
}

#[async_trait]
impl NodeOps for FakeNodeOps {
    async fn device_by_fsuuid(&self, fsuuid: &str) -> Result<PathBuf> {
        self.host
            .lock()
            .devices
            .get(fsuuid)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                fsuuid: fsuuid.to_string(),
            })
    }

    async fn mkdir_all(&self, path: &Path) -> Result<()> {
        self.host.lock().dirs.insert(path.to_path_buf());
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        let mut host = self.host.lock();
        host.dirs.retain(|d| !d.starts_with(path));
        host.files.retain(|f, _| !f.starts_with(path));
        Ok(())
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.host
            .lock()
            .files
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    async fn mount_table(&self) -> Result<MountTable> {
        Ok(MountTable::new(self.host.lock().mounts.clone()))
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        let mut host = self.host.lock();
        let (major_minor, root) = match host.mounts.iter().rev().find(|m| m.mount_point == source) {
            Some(entry) => (entry.major_minor.clone(), entry.root.clone()),
            None => {
                if !host.dirs.contains(source) {
                    return Err(Error::Mount {
                        path: target.display().to_string(),
                        reason: format!("source {} does not exist", source.display()),
                    });
                }
                ("0:0".to_string(), source.display().to_string())
            }
        };
        host.mounts.push(MountEntry {
            major_minor,
            root,
            mount_point: target.to_path_buf(),
            fs_type: "xfs".into(),
            source: source.display().to_string(),
            read_only,
        });
        Ok(())
    }

    async fn mount_xfs(&self, device: &Path, target: &Path) -> Result<()> {
        let mut host = self.host.lock();
        host.dirs.insert(target.to_path_buf());
        host.mounts.push(MountEntry {
            major_minor: device.display().to_string(),
            root: "/".into(),
            mount_point: target.to_path_buf(),
            fs_type: "xfs".into(),
            source: device.display().to_string(),
            read_only: false,
        });
        Ok(())
    }

    async fn mount_tmpfs(&self, target: &Path) -> Result<()> {
        let mut host = self.host.lock();
        host.dirs.insert(target.to_path_buf());
        host.mounts.push(MountEntry {
            major_minor: "0:1".into(),
            root: "/".into(),
            mount_point: target.to_path_buf(),
            fs_type: "tmpfs".into(),
            source: "tmpfs".into(),
            read_only: false,
        });
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let mut host = self.host.lock();
        if let Some(index) = host.mounts.iter().rposition(|m| m.mount_point == target) {
            host.mounts.remove(index);
        }
        Ok(())
    }

    async fn set_quota(&self, _mount_point: &Path, _data_path: &Path, volume_name: &str, limit: i64) -> Result<()> {
        let mut host = self.host.lock();
        let quota = host.quotas.entry(volume_name.to_string()).or_default();
        quota.hard_limit = limit;
        quota.soft_limit = limit;
        Ok(())
    }

    async fn get_quota(&self, mount_point: &Path, volume_name: &str) -> Result<Quota> {
        self.host
            .lock()
            .quotas
            .get(volume_name)
            .copied()
            .ok_or_else(|| Error::Quota {
                path: mount_point.display().to_string(),
                reason: format!("no quota for {volume_name}"),
            })
    }

    async fn format_xfs(&self, device: &Path, fsuuid: &str, _force: bool) -> Result<()> {
        let mut host = self.host.lock();
        host.formatted.insert(device.to_path_buf(), fsuuid.to_string());
        host.devices.insert(fsuuid.to_string(), device.to_path_buf());
        Ok(())
    }

    async fn probe_devices(&self) -> Result<Vec<Device>> {
        Ok(self.host.lock().probed.clone())
    }
}
