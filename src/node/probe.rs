//! Block device probe
//!
//! Enumerates block devices from sysfs, reads their filesystem identity from
//! the udev database and decides which of them may be initialized.

use super::linux::parse_mountinfo;
use crate::crd::Device;
use crate::error::Result;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// Probe Configuration
// =============================================================================

/// Configuration for the device probe
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Include loopback devices
    pub include_loopback: bool,
    /// Minimum size of an initializable device (bytes)
    pub min_size_bytes: i64,
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
    /// Path to the udev database (for testing)
    pub udev_data_path: PathBuf,
    /// Path to the mount table (for testing)
    pub mountinfo_path: PathBuf,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            include_loopback: false,
            min_size_bytes: 512 * 1024 * 1024,
            sysfs_path: PathBuf::from("/sys"),
            udev_data_path: PathBuf::from("/run/udev/data"),
            mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
        }
    }
}

// =============================================================================
// Device Probe
// =============================================================================

/// Probes the block devices of the local node
pub struct DeviceProbe {
    config: ProbeConfig,
}

impl DeviceProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// List every whole-disk device with the reason it is denied, if any
    pub fn probe(&self) -> Result<Vec<Device>> {
        let block_path = self.config.sysfs_path.join("class/block");
        let mounted: HashSet<String> = match fs::read_to_string(&self.config.mountinfo_path) {
            Ok(contents) => parse_mountinfo(&contents)
                .into_iter()
                .map(|e| e.major_minor)
                .collect(),
            Err(e) => {
                debug!(error = %e, "mount table unavailable");
                HashSet::new()
            }
        };

        let mut devices = Vec::new();
        for entry in fs::read_dir(&block_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            if !self.should_include_device(&name) || is_partition(&entry.path()) {
                continue;
            }

            match self.probe_device(&entry.path(), &name, &mounted) {
                Ok(device) => devices.push(device),
                Err(e) => debug!(device = %name, error = %e, "skipping device"),
            }
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name));

        info!(count = devices.len(), "probed block devices");
        Ok(devices)
    }

    fn probe_device(&self, sysfs_path: &Path, name: &str, mounted: &HashSet<String>) -> Result<Device> {
        let major_minor = read_attr(sysfs_path, "dev")?;
        let sectors: i64 = read_attr(sysfs_path, "size")?.parse().unwrap_or(0);
        let size = sectors * 512;

        let vendor = read_attr(sysfs_path, "device/vendor").unwrap_or_default();
        let model = read_attr(sysfs_path, "device/model").unwrap_or_default();
        let make = format!("{vendor} {model}").trim().to_string();

        let (fs, fsuuid) = self.udev_fs(&major_minor);

        let partitions = self.partitions(sysfs_path, name);
        let denied_reason = if flag(sysfs_path, "ro") {
            "read only"
        } else if flag(sysfs_path, "removable") {
            "removable"
        } else if !partitions.is_empty() {
            "has partitions"
        } else if mounted.contains(&major_minor) {
            "mounted"
        } else if has_holders(sysfs_path) {
            "held by another device"
        } else if size < self.config.min_size_bytes {
            "too small"
        } else {
            ""
        };

        Ok(Device {
            id: format!("{major_minor}${name}"),
            name: name.to_string(),
            size,
            make,
            fs,
            fsuuid,
            major_minor,
            denied_reason: denied_reason.to_string(),
        })
    }

    /// Filesystem type and UUID recorded by udev
    fn udev_fs(&self, major_minor: &str) -> (String, String) {
        let path = self.config.udev_data_path.join(format!("b{major_minor}"));
        let Ok(contents) = fs::read_to_string(path) else {
            return (String::new(), String::new());
        };
        let mut fs_type = String::new();
        let mut fs_uuid = String::new();
        for line in contents.lines() {
            if let Some(value) = line.strip_prefix("E:ID_FS_TYPE=") {
                fs_type = value.to_string();
            } else if let Some(value) = line.strip_prefix("E:ID_FS_UUID=") {
                fs_uuid = value.to_string();
            }
        }
        (fs_type, fs_uuid)
    }

    fn partitions(&self, sysfs_path: &Path, name: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(sysfs_path) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| is_partition(&e.path()))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|child| child.starts_with(name))
            .collect()
    }

    /// Check if a device should be included
    fn should_include_device(&self, name: &str) -> bool {
        if !self.config.include_loopback && name.starts_with("loop") {
            return false;
        }
        !["ram", "zram", "dm-", "md", "sr", "fd"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }
}

fn is_partition(sysfs_path: &Path) -> bool {
    sysfs_path.join("partition").exists()
}

fn has_holders(sysfs_path: &Path) -> bool {
    fs::read_dir(sysfs_path.join("holders"))
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn flag(base_path: &Path, attr: &str) -> bool {
    read_attr(base_path, attr).map(|v| v == "1").unwrap_or(false)
}

fn read_attr(base_path: &Path, attr: &str) -> std::io::Result<String> {
    fs::read_to_string(base_path.join(attr)).map(|s| s.trim().to_string())
}
