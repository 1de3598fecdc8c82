//! Linux implementation of [`NodeOps`]
//!
//! Mounts go through `mount(2)`/`umount2(2)`; quotas and formatting shell out
//! to `xfs_quota` and `mkfs.xfs`. Blocking calls run on the blocking pool.

use super::ops::{MountEntry, MountTable, NodeOps, Quota};
use super::probe::{DeviceProbe, ProbeConfig};
use crate::crd::Device;
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

const MOUNTINFO: &str = "/proc/self/mountinfo";
const DEV_BY_UUID: &str = "/dev/disk/by-uuid";

/// Host operations on a Linux node
pub struct LinuxNodeOps {
    probe: ProbeConfig,
}

impl LinuxNodeOps {
    pub fn new(probe: ProbeConfig) -> Self {
        Self { probe }
    }
}

impl Default for LinuxNodeOps {
    fn default() -> Self {
        Self::new(ProbeConfig::default())
    }
}

/// XFS project id of a volume, FNV-1a of its name
pub fn project_id(volume_name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in volume_name.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Undo the octal escapes the kernel applies to mountinfo fields
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `/proc/self/mountinfo`; malformed lines are skipped
pub fn parse_mountinfo(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let separator = fields.iter().position(|f| *f == "-")?;
            if separator < 6 || fields.len() < separator + 3 {
                return None;
            }
            Some(MountEntry {
                major_minor: fields[2].to_string(),
                root: unescape(fields[3]),
                mount_point: PathBuf::from(unescape(fields[4])),
                fs_type: fields[separator + 1].to_string(),
                source: unescape(fields[separator + 2]),
                read_only: fields[5].split(',').any(|o| o == "ro"),
            })
        })
        .collect()
}

/// Parse `xfs_quota -c 'quota -p -N -b <id>'`: device, used, soft, hard in KiB
fn parse_quota_report(output: &str) -> Option<Quota> {
    let fields: Vec<&str> = output.lines().next()?.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    let kib = |s: &str| s.parse::<i64>().ok().map(|v| v * 1024);
    Some(Quota {
        current_usage: kib(fields[1])?,
        soft_limit: kib(fields[2])?,
        hard_limit: kib(fields[3])?,
    })
}

fn mount_error(path: &Path, errno: Errno) -> Error {
    Error::Mount {
        path: path.display().to_string(),
        reason: errno.desc().to_string(),
    }
}

async fn run(command: &str, args: &[String]) -> Result<String> {
    debug!(command = %command, ?args, "running command");
    let output = Command::new(command).args(args).output().await?;
    if !output.status.success() {
        return Err(Error::Command {
            command: command.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run one expert-mode `xfs_quota` command against a mounted filesystem
async fn xfs_quota(mount_point: &Path, command: String) -> Result<String> {
    let path = mount_point.display().to_string();
    run("xfs_quota", &["-x".into(), "-c".into(), command, path.clone()])
        .await
        .map_err(|e| Error::Quota {
            path,
            reason: e.to_string(),
        })
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl NodeOps for LinuxNodeOps {
    async fn device_by_fsuuid(&self, fsuuid: &str) -> Result<PathBuf> {
        let link = Path::new(DEV_BY_UUID).join(fsuuid);
        tokio::fs::canonicalize(&link)
            .await
            .map_err(|_| Error::DeviceNotFound {
                fsuuid: fsuuid.to_string(),
            })
    }

    async fn mkdir_all(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn mount_table(&self) -> Result<MountTable> {
        let contents = tokio::fs::read_to_string(MOUNTINFO).await?;
        Ok(MountTable::new(parse_mountinfo(&contents)))
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        tokio::fs::create_dir_all(target).await?;
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        blocking(move || {
            mount(Some(&source), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
                .map_err(|e| mount_error(&target, e))?;
            if read_only {
                let flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
                mount(None::<&str>, &target, None::<&str>, flags, None::<&str>)
                    .map_err(|e| mount_error(&target, e))?;
            }
            Ok(())
        })
        .await
    }

    async fn mount_xfs(&self, device: &Path, target: &Path) -> Result<()> {
        tokio::fs::create_dir_all(target).await?;
        let device = device.to_path_buf();
        let target = target.to_path_buf();
        let source = device.clone();
        blocking(move || {
            mount(Some(&source), &target, Some("xfs"), MsFlags::MS_NOATIME, Some("prjquota"))
                .map_err(|e| mount_error(&target, e))
        })
        .await?;
        info!(device = %device.display(), "drive mounted");
        Ok(())
    }

    async fn mount_tmpfs(&self, target: &Path) -> Result<()> {
        tokio::fs::create_dir_all(target).await?;
        let target = target.to_path_buf();
        blocking(move || {
            mount(Some("tmpfs"), &target, Some("tmpfs"), MsFlags::empty(), Some("size=1M"))
                .map_err(|e| mount_error(&target, e))
        })
        .await
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let target = target.to_path_buf();
        blocking(move || match umount2(&target, MntFlags::empty()) {
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(mount_error(&target, e)),
        })
        .await
    }

    async fn set_quota(&self, mount_point: &Path, data_path: &Path, volume_name: &str, limit: i64) -> Result<()> {
        let id = project_id(volume_name);
        xfs_quota(mount_point, format!("project -s -p {} {id}", data_path.display())).await?;
        xfs_quota(mount_point, format!("limit -p bsoft={limit} bhard={limit} {id}")).await?;
        Ok(())
    }

    async fn get_quota(&self, mount_point: &Path, volume_name: &str) -> Result<Quota> {
        let output = xfs_quota(mount_point, format!("quota -p -N -b {}", project_id(volume_name))).await?;
        parse_quota_report(&output).ok_or_else(|| Error::Quota {
            path: mount_point.display().to_string(),
            reason: format!("unexpected quota report {output:?}"),
        })
    }

    async fn format_xfs(&self, device: &Path, fsuuid: &str, force: bool) -> Result<()> {
        let mut args = vec![
            "-i".to_string(),
            "maxpct=50".to_string(),
            "-m".to_string(),
            format!("uuid={fsuuid}"),
            "-L".to_string(),
            "DIRECTPV".to_string(),
        ];
        if force {
            args.push("-f".to_string());
        }
        args.push(device.display().to_string());
        run("mkfs.xfs", &args).await?;
        Ok(())
    }

    async fn probe_devices(&self) -> Result<Vec<Device>> {
        let probe = DeviceProbe::new(self.probe.clone());
        blocking(move || probe.probe()).await
    }
}
