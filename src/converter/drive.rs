//! Drive migration steps

use super::{field_to_label, label_to_field, rename, seed, spec_mut, status_mut, Converter, Kind};
use crate::crd::LabelKey;
use crate::error::Result;
use serde_json::Value;

const LEGACY_DEV_DIR: &str = "/direct-csi/dev/";
const LEGACY_DEVICES_DIR: &str = "/var/lib/direct-csi/devices/";

// Kernel names that end in digits without being partitions. The block
// devices among them number partitions as `<disk>p<N>`.
const WHOLE_DISK_PREFIXES: [&str; 9] = ["loop", "md", "sr", "ram", "zram", "mmcblk", "nbd", "rbd", "pmem"];

pub(super) fn register(converter: &mut Converter) {
    converter.register(Kind::Drive, "v1alpha1", "v1beta1", seed_allocated, drop_allocated);
    converter.register(Kind::Drive, "v1beta1", "v1beta2", host_path, legacy_path);
    converter.register(Kind::Drive, "v1beta2", "v1beta3", seed_access_tier, drop_access_tier);
    converter.register(Kind::Drive, "v1beta3", "v1beta4", seed_health, drop_health);
    converter.register(Kind::Drive, "v1beta4", "v1", rename_fields, restore_fields);
}

// v1alpha1 <-> v1beta1

fn seed_allocated(object: &mut Value) -> Result<()> {
    let status = status_mut(object);
    let total = status.get("totalCapacity").and_then(Value::as_i64).unwrap_or(0);
    let free = status.get("freeCapacity").and_then(Value::as_i64).unwrap_or(0);
    seed(status, "allocatedCapacity", Value::from(total - free));
    Ok(())
}

fn drop_allocated(object: &mut Value) -> Result<()> {
    status_mut(object).remove("allocatedCapacity");
    Ok(())
}

// v1beta1 <-> v1beta2

fn host_path(object: &mut Value) -> Result<()> {
    let status = status_mut(object);
    if let Some(path) = status.get("path").and_then(Value::as_str) {
        if let Some(rewritten) = legacy_to_host_path(path) {
            status.insert("path".to_string(), Value::String(rewritten));
        }
    }
    Ok(())
}

fn legacy_path(object: &mut Value) -> Result<()> {
    let status = status_mut(object);
    if let Some(path) = status.get("path").and_then(Value::as_str) {
        if let Some(rewritten) = host_to_legacy_path(path) {
            status.insert("path".to_string(), Value::String(rewritten));
        }
    }
    Ok(())
}

/// `/direct-csi/dev/sda-part-1` becomes `/dev/sda1`; `nvme0n1-part-2`
/// becomes `nvme0n1p2`. Non-legacy paths are left alone.
pub(crate) fn legacy_to_host_path(path: &str) -> Option<String> {
    let name = path
        .strip_prefix(LEGACY_DEV_DIR)
        .or_else(|| path.strip_prefix(LEGACY_DEVICES_DIR))?;
    if name.is_empty() {
        return None;
    }

    let device = match name.rsplit_once("-part-") {
        Some((base, part)) if !base.is_empty() && is_number(part) => {
            if base.ends_with(|c: char| c.is_ascii_digit()) {
                format!("{base}p{part}")
            } else {
                format!("{base}{part}")
            }
        }
        _ => name.to_string(),
    };
    Some(format!("/dev/{device}"))
}

/// Inverse of [`legacy_to_host_path`] for `/dev/...` paths
pub(crate) fn host_to_legacy_path(path: &str) -> Option<String> {
    let name = path.strip_prefix("/dev/")?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(format!("{LEGACY_DEV_DIR}{}", legacy_name(name)))
}

fn legacy_name(name: &str) -> String {
    // nvme0n1p2, mmcblk0p1
    if let Some((base, part)) = name.rsplit_once('p') {
        if base.ends_with(|c: char| c.is_ascii_digit()) && is_number(part) {
            return format!("{base}-part-{part}");
        }
    }

    // sda1, vdb12
    let split = name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (base, part) = name.split_at(split);
    let whole_disk = WHOLE_DISK_PREFIXES.contains(&base);
    if !part.is_empty() && !base.is_empty() && base.chars().all(|c| c.is_ascii_lowercase()) && !whole_disk {
        return format!("{base}-part-{part}");
    }
    name.to_string()
}

fn is_number(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

// v1beta2 <-> v1beta3

fn seed_access_tier(object: &mut Value) -> Result<()> {
    seed(status_mut(object), "accessTier", Value::from("Unknown"));
    Ok(())
}

fn drop_access_tier(object: &mut Value) -> Result<()> {
    status_mut(object).remove("accessTier");
    Ok(())
}

// v1beta3 <-> v1beta4

fn seed_health(object: &mut Value) -> Result<()> {
    seed(status_mut(object), "status", Value::from("Ready"));
    seed(spec_mut(object), "unschedulable", Value::from(false));
    Ok(())
}

fn drop_health(object: &mut Value) -> Result<()> {
    status_mut(object).remove("status");
    spec_mut(object).remove("unschedulable");
    Ok(())
}

// v1beta4 <-> v1

fn rename_fields(object: &mut Value) -> Result<()> {
    let status = status_mut(object);
    rename(status, "driveStatus", "state");
    rename(status, "filesystemUUID", "fsuuid");
    rename(status, "modelNumber", "make");
    field_to_label(object, "nodeName", LabelKey::Node);
    Ok(())
}

fn restore_fields(object: &mut Value) -> Result<()> {
    let status = status_mut(object);
    rename(status, "state", "driveStatus");
    rename(status, "fsuuid", "filesystemUUID");
    rename(status, "make", "modelNumber");
    label_to_field(object, LabelKey::Node, "nodeName");
    Ok(())
}
