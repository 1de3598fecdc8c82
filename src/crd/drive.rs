//! DirectPVDrive CRD
//!
//! One object per physical disk claimed by DirectPV. The object name is the
//! drive ID; the owning node and kernel name are carried as labels.

use super::labels::LabelKey;
use super::types::{AccessTier, DriveHealth, DriveState};
use super::{volume_finalizer, DirectResource, DATA_PROTECTION_FINALIZER, VOLUME_FINALIZER_PREFIX};
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// DirectPVDrive CRD
// =============================================================================

/// DirectPVDrive tracks the capacity, health and topology of a single drive.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "directpv.min.io",
    version = "v1",
    kind = "DirectPVDrive",
    plural = "directpvdrives",
    shortname = "dpvd",
    status = "DriveStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".metadata.labels.directpv\\.min\\.io/node"}"#,
    printcolumn = r#"{"name": "Name", "type": "string", "jsonPath": ".metadata.labels.directpv\\.min\\.io/drive-name"}"#,
    printcolumn = r#"{"name": "Free", "type": "integer", "jsonPath": ".status.freeCapacity"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct DriveSpec {
    /// Exclude this drive from volume scheduling
    #[serde(default)]
    pub unschedulable: bool,

    /// Ask the node to rewrite the drive labels
    #[serde(default)]
    pub relabel: bool,
}

// =============================================================================
// Status
// =============================================================================

/// Status of a DirectPVDrive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriveStatus {
    /// Usable capacity in bytes
    #[serde(default)]
    pub total_capacity: i64,

    /// Capacity not reserved by any volume
    #[serde(default)]
    pub free_capacity: i64,

    /// Capacity reserved by volumes
    #[serde(default)]
    pub allocated_capacity: i64,

    /// Filesystem UUID of the formatted drive
    #[serde(default)]
    pub fsuuid: String,

    /// Health of the drive
    #[serde(default)]
    pub status: DriveHealth,

    /// Administrative state
    #[serde(default)]
    pub state: DriveState,

    #[serde(default)]
    pub access_tier: AccessTier,

    /// Topology segments (identity, node, rack, zone, region)
    #[serde(default)]
    pub topology: BTreeMap<String, String>,

    /// Make and model
    #[serde(default)]
    pub make: String,

    /// Host device path
    #[serde(default)]
    pub path: String,
}

// =============================================================================
// Implementations
// =============================================================================

impl DirectPVDrive {
    /// Build a Ready drive owned by `node_id`
    pub fn build(drive_id: &str, node_id: &str, drive_name: &str, status: DriveStatus) -> Self {
        let mut drive = DirectPVDrive::new(drive_id, DriveSpec::default());
        drive.set_label(LabelKey::Node, node_id);
        drive.set_label(LabelKey::DriveName, drive_name);
        drive.set_label(LabelKey::AccessTier, &status.access_tier.to_string());
        drive.set_label(LabelKey::CreatedBy, "directpv-driver");
        drive.add_finalizer(DATA_PROTECTION_FINALIZER);
        drive.status = Some(status);
        drive
    }

    /// Drive ID (the object name)
    pub fn drive_id(&self) -> String {
        self.name_any()
    }

    pub fn node_id(&self) -> &str {
        self.label(LabelKey::Node).unwrap_or_default()
    }

    pub fn drive_name(&self) -> &str {
        self.label(LabelKey::DriveName).unwrap_or_default()
    }

    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut DriveStatus {
        self.status.get_or_insert_with(DriveStatus::default)
    }

    pub fn total_capacity(&self) -> i64 {
        self.status.as_ref().map(|s| s.total_capacity).unwrap_or(0)
    }

    pub fn free_capacity(&self) -> i64 {
        self.status.as_ref().map(|s| s.free_capacity).unwrap_or(0)
    }

    pub fn allocated_capacity(&self) -> i64 {
        self.status.as_ref().map(|s| s.allocated_capacity).unwrap_or(0)
    }

    pub fn fsuuid(&self) -> &str {
        self.status.as_ref().map(|s| s.fsuuid.as_str()).unwrap_or_default()
    }

    pub fn health(&self) -> DriveHealth {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    pub fn access_tier(&self) -> AccessTier {
        self.status.as_ref().map(|s| s.access_tier).unwrap_or_default()
    }

    pub fn topology(&self) -> BTreeMap<String, String> {
        self.status
            .as_ref()
            .map(|s| s.topology.clone())
            .unwrap_or_default()
    }

    /// Whether the drive is excluded from scheduling
    pub fn is_unschedulable(&self) -> bool {
        self.spec.unschedulable
    }

    /// Names of the volumes reserved on this drive, from its finalizers
    pub fn volume_names(&self) -> Vec<String> {
        self.finalizers()
            .iter()
            .filter_map(|f| f.strip_prefix(VOLUME_FINALIZER_PREFIX))
            .map(str::to_string)
            .collect()
    }

    /// Whether the drive carries a reservation for `volume_name`
    pub fn has_volume(&self, volume_name: &str) -> bool {
        self.has_finalizer(&volume_finalizer(volume_name))
    }

    /// Reserve `size` bytes for a volume. A reservation already present is not
    /// charged twice.
    pub fn reserve(&mut self, volume_name: &str, size: i64) -> bool {
        if !self.add_finalizer(&volume_finalizer(volume_name)) {
            return false;
        }
        let status = self.status_mut();
        status.free_capacity -= size;
        status.allocated_capacity += size;
        true
    }

    /// Release a volume reservation and return its bytes to the free pool
    pub fn release(&mut self, volume_name: &str, size: i64) -> bool {
        if !self.remove_finalizer(&volume_finalizer(volume_name)) {
            return false;
        }
        let status = self.status_mut();
        status.free_capacity += size;
        status.allocated_capacity = status.total_capacity - status.free_capacity;
        true
    }

    /// Move `delta` bytes from free to allocated
    pub fn expand(&mut self, delta: i64) {
        let status = self.status_mut();
        status.free_capacity -= delta;
        status.allocated_capacity += delta;
    }

    /// The capacity invariant `total == free + allocated`
    pub fn capacity_consistent(&self) -> bool {
        self.total_capacity() == self.free_capacity() + self.allocated_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(total: i64) -> DirectPVDrive {
        DirectPVDrive::build(
            "8a2b9c1e-0000-4000-8000-000000000001",
            "node-1",
            "sda",
            DriveStatus {
                total_capacity: total,
                free_capacity: total,
                fsuuid: "8a2b9c1e-0000-4000-8000-000000000001".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_build() {
        let d = drive(100);
        assert_eq!(d.node_id(), "node-1");
        assert_eq!(d.drive_name(), "sda");
        assert!(d.has_finalizer(DATA_PROTECTION_FINALIZER));
        assert_eq!(d.health(), DriveHealth::Ready);
        assert!(d.capacity_consistent());
    }

    #[test]
    fn test_reserve_and_release() {
        let mut d = drive(100);
        assert!(d.reserve("v1", 20));
        assert!(!d.reserve("v1", 20));
        assert_eq!(d.free_capacity(), 80);
        assert_eq!(d.allocated_capacity(), 20);
        assert_eq!(d.volume_names(), vec!["v1".to_string()]);
        assert!(d.capacity_consistent());

        assert!(d.release("v1", 20));
        assert!(!d.release("v1", 20));
        assert_eq!(d.free_capacity(), 100);
        assert_eq!(d.allocated_capacity(), 0);
        assert!(!d.has_volume("v1"));
    }

    #[test]
    fn test_expand() {
        let mut d = drive(100);
        d.reserve("v1", 10);
        d.expand(30);
        assert_eq!(d.free_capacity(), 60);
        assert_eq!(d.allocated_capacity(), 40);
        assert!(d.capacity_consistent());
    }
}
