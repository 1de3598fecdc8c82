//! DirectPVVolume CRD
//!
//! A quota-enforced directory carved out of exactly one drive. The volume
//! name is the CSI volume ID; node, drive and claim references are labels.

use super::labels::LabelKey;
use super::types::VolumeState;
use super::{DirectResource, PURGE_PROTECTION_FINALIZER, PV_PROTECTION_FINALIZER};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types carried by a volume
pub const CONDITION_STAGED: &str = "Staged";
pub const CONDITION_PUBLISHED: &str = "Published";
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_ERROR: &str = "Error";

/// Reasons used on the Error condition
pub const REASON_NOT_MOUNTED: &str = "NotMounted";
pub const REASON_NO_ERROR: &str = "NoError";

// =============================================================================
// DirectPVVolume CRD
// =============================================================================

/// DirectPVVolume is one provisioned persistent volume
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "directpv.min.io",
    version = "v1",
    kind = "DirectPVVolume",
    plural = "directpvvolumes",
    shortname = "dpvv",
    status = "VolumeStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".metadata.labels.directpv\\.min\\.io/node"}"#,
    printcolumn = r#"{"name": "Drive", "type": "string", "jsonPath": ".metadata.labels.directpv\\.min\\.io/drive"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".status.totalCapacity"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {}

// =============================================================================
// Status
// =============================================================================

/// Status of a DirectPVVolume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// Absolute data directory on the node
    #[serde(default)]
    pub data_path: String,

    /// Empty when unstaged
    #[serde(default)]
    pub staging_target_path: String,

    /// Empty when unpublished
    #[serde(default)]
    pub target_path: String,

    /// Filesystem UUID of the host drive
    #[serde(default)]
    pub fsuuid: String,

    /// Requested capacity in bytes
    #[serde(default)]
    pub total_capacity: i64,

    /// Capacity charged to the drive by a controller expansion that the node
    /// has not applied yet
    #[serde(default)]
    pub reserved_capacity: i64,

    #[serde(default)]
    pub available_capacity: i64,

    #[serde(default)]
    pub used_capacity: i64,

    #[serde(default)]
    pub status: VolumeState,

    #[serde(default)]
    pub conditions: Vec<VolumeCondition>,
}

/// Volume condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCondition {
    /// Type of condition
    pub r#type: String,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl VolumeCondition {
    pub fn new(kind: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            r#type: kind.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(Utc::now()),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

/// Inputs for a freshly provisioned volume
#[derive(Debug, Clone, Default)]
pub struct NewVolume<'a> {
    pub name: &'a str,
    pub fsuuid: &'a str,
    pub node_id: &'a str,
    pub drive_id: &'a str,
    pub drive_name: &'a str,
    pub size: i64,
}

impl DirectPVVolume {
    /// Build a Pending volume bound to a drive, carrying both protection
    /// finalizers.
    pub fn build(input: NewVolume<'_>) -> Self {
        let mut volume = DirectPVVolume::new(input.name, VolumeSpec::default());
        volume.set_label(LabelKey::Node, input.node_id);
        volume.set_label(LabelKey::DriveId, input.drive_id);
        volume.set_label(LabelKey::DriveName, input.drive_name);
        volume.set_label(LabelKey::CreatedBy, "directpv-controller");
        volume.add_finalizer(PV_PROTECTION_FINALIZER);
        volume.add_finalizer(PURGE_PROTECTION_FINALIZER);
        volume.status = Some(VolumeStatus {
            fsuuid: input.fsuuid.to_string(),
            total_capacity: input.size,
            available_capacity: input.size,
            status: VolumeState::Pending,
            ..Default::default()
        });
        volume
    }

    pub fn node_id(&self) -> &str {
        self.label(LabelKey::Node).unwrap_or_default()
    }

    pub fn drive_id(&self) -> &str {
        self.label(LabelKey::DriveId).unwrap_or_default()
    }

    pub fn drive_name(&self) -> &str {
        self.label(LabelKey::DriveName).unwrap_or_default()
    }

    pub fn claim_id(&self) -> &str {
        self.label(LabelKey::VolumeClaimId).unwrap_or_default()
    }

    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut VolumeStatus {
        self.status.get_or_insert_with(VolumeStatus::default)
    }

    pub fn fsuuid(&self) -> &str {
        self.status.as_ref().map(|s| s.fsuuid.as_str()).unwrap_or_default()
    }

    pub fn total_capacity(&self) -> i64 {
        self.status.as_ref().map(|s| s.total_capacity).unwrap_or(0)
    }

    /// Bytes this volume holds on its drive: the larger of the applied size
    /// and any pending controller expansion
    pub fn reserved_capacity(&self) -> i64 {
        self.status
            .as_ref()
            .map(|s| s.total_capacity.max(s.reserved_capacity))
            .unwrap_or(0)
    }

    pub fn data_path(&self) -> &str {
        self.status.as_ref().map(|s| s.data_path.as_str()).unwrap_or_default()
    }

    pub fn staging_target_path(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.staging_target_path.as_str())
            .unwrap_or_default()
    }

    pub fn target_path(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.target_path.as_str())
            .unwrap_or_default()
    }

    pub fn state(&self) -> VolumeState {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    pub fn is_staged(&self) -> bool {
        !self.staging_target_path().is_empty()
    }

    pub fn is_published(&self) -> bool {
        !self.target_path().is_empty()
    }

    /// Condition of a given type, if present
    pub fn condition(&self, kind: &str) -> Option<&VolumeCondition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == kind))
    }

    /// Set a condition. Returns false when an identical condition is already
    /// present; the transition time only moves when `status` flips.
    pub fn set_condition(&mut self, kind: &str, status: bool, reason: &str, message: &str) -> bool {
        let conditions = &mut self.status_mut().conditions;
        match conditions.iter_mut().find(|c| c.r#type == kind) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = Some(Utc::now());
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                true
            }
            None => {
                conditions.push(VolumeCondition::new(kind, status, reason, message));
                true
            }
        }
    }

    /// Whether only `purge-protection` remains among DirectPV finalizers
    pub fn only_purge_protection_left(&self) -> bool {
        self.has_finalizer(PURGE_PROTECTION_FINALIZER)
            && self.finalizers().len() == 1
    }
}
