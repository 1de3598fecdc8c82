//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use directpv::client::{Clients, ListOptions};
use directpv::crd::{DirectPVDrive, DirectPVVolume, DirectResource, DriveStatus, LabelKey};
use directpv::csi::proto::volume_capability::access_mode::Mode;
use directpv::csi::proto::volume_capability::{AccessMode, AccessType, MountVolume};
use directpv::csi::proto::{CapacityRange, CreateVolumeRequest, Topology, TopologyRequirement, VolumeCapability};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};

pub const MIB: i64 = 1 << 20;

pub fn xfs_capability() -> VolumeCapability {
    VolumeCapability {
        access_type: Some(AccessType::Mount(MountVolume {
            fs_type: "xfs".into(),
            mount_flags: Vec::new(),
        })),
        access_mode: Some(AccessMode {
            mode: Mode::SingleNodeWriter as i32,
        }),
    }
}

pub fn topology(pairs: &[(LabelKey, &str)]) -> Topology {
    Topology {
        segments: pairs
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_string()))
            .collect(),
    }
}

pub fn create_request(name: &str, size: i64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.into(),
        capacity_range: Some(CapacityRange {
            required_bytes: size,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![xfs_capability()],
        parameters: HashMap::new(),
        accessibility_requirements: None,
        ..Default::default()
    }
}

pub fn with_topology(mut request: CreateVolumeRequest, preferred: Vec<Topology>, requisite: Vec<Topology>) -> CreateVolumeRequest {
    request.accessibility_requirements = Some(TopologyRequirement { requisite, preferred });
    request
}

/// A Ready drive whose ID doubles as its FSUUID
pub fn drive(id: &str, node: &str, zone: &str, free: i64) -> DirectPVDrive {
    DirectPVDrive::build(
        id,
        node,
        "sdb",
        DriveStatus {
            total_capacity: free,
            free_capacity: free,
            fsuuid: id.to_string(),
            topology: BTreeMap::from([
                (LabelKey::Node.as_str().to_string(), node.to_string()),
                (LabelKey::TopologyZone.as_str().to_string(), zone.to_string()),
            ]),
            ..Default::default()
        },
    )
}

pub async fn seed_drives(clients: &Clients, drives: Vec<DirectPVDrive>) {
    for drive in drives {
        clients.drives.create(&drive).await.unwrap();
    }
}

pub async fn all_drives(clients: &Clients) -> Vec<DirectPVDrive> {
    clients.drives.list(&ListOptions::default()).await.unwrap().items
}

pub async fn all_volumes(clients: &Clients) -> Vec<DirectPVVolume> {
    clients.volumes.list(&ListOptions::default()).await.unwrap().items
}

/// Capacity sums and reservation finalizers agree with the volume records
pub async fn assert_cluster_consistent(clients: &Clients) {
    let volumes = all_volumes(clients).await;
    for drive in all_drives(clients).await {
        assert!(drive.capacity_consistent(), "drive {} capacity out of balance", drive.name_any());
        let live: Vec<_> = volumes
            .iter()
            .filter(|v| v.drive_id() == drive.drive_id() && !v.is_deleting())
            .collect();
        assert_eq!(drive.volume_names().len(), live.len(), "drive {} reservations", drive.name_any());
        let held: i64 = live.iter().map(|v| v.reserved_capacity()).sum();
        assert_eq!(drive.allocated_capacity(), held, "drive {} allocation", drive.name_any());
    }
    for volume in &volumes {
        if !volume.target_path().is_empty() {
            assert!(!volume.staging_target_path().is_empty());
        }
    }
}
