//! End-to-end scenarios against the in-memory cluster

mod common;

use common::*;
use directpv::client::Clients;
use directpv::controller::{EventHandler, EventKind};
use directpv::converter::Converter;
use directpv::crd::{
    volume_finalizer, DirectPVDrive, DirectPVVolume, DirectResource, LabelKey, NewVolume,
    PURGE_PROTECTION_FINALIZER, PV_PROTECTION_FINALIZER,
};
use directpv::csi::proto::controller_server::Controller;
use directpv::csi::proto::{CapacityRange, ControllerExpandVolumeRequest, DeleteVolumeRequest};
use directpv::csi::ControllerService;
use directpv::node::FakeNodeOps;
use directpv::volume::VolumeEventHandler;
use serde_json::json;
use std::sync::Arc;
use tonic::{Code, Request};

async fn four_drives() -> (ControllerService, Clients) {
    let clients = Clients::fake();
    seed_drives(
        &clients,
        vec![
            drive("D1", "n1", "a", 100 * MIB),
            drive("D2", "n1", "a", 100 * MIB),
            drive("D3", "n2", "b", 100 * MIB),
            drive("D4", "n2", "b", 100 * MIB),
        ],
    )
    .await;
    (ControllerService::new(clients.clone()), clients)
}

async fn bind_v1(service: &ControllerService) -> directpv::csi::proto::Volume {
    let request = with_topology(
        create_request("v1", 20 * MIB),
        vec![topology(&[(LabelKey::Node, "n1")])],
        vec![topology(&[(LabelKey::Node, "n1")]), topology(&[(LabelKey::Node, "n2")])],
    );
    service
        .create_volume(Request::new(request))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap()
}

#[tokio::test]
async fn bind_one_volume_to_one_drive() {
    let (service, clients) = four_drives().await;
    let volume = bind_v1(&service).await;

    assert_eq!(volume.volume_id, "v1");
    assert_eq!(volume.capacity_bytes, 20 * MIB);
    assert_eq!(volume.accessible_topology.len(), 1);
    assert_eq!(
        volume.accessible_topology[0].segments.get(LabelKey::Node.as_str()).map(String::as_str),
        Some("n1")
    );

    let chosen: Vec<DirectPVDrive> = all_drives(&clients)
        .await
        .into_iter()
        .filter(|d| d.has_volume("v1"))
        .collect();
    assert_eq!(chosen.len(), 1);
    let chosen = &chosen[0];
    assert!(["D1", "D2"].contains(&chosen.drive_id().as_str()));
    assert_eq!(chosen.free_capacity(), 80 * MIB);
    assert_eq!(chosen.allocated_capacity(), 20 * MIB);
    assert!(chosen.has_finalizer(&volume_finalizer("v1")));

    let stored = clients.volumes.get("v1").await.unwrap();
    assert!(stored.has_finalizer(PV_PROTECTION_FINALIZER));
    assert!(stored.has_finalizer(PURGE_PROTECTION_FINALIZER));
    assert_eq!(stored.drive_id(), chosen.drive_id());
    assert_cluster_consistent(&clients).await;
}

#[tokio::test]
async fn delete_volume_and_reclaim_capacity() {
    let (service, clients) = four_drives().await;
    bind_v1(&service).await;
    let drive_id = clients.volumes.get("v1").await.unwrap().drive_id().to_string();

    service
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: "v1".into(),
            ..Default::default()
        }))
        .await
        .unwrap();

    // purge-protection holds the object until the node cleans up
    let deleting = clients.volumes.get("v1").await.unwrap();
    assert!(deleting.is_deleting());
    assert!(!deleting.has_finalizer(PV_PROTECTION_FINALIZER));

    let node = VolumeEventHandler::new(clients.clone(), Arc::new(FakeNodeOps::new()), "n1");
    node.handle(EventKind::Update, Arc::new(deleting)).await.unwrap();

    assert!(clients.volumes.get("v1").await.unwrap_err().is_not_found());
    let drive = clients.drives.get(&drive_id).await.unwrap();
    assert_eq!(drive.free_capacity(), 100 * MIB);
    assert_eq!(drive.allocated_capacity(), 0);
    assert!(!drive.has_volume("v1"));
    assert_cluster_consistent(&clients).await;

    // deleting an absent volume is a success
    service
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: "v1".into(),
            ..Default::default()
        }))
        .await
        .unwrap();
}

#[tokio::test]
async fn refuse_deletion_of_a_staged_volume() {
    let (service, clients) = four_drives().await;
    let mut volume = DirectPVVolume::build(NewVolume {
        name: "v2",
        fsuuid: "D1",
        node_id: "n1",
        drive_id: "D1",
        drive_name: "sdb",
        size: MIB,
    });
    volume.status_mut().staging_target_path = "/stg".into();
    clients.volumes.create(&volume).await.unwrap();

    let status = service
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: "v2".into(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    let volume = clients.volumes.get("v2").await.unwrap();
    assert!(!volume.is_deleting());
    assert!(volume.has_finalizer(PV_PROTECTION_FINALIZER));
}

#[tokio::test]
async fn migrate_a_drive_across_schema_versions() {
    let stored = json!({
        "apiVersion": "directpv.min.io/v1beta1",
        "kind": "DirectPVDrive",
        "metadata": {"name": "D3"},
        "spec": {},
        "status": {
            "totalCapacity": 100,
            "freeCapacity": 100,
            "allocatedCapacity": 0,
            "path": "/direct-csi/dev/sdc-part-2",
            "driveStatus": "Ready",
            "filesystemUUID": "fs-d3",
            "modelNumber": "QEMU",
            "nodeName": "n2",
        },
    });

    let latest = Converter::global().migrate_to_latest(&stored).unwrap();
    assert_eq!(latest["apiVersion"], "directpv.min.io/v1");
    assert_eq!(latest["status"]["path"], "/dev/sdc2");

    let drive: DirectPVDrive = serde_json::from_value(latest).unwrap();
    assert_eq!(drive.label(LabelKey::Version), Some("v1beta1"));
    assert_eq!(drive.node_id(), "n2");
    assert_eq!(drive.fsuuid(), "fs-d3");

    let clients = Clients::fake();
    clients.drives.create(&drive).await.unwrap();
    let fetched = clients.drives.get("D3").await.unwrap();
    assert_eq!(fetched.status.as_ref().unwrap().path, "/dev/sdc2");
}

#[tokio::test]
async fn topology_starvation() {
    let clients = Clients::fake();
    seed_drives(
        &clients,
        (1..=5).map(|i| drive(&format!("D{i}"), "n1", "a", 100 * MIB)).collect(),
    )
    .await;
    let service = ControllerService::new(clients.clone());

    let request = with_topology(
        create_request("v1", 10),
        Vec::new(),
        vec![topology(&[(LabelKey::TopologyZone, "b")])],
    );
    let status = service.create_volume(Request::new(request)).await.unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);
    assert!(status.message().contains("10 bytes"), "{}", status.message());
    assert!(all_volumes(&clients).await.is_empty());
}

#[tokio::test]
async fn expand_beyond_free_capacity() {
    let clients = Clients::fake();
    let mut d1 = drive("D1", "n1", "a", 150 * MIB);
    d1.reserve("v3", 100 * MIB);
    seed_drives(&clients, vec![d1]).await;
    let volume = DirectPVVolume::build(NewVolume {
        name: "v3",
        fsuuid: "D1",
        node_id: "n1",
        drive_id: "D1",
        drive_name: "sdb",
        size: 100 * MIB,
    });
    clients.volumes.create(&volume).await.unwrap();
    let service = ControllerService::new(clients.clone());

    let status = service
        .controller_expand_volume(Request::new(ControllerExpandVolumeRequest {
            volume_id: "v3".into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 200 * MIB,
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::OutOfRange);

    let drive = clients.drives.get("D1").await.unwrap();
    assert_eq!(drive.free_capacity(), 50 * MIB);
    assert_eq!(drive.allocated_capacity(), 100 * MIB);
}
