//! Full volume lifecycle across the controller, the node service and the
//! node-side reconcilers, checking the cluster invariants after every step

mod common;

use common::*;
use directpv::client::Clients;
use directpv::controller::{EventHandler, EventKind};
use directpv::crd::{DirectResource, VolumeState, CONDITION_ERROR};
use directpv::csi::proto::controller_server::Controller;
use directpv::csi::proto::node_server::Node;
use directpv::csi::proto::*;
use directpv::csi::{ControllerService, NodeService, NodeServiceConfig};
use directpv::drive::DriveEventHandler;
use directpv::node::FakeNodeOps;
use directpv::volume::{VolumeEventHandler, VolumeHealthMonitor, VolumeReservationRepairer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request};

struct Cluster {
    clients: Clients,
    ops: Arc<FakeNodeOps>,
    controller: ControllerService,
    node: NodeService,
}

async fn cluster() -> Cluster {
    let clients = Clients::fake();
    seed_drives(&clients, vec![drive("D1", "n1", "a", 100 * MIB)]).await;
    let ops = Arc::new(FakeNodeOps::new());
    ops.add_device("D1", "/dev/sdb");

    let mut config = NodeServiceConfig::new("n1");
    config.mount_root = PathBuf::from("/mnt");
    config.tmpfs_dir = PathBuf::from("/tmpfs");
    Cluster {
        controller: ControllerService::new(clients.clone()),
        node: NodeService::new(clients.clone(), ops.clone(), config),
        clients,
        ops,
    }
}

fn stage_request() -> NodeStageVolumeRequest {
    NodeStageVolumeRequest {
        volume_id: "v1".into(),
        staging_target_path: "/stg/v1".into(),
        volume_capability: Some(xfs_capability()),
        ..Default::default()
    }
}

fn publish_request() -> NodePublishVolumeRequest {
    NodePublishVolumeRequest {
        volume_id: "v1".into(),
        staging_target_path: "/stg/v1".into(),
        target_path: "/pods/p1/v1".into(),
        volume_capability: Some(xfs_capability()),
        ..Default::default()
    }
}

#[tokio::test]
async fn volume_lifecycle() {
    let c = cluster().await;

    // create twice: one volume, one reservation
    let first = c
        .controller
        .create_volume(Request::new(create_request("v1", 10 * MIB)))
        .await
        .unwrap()
        .into_inner();
    let second = c
        .controller
        .create_volume(Request::new(create_request("v1", 10 * MIB)))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(first, second);
    assert_eq!(all_volumes(&c.clients).await.len(), 1);
    assert_eq!(c.clients.drives.get("D1").await.unwrap().volume_names(), vec!["v1".to_string()]);
    assert_cluster_consistent(&c.clients).await;

    // stage twice: the second call changes nothing
    c.node.node_stage_volume(Request::new(stage_request())).await.unwrap();
    let mounts = c.ops.mounts().len();
    c.node.node_stage_volume(Request::new(stage_request())).await.unwrap();
    assert_eq!(c.ops.mounts().len(), mounts);
    let volume = c.clients.volumes.get("v1").await.unwrap();
    assert!(volume.is_staged());
    assert_eq!(volume.state(), VolumeState::Ready);
    assert_eq!(c.ops.quota("v1").unwrap().hard_limit, 10 * MIB);

    // a staged volume cannot be deleted
    let status = c
        .controller
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: "v1".into(),
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    c.node.node_publish_volume(Request::new(publish_request())).await.unwrap();
    assert!(c.ops.is_mount_point("/pods/p1/v1"));
    assert!(c.clients.volumes.get("v1").await.unwrap().is_published());
    assert_cluster_consistent(&c.clients).await;

    // healthy mounts keep the error condition clear
    let monitor = VolumeHealthMonitor::new(c.clients.clone(), c.ops.clone(), "n1", Duration::from_secs(60));
    monitor.check_volumes(CancellationToken::new()).await.unwrap();
    let volume = c.clients.volumes.get("v1").await.unwrap();
    assert!(!volume.condition(CONDITION_ERROR).unwrap().status);

    // usage comes from the project quota
    c.ops.set_usage("v1", 4 * MIB);
    let stats = c
        .node
        .node_get_volume_stats(Request::new(NodeGetVolumeStatsRequest {
            volume_id: "v1".into(),
            volume_path: "/pods/p1/v1".into(),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(stats.usage[0].used, 4 * MIB);
    assert_eq!(stats.usage[0].available, 6 * MIB);
    assert!(!stats.volume_condition.unwrap().abnormal);

    // expand: controller reserves, node bumps the quota
    let expanded = c
        .controller
        .controller_expand_volume(Request::new(ControllerExpandVolumeRequest {
            volume_id: "v1".into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 30 * MIB,
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(expanded.node_expansion_required);
    c.node
        .node_expand_volume(Request::new(NodeExpandVolumeRequest {
            volume_id: "v1".into(),
            volume_path: "/pods/p1/v1".into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 30 * MIB,
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(c.ops.quota("v1").unwrap().hard_limit, 30 * MIB);
    assert_eq!(c.clients.volumes.get("v1").await.unwrap().total_capacity(), 30 * MIB);
    let drive = c.clients.drives.get("D1").await.unwrap();
    assert_eq!(drive.free_capacity(), 70 * MIB);
    assert_cluster_consistent(&c.clients).await;

    c.node
        .node_unpublish_volume(Request::new(NodeUnpublishVolumeRequest {
            volume_id: "v1".into(),
            target_path: "/pods/p1/v1".into(),
        }))
        .await
        .unwrap();
    c.node
        .node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: "/stg/v1".into(),
        }))
        .await
        .unwrap();
    let volume = c.clients.volumes.get("v1").await.unwrap();
    assert!(!volume.is_staged());
    assert!(!volume.is_published());
    assert!(!c.ops.is_mount_point("/stg/v1"));

    c.controller
        .delete_volume(Request::new(DeleteVolumeRequest {
            volume_id: "v1".into(),
            ..Default::default()
        }))
        .await
        .unwrap();
    let deleting = c.clients.volumes.get("v1").await.unwrap();
    let data_path = deleting.data_path().to_string();
    assert!(c.ops.is_dir(&data_path));

    let purger = VolumeEventHandler::new(c.clients.clone(), c.ops.clone(), "n1");
    purger.handle(EventKind::Update, Arc::new(deleting)).await.unwrap();
    assert!(c.clients.volumes.get("v1").await.unwrap_err().is_not_found());
    assert!(!c.ops.is_dir(&data_path));

    let drive = c.clients.drives.get("D1").await.unwrap();
    assert_eq!(drive.free_capacity(), 100 * MIB);
    assert!(drive.volume_names().is_empty());
    assert_cluster_consistent(&c.clients).await;
}

#[tokio::test]
async fn lost_reservation_is_repaired_and_recounted() {
    let c = cluster().await;
    c.controller
        .create_volume(Request::new(create_request("v1", 10 * MIB)))
        .await
        .unwrap();

    // lose the drive-side half of the reservation
    let mut drive = c.clients.drives.get("D1").await.unwrap();
    drive.release("v1", 10 * MIB);
    c.clients.drives.update(&drive).await.unwrap();

    let volume = Arc::new(c.clients.volumes.get("v1").await.unwrap());
    VolumeReservationRepairer::new(c.clients.clone())
        .handle(EventKind::Update, volume)
        .await
        .unwrap();
    assert!(c.clients.drives.get("D1").await.unwrap().has_volume("v1"));

    // the node reconciler recomputes capacity from the volume records
    let mut drive = c.clients.drives.get("D1").await.unwrap();
    drive.status_mut().free_capacity = 3;
    drive.status_mut().allocated_capacity = 7;
    let drive = c.clients.drives.update_status(&drive).await.unwrap();
    DriveEventHandler::new(c.clients.clone(), c.ops.clone(), "n1", "/mnt")
        .handle(EventKind::Update, Arc::new(drive))
        .await
        .unwrap();

    let drive = c.clients.drives.get("D1").await.unwrap();
    assert_eq!(drive.allocated_capacity(), 10 * MIB);
    assert_eq!(drive.free_capacity(), 90 * MIB);
    assert_cluster_consistent(&c.clients).await;
}

fn expand(size: i64) -> ControllerExpandVolumeRequest {
    ControllerExpandVolumeRequest {
        volume_id: "v1".into(),
        capacity_range: Some(CapacityRange {
            required_bytes: size,
            limit_bytes: 0,
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn expansion_survives_retries_and_drive_resync() {
    let c = cluster().await;
    c.controller
        .create_volume(Request::new(create_request("v1", 10 * MIB)))
        .await
        .unwrap();
    c.node.node_stage_volume(Request::new(stage_request())).await.unwrap();
    let reconciler = DriveEventHandler::new(c.clients.clone(), c.ops.clone(), "n1", "/mnt");
    let resync = || async {
        let drive = c.clients.drives.get("D1").await.unwrap();
        reconciler.handle(EventKind::Update, Arc::new(drive)).await.unwrap();
        c.clients.drives.get("D1").await.unwrap().free_capacity()
    };

    // the resizer retries after a timeout
    for _ in 0..2 {
        c.controller.controller_expand_volume(Request::new(expand(30 * MIB))).await.unwrap();
    }
    assert_eq!(c.clients.drives.get("D1").await.unwrap().free_capacity(), 70 * MIB);
    assert_cluster_consistent(&c.clients).await;

    // the drive event raised by the expansion keeps the reservation
    assert_eq!(resync().await, 70 * MIB);

    c.node
        .node_expand_volume(Request::new(NodeExpandVolumeRequest {
            volume_id: "v1".into(),
            volume_path: "/stg/v1".into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 30 * MIB,
                limit_bytes: 0,
            }),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(c.ops.quota("v1").unwrap().hard_limit, 30 * MIB);
    assert_eq!(resync().await, 70 * MIB);
    assert_cluster_consistent(&c.clients).await;

    // the controller sees the applied size and asks for nothing more
    let response = c
        .controller
        .controller_expand_volume(Request::new(expand(30 * MIB)))
        .await
        .unwrap()
        .into_inner();
    assert!(!response.node_expansion_required);
    assert_eq!(c.clients.drives.get("D1").await.unwrap().free_capacity(), 70 * MIB);
}
