//! Volume deletion reconciler
//!
//! Once the controller drops `pv-protection`, the node owning the volume
//! unmounts it, removes its data directory, returns its capacity to the drive
//! and finally drops `purge-protection`. Every step tolerates having already
//! run, so a requeue after a partial pass is safe.

use crate::client::{ListOptions, Clients, EventReason, EventType};
use crate::controller::{EventHandler, EventKind};
use crate::crd::{DirectPVVolume, DirectResource, LabelKey, PURGE_PROTECTION_FINALIZER};
use crate::error::{Error, Result};
use crate::lister::LabelSelector;
use crate::node::NodeOps;
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct VolumeEventHandler {
    clients: Clients,
    ops: Arc<dyn NodeOps>,
    node_id: String,
}

impl VolumeEventHandler {
    pub fn new(clients: Clients, ops: Arc<dyn NodeOps>, node_id: impl Into<String>) -> Self {
        Self {
            clients,
            ops,
            node_id: node_id.into(),
        }
    }

    async fn unmount_if_set(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        self.ops.unmount(Path::new(path)).await
    }

    /// Drop the drive's reservation for `volume` and give its bytes back
    async fn release_drive(&self, volume: &DirectPVVolume) -> Result<()> {
        let name = volume.name_any();
        let drive_id = volume.drive_id();
        if drive_id.is_empty() {
            warn!(volume = %name, "volume has no drive ID; skipping drive release");
            return Ok(());
        }
        let mut drive = match self.clients.drives.get(drive_id).await {
            Ok(drive) => drive,
            Err(e) if e.is_not_found() => {
                warn!(volume = %name, drive = %drive_id, "drive of deleted volume not found");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !drive.release(&name, volume.reserved_capacity()) {
            return Ok(());
        }
        let drive = self.clients.drives.update(&drive).await?;
        self.clients
            .events
            .record(
                drive.object_ref(&()),
                EventType::Normal,
                EventReason::VolumeReleased,
                format!("volume {name} released from drive {drive_id}"),
            )
            .await;
        Ok(())
    }

    async fn purge(&self, volume: &DirectPVVolume) -> Result<()> {
        let name = volume.name_any();
        if !volume.only_purge_protection_left() {
            return Err(Error::FailedPrecondition(format!(
                "volume {name} still carries finalizers {:?}",
                volume.finalizers()
            )));
        }

        self.unmount_if_set(volume.target_path()).await?;
        self.unmount_if_set(volume.staging_target_path()).await?;

        if volume.data_path().is_empty() {
            warn!(volume = %name, "volume has no data path; skipping data removal");
        } else {
            self.ops.remove_all(Path::new(volume.data_path())).await?;
        }

        self.release_drive(volume).await?;

        let mut latest = match self.clients.volumes.get(&name).await {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if latest.remove_finalizer(PURGE_PROTECTION_FINALIZER) {
            self.clients.volumes.update(&latest).await?;
        }
        info!(volume = %name, "volume purged");
        Ok(())
    }
}

#[async_trait]
impl EventHandler<DirectPVVolume> for VolumeEventHandler {
    fn name(&self) -> &str {
        "volume"
    }

    fn list_options(&self) -> ListOptions {
        ListOptions {
            selector: LabelSelector::new().equals(LabelKey::Node, &self.node_id),
            ..Default::default()
        }
    }

    async fn handle(&self, kind: EventKind, volume: Arc<DirectPVVolume>) -> Result<()> {
        if kind == EventKind::Delete || !volume.is_deleting() {
            return Ok(());
        }
        if !volume.has_finalizer(PURGE_PROTECTION_FINALIZER) {
            debug!(volume = %volume.name_any(), "volume already purged");
            return Ok(());
        }
        self.purge(&volume).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryEventRecorder;
    use crate::crd::{DirectPVDrive, DriveStatus, NewVolume, PV_PROTECTION_FINALIZER};
    use crate::node::FakeNodeOps;

    async fn setup() -> (Clients, Arc<FakeNodeOps>, Arc<MemoryEventRecorder>) {
        let mut clients = Clients::fake();
        let events = Arc::new(MemoryEventRecorder::default());
        clients.events = events.clone();

        let mut drive = DirectPVDrive::build(
            "d1",
            "n1",
            "sdb",
            DriveStatus {
                total_capacity: 100,
                free_capacity: 100,
                fsuuid: "fs1".into(),
                ..Default::default()
            },
        );
        drive.reserve("v1", 20);
        clients.drives.create(&drive).await.unwrap();

        let mut volume = DirectPVVolume::build(NewVolume {
            name: "v1",
            fsuuid: "fs1",
            node_id: "n1",
            drive_id: "d1",
            drive_name: "sdb",
            size: 20,
        });
        let status = volume.status_mut();
        status.data_path = "/mnt/fs1/.FSUUID.fs1/v1".into();
        status.staging_target_path = "/stg/v1".into();
        clients.volumes.create(&volume).await.unwrap();

        let ops = Arc::new(FakeNodeOps::new());
        ops.mkdir_all(Path::new("/mnt/fs1/.FSUUID.fs1/v1")).await.unwrap();
        ops.bind_mount(Path::new("/mnt/fs1/.FSUUID.fs1/v1"), Path::new("/stg/v1"), false)
            .await
            .unwrap();
        (clients, ops, events)
    }

    async fn mark_deleted(clients: &Clients) -> Arc<DirectPVVolume> {
        let mut volume = clients.volumes.get("v1").await.unwrap();
        volume.remove_finalizer(PV_PROTECTION_FINALIZER);
        clients.volumes.update(&volume).await.unwrap();
        clients.volumes.delete("v1").await.unwrap();
        Arc::new(clients.volumes.get("v1").await.unwrap())
    }

    #[tokio::test]
    async fn test_purge_releases_drive() {
        let (clients, ops, events) = setup().await;
        let handler = VolumeEventHandler::new(clients.clone(), ops.clone(), "n1");
        let volume = mark_deleted(&clients).await;

        handler.handle(EventKind::Update, volume.clone()).await.unwrap();

        assert!(clients.volumes.get("v1").await.unwrap_err().is_not_found());
        let drive = clients.drives.get("d1").await.unwrap();
        assert_eq!(drive.free_capacity(), 100);
        assert_eq!(drive.allocated_capacity(), 0);
        assert!(drive.volume_names().is_empty());
        assert!(!ops.is_mount_point("/stg/v1"));
        assert!(!ops.is_dir("/mnt/fs1/.FSUUID.fs1/v1"));
        assert!(events.has_reason(EventReason::VolumeReleased));

        // a replayed event after the purge is harmless
        handler.handle(EventKind::Update, volume).await.unwrap();
        assert_eq!(clients.drives.get("d1").await.unwrap().free_capacity(), 100);
    }

    #[tokio::test]
    async fn test_purge_returns_pending_expansion() {
        let (clients, ops, _) = setup().await;
        let mut volume = clients.volumes.get("v1").await.unwrap();
        volume.status_mut().reserved_capacity = 50;
        clients.volumes.update_status(&volume).await.unwrap();
        let mut drive = clients.drives.get("d1").await.unwrap();
        drive.expand(30);
        clients.drives.update(&drive).await.unwrap();

        let handler = VolumeEventHandler::new(clients.clone(), ops, "n1");
        handler.handle(EventKind::Update, mark_deleted(&clients).await).await.unwrap();

        let drive = clients.drives.get("d1").await.unwrap();
        assert_eq!(drive.free_capacity(), 100);
        assert_eq!(drive.allocated_capacity(), 0);
    }

    #[tokio::test]
    async fn test_purge_waits_for_other_finalizers() {
        let (clients, ops, _) = setup().await;
        let handler = VolumeEventHandler::new(clients.clone(), ops.clone(), "n1");
        clients.volumes.delete("v1").await.unwrap();
        let volume = Arc::new(clients.volumes.get("v1").await.unwrap());

        let err = handler.handle(EventKind::Update, volume).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(ops.is_mount_point("/stg/v1"));
        assert_eq!(clients.drives.get("d1").await.unwrap().free_capacity(), 80);
    }

    #[tokio::test]
    async fn test_purge_tolerates_missing_drive_id() {
        let (clients, ops, _) = setup().await;
        let mut volume = clients.volumes.get("v1").await.unwrap();
        volume.remove_label(LabelKey::DriveId);
        clients.volumes.update(&volume).await.unwrap();
        let volume = mark_deleted(&clients).await;

        let handler = VolumeEventHandler::new(clients.clone(), ops, "n1");
        handler.handle(EventKind::Update, volume).await.unwrap();
        assert!(clients.volumes.get("v1").await.unwrap_err().is_not_found());
    }
}
