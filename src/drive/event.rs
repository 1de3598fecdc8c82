//! Drive reconciler
//!
//! Keeps each drive of this node consistent with the volumes carved out of it:
//! capacity is recomputed from the live volumes, reservation finalizers are
//! repaired, lost devices are flagged and deleted drives are released.

use crate::client::{Clients, EventReason, EventType, ListOptions};
use crate::controller::{EventHandler, EventKind};
use crate::crd::{
    volume_finalizer, DirectPVDrive, DirectResource, DriveHealth, LabelKey, DATA_PROTECTION_FINALIZER,
    VOLUME_FINALIZER_PREFIX,
};
use crate::error::{Error, Result};
use crate::lister::{LabelSelector, VolumeLister};
use crate::node::{drive_mount_point, NodeOps};
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct DriveEventHandler {
    clients: Clients,
    ops: Arc<dyn NodeOps>,
    node_id: String,
    mount_root: PathBuf,
}

impl DriveEventHandler {
    pub fn new(clients: Clients, ops: Arc<dyn NodeOps>, node_id: impl Into<String>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            clients,
            ops,
            node_id: node_id.into(),
            mount_root: mount_root.into(),
        }
    }

    /// Unmount a deleted drive once no volume is reserved on it
    async fn release(&self, drive: &DirectPVDrive) -> Result<()> {
        let drive_id = drive.drive_id();
        let volumes = drive.volume_names();
        if !volumes.is_empty() {
            return Err(Error::FailedPrecondition(format!(
                "drive {drive_id} still hosts volumes {}",
                volumes.join(",")
            )));
        }
        if !drive.has_finalizer(DATA_PROTECTION_FINALIZER) {
            return Ok(());
        }
        if !drive.fsuuid().is_empty() {
            self.ops
                .unmount(&drive_mount_point(&self.mount_root, drive.fsuuid()))
                .await?;
        }
        let mut drive = drive.clone();
        drive.remove_finalizer(DATA_PROTECTION_FINALIZER);
        self.clients.drives.update(&drive).await?;
        info!(drive = %drive_id, "drive released");
        Ok(())
    }

    /// Flag a drive whose filesystem no longer resolves to a device. Returns
    /// the health the drive should have.
    async fn check_device(&self, drive: &DirectPVDrive) -> Result<DriveHealth> {
        match self.ops.device_by_fsuuid(drive.fsuuid()).await {
            Ok(_) if drive.health() == DriveHealth::Lost => Ok(DriveHealth::Ready),
            Ok(_) => Ok(drive.health()),
            Err(Error::DeviceNotFound { .. }) => {
                if drive.health() != DriveHealth::Lost {
                    self.clients
                        .events
                        .record(
                            drive.object_ref(&()),
                            EventType::Warning,
                            EventReason::DriveHasMountError,
                            format!("no device found for FSUUID {}", drive.fsuuid()),
                        )
                        .await;
                    warn!(drive = %drive.drive_id(), fsuuid = %drive.fsuuid(), "drive lost");
                }
                Ok(DriveHealth::Lost)
            }
            Err(e) => Err(e),
        }
    }

    async fn sync(&self, drive: &DirectPVDrive) -> Result<()> {
        let drive_id = drive.drive_id();
        let volumes = VolumeLister::new(self.clients.volumes.clone())
            .drive_ids([drive_id.clone()])
            .get(CancellationToken::new())
            .await?;
        let live: Vec<_> = volumes.iter().filter(|v| !v.is_deleting()).collect();
        let allocated: i64 = live.iter().map(|v| v.reserved_capacity()).sum();
        let wanted: BTreeSet<String> = live.iter().map(|v| volume_finalizer(&v.name_any())).collect();

        let mut desired = drive.clone();
        desired
            .finalizers_mut()
            .retain(|f| !f.starts_with(VOLUME_FINALIZER_PREFIX) || wanted.contains(f));
        for finalizer in &wanted {
            desired.add_finalizer(finalizer);
        }
        if desired.spec.relabel {
            let tier = desired.access_tier().to_string();
            desired.set_label(LabelKey::AccessTier, &tier);
            desired.spec.relabel = false;
        }

        let health = self.check_device(drive).await?;
        let status = desired.status_mut();
        status.allocated_capacity = allocated;
        status.free_capacity = status.total_capacity - allocated;
        status.status = health;

        let mut current = drive.clone();
        if desired.meta().finalizers != drive.meta().finalizers
            || desired.labels() != drive.labels()
            || desired.spec != drive.spec
        {
            debug!(drive = %drive_id, "repairing drive metadata");
            current = self.clients.drives.update(&desired).await?;
        }
        if current.status != desired.status {
            current.status = desired.status.clone();
            self.clients.drives.update_status(&current).await?;
            debug!(drive = %drive_id, allocated, "drive status updated");
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<DirectPVDrive> for DriveEventHandler {
    fn name(&self) -> &str {
        "drive"
    }

    fn list_options(&self) -> ListOptions {
        ListOptions {
            selector: LabelSelector::new().equals(LabelKey::Node, &self.node_id),
            ..Default::default()
        }
    }

    async fn handle(&self, kind: EventKind, drive: Arc<DirectPVDrive>) -> Result<()> {
        match kind {
            EventKind::Delete => Ok(()),
            _ if drive.is_deleting() => self.release(&drive).await,
            _ => self.sync(&drive).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryEventRecorder;
    use crate::crd::{DirectPVVolume, DriveStatus, NewVolume};
    use crate::node::FakeNodeOps;

    async fn setup() -> (Clients, Arc<FakeNodeOps>, Arc<MemoryEventRecorder>, DriveEventHandler) {
        let mut clients = Clients::fake();
        let events = Arc::new(MemoryEventRecorder::default());
        clients.events = events.clone();
        let ops = Arc::new(FakeNodeOps::new());
        ops.add_device("fs1", "/dev/sdb");

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
        drive.reserve("gone", 30);
        clients.drives.create(&drive).await.unwrap();

        for (name, size) in [("v1", 10), ("v2", 15)] {
            let volume = DirectPVVolume::build(NewVolume {
                name,
                fsuuid: "fs1",
                node_id: "n1",
                drive_id: "d1",
                drive_name: "sdb",
                size,
            });
            clients.volumes.create(&volume).await.unwrap();
        }
        let handler = DriveEventHandler::new(clients.clone(), ops.clone(), "n1", "/mnt");
        (clients, ops, events, handler)
    }

    #[tokio::test]
    async fn test_sync_recomputes_capacity_and_finalizers() {
        let (clients, _, _, handler) = setup().await;
        let drive = Arc::new(clients.drives.get("d1").await.unwrap());
        handler.handle(EventKind::Update, drive).await.unwrap();

        let drive = clients.drives.get("d1").await.unwrap();
        assert_eq!(drive.allocated_capacity(), 25);
        assert_eq!(drive.free_capacity(), 75);
        assert!(drive.capacity_consistent());
        let mut names = drive.volume_names();
        names.sort();
        assert_eq!(names, vec!["v1".to_string(), "v2".to_string()]);
        assert!(drive.has_finalizer(DATA_PROTECTION_FINALIZER));

        // converged drives are not written again
        let version = drive.resource_version();
        handler.handle(EventKind::Update, Arc::new(drive)).await.unwrap();
        assert_eq!(clients.drives.get("d1").await.unwrap().resource_version(), version);
    }

    #[tokio::test]
    async fn test_sync_counts_pending_expansion() {
        let (clients, _, _, handler) = setup().await;
        let mut volume = clients.volumes.get("v1").await.unwrap();
        volume.status_mut().reserved_capacity = 40;
        clients.volumes.update_status(&volume).await.unwrap();

        let drive = Arc::new(clients.drives.get("d1").await.unwrap());
        handler.handle(EventKind::Update, drive).await.unwrap();
        let drive = clients.drives.get("d1").await.unwrap();
        assert_eq!(drive.allocated_capacity(), 55);
        assert_eq!(drive.free_capacity(), 45);

        // applying the expansion on the node does not move the drive figures
        let mut volume = clients.volumes.get("v1").await.unwrap();
        volume.status_mut().total_capacity = 40;
        clients.volumes.update_status(&volume).await.unwrap();
        handler.handle(EventKind::Update, Arc::new(drive)).await.unwrap();
        assert_eq!(clients.drives.get("d1").await.unwrap().free_capacity(), 45);
    }

    #[tokio::test]
    async fn test_lost_device() {
        let (clients, ops, events, handler) = setup().await;
        ops.remove_device("fs1");
        let drive = Arc::new(clients.drives.get("d1").await.unwrap());
        handler.handle(EventKind::Update, drive).await.unwrap();

        let drive = clients.drives.get("d1").await.unwrap();
        assert_eq!(drive.health(), DriveHealth::Lost);
        assert!(events.has_reason(EventReason::DriveHasMountError));

        ops.add_device("fs1", "/dev/sdb");
        handler.handle(EventKind::Update, Arc::new(drive)).await.unwrap();
        assert_eq!(clients.drives.get("d1").await.unwrap().health(), DriveHealth::Ready);
    }

    #[tokio::test]
    async fn test_release_waits_for_volumes() {
        let (clients, ops, _, handler) = setup().await;
        ops.mount_xfs(std::path::Path::new("/dev/sdb"), std::path::Path::new("/mnt/fs1"))
            .await
            .unwrap();
        clients.drives.delete("d1").await.unwrap();
        let drive = Arc::new(clients.drives.get("d1").await.unwrap());
        let err = handler.handle(EventKind::Update, drive).await.unwrap_err();
        assert!(err.is_retryable());

        let mut drive = clients.drives.get("d1").await.unwrap();
        drive.release("gone", 30);
        let drive = clients.drives.update(&drive).await.unwrap();
        handler.handle(EventKind::Update, Arc::new(drive)).await.unwrap();
        assert!(clients.drives.get("d1").await.unwrap_err().is_not_found());
        assert!(!ops.is_mount_point("/mnt/fs1"));
    }
}
