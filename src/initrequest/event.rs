//! InitRequest reconciler
//!
//! Formats the requested devices of this node, mounts them under the mount
//! root and publishes each as a Ready drive. Per-device failures are recorded
//! in the request status instead of failing the whole request.

use crate::client::{Clients, EventReason, EventType, ListOptions};
use crate::controller::{EventHandler, EventKind};
use crate::crd::{
    Device, DirectPVDrive, DirectPVInitRequest, DirectResource, DriveStatus, InitDevice, InitDeviceResult,
    InitStatus, LabelKey,
};
use crate::error::{Error, Result};
use crate::lister::{DriveLister, LabelSelector};
use crate::node::{drive_mount_point, meta_info_path, MetaInfo, NodeOps};
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct InitRequestEventHandler {
    clients: Clients,
    ops: Arc<dyn NodeOps>,
    node_id: String,
    mount_root: PathBuf,
    topology: BTreeMap<String, String>,
}

impl InitRequestEventHandler {
    pub fn new(
        clients: Clients,
        ops: Arc<dyn NodeOps>,
        node_id: impl Into<String>,
        mount_root: impl Into<PathBuf>,
        topology: BTreeMap<String, String>,
    ) -> Self {
        Self {
            clients,
            ops,
            node_id: node_id.into(),
            mount_root: mount_root.into(),
            topology,
        }
    }

    /// A live drive already published for `device` by an earlier pass
    async fn existing_drive(&self, device: &Device) -> Result<Option<String>> {
        let path = Path::new("/dev").join(&device.name).display().to_string();
        let drives = DriveLister::new(self.clients.drives.clone())
            .node_id(&self.node_id)
            .drive_name(&device.name)
            .get(CancellationToken::new())
            .await?;
        Ok(drives
            .into_iter()
            .find(|d| !d.is_deleting() && d.status.as_ref().is_some_and(|s| s.path == path))
            .map(|d| d.drive_id()))
    }

    /// Format, mount and publish one device; returns the new drive ID
    async fn init_device(&self, requested: &InitDevice, device: &Device) -> Result<String> {
        // a requeue after a failed status write must not format the disk again
        if let Some(drive_id) = self.existing_drive(device).await? {
            debug!(device = %device.name, drive = %drive_id, "device already initialized");
            return Ok(drive_id);
        }
        if !device.is_available() {
            return Err(Error::FailedPrecondition(format!(
                "device {} cannot be initialized: {}",
                device.name, device.denied_reason
            )));
        }
        if !device.fs.is_empty() && !requested.force {
            return Err(Error::FailedPrecondition(format!(
                "device {} has a {} filesystem; force is required",
                device.name, device.fs
            )));
        }

        let fsuuid = uuid::Uuid::new_v4().to_string();
        let path = Path::new("/dev").join(&device.name);
        self.ops.format_xfs(&path, &fsuuid, requested.force).await?;

        let mount_point = drive_mount_point(&self.mount_root, &fsuuid);
        self.ops.mkdir_all(&mount_point).await?;
        self.ops.mount_xfs(&path, &mount_point).await?;

        let meta = MetaInfo {
            fsuuid: fsuuid.clone(),
            node_id: self.node_id.clone(),
            drive_name: device.name.clone(),
        };
        let meta_path = meta_info_path(&self.mount_root, &fsuuid);
        if let Some(parent) = meta_path.parent() {
            self.ops.mkdir_all(parent).await?;
        }
        self.ops.write_file(&meta_path, &meta.to_bytes()?).await?;

        let drive = DirectPVDrive::build(
            &fsuuid,
            &self.node_id,
            &device.name,
            DriveStatus {
                total_capacity: device.size,
                free_capacity: device.size,
                fsuuid: fsuuid.clone(),
                topology: self.topology.clone(),
                make: device.make.clone(),
                path: path.display().to_string(),
                ..Default::default()
            },
        );
        let drive = self.clients.drives.create(&drive).await?;
        self.clients
            .events
            .record(
                drive.object_ref(&()),
                EventType::Normal,
                EventReason::DriveMounted,
                format!("drive {} mounted at {}", device.name, mount_point.display()),
            )
            .await;
        Ok(fsuuid)
    }

    async fn process(&self, request: &DirectPVInitRequest) -> Result<()> {
        let name = request.name_any();
        let node = self.clients.nodes.get(&self.node_id).await?;

        let mut results = Vec::with_capacity(request.spec.devices.len());
        for requested in &request.spec.devices {
            let outcome = match node.devices().iter().find(|d| d.id == requested.id) {
                Some(device) => self.init_device(requested, device).await,
                None => Err(Error::FailedPrecondition(format!(
                    "device {} ({}) not found on node {}",
                    requested.name, requested.id, self.node_id
                ))),
            };
            let error = match outcome {
                Ok(drive_id) => {
                    info!(request = %name, device = %requested.name, drive = %drive_id, "device initialized");
                    String::new()
                }
                Err(e) => {
                    warn!(request = %name, device = %requested.name, error = %e, "device initialization failed");
                    e.to_string()
                }
            };
            results.push(InitDeviceResult {
                name: requested.name.clone(),
                error,
            });
        }

        let failed = results.iter().any(|r| !r.error.is_empty());
        let mut updated = self.clients.init_requests.get(&name).await?;
        let status = updated.status.get_or_insert_with(Default::default);
        status.status = if failed { InitStatus::Error } else { InitStatus::Processed };
        status.results = results;
        self.clients.init_requests.update_status(&updated).await?;

        // formatted devices change what the node can offer next time
        let mut node = self.clients.nodes.get(&self.node_id).await?;
        if !node.spec.refresh {
            node.spec.refresh = true;
            self.clients.nodes.update(&node).await?;
        }
        info!(request = %name, failed, "init request processed");
        Ok(())
    }
}

#[async_trait]
impl EventHandler<DirectPVInitRequest> for InitRequestEventHandler {
    fn name(&self) -> &str {
        "initrequest"
    }

    fn list_options(&self) -> ListOptions {
        ListOptions {
            selector: LabelSelector::new().equals(LabelKey::Node, &self.node_id),
            ..Default::default()
        }
    }

    async fn handle(&self, kind: EventKind, request: Arc<DirectPVInitRequest>) -> Result<()> {
        if kind == EventKind::Delete
            || request.is_deleting()
            || request.spec.node_id != self.node_id
            || !request.is_pending()
        {
            return Ok(());
        }
        self.process(&request).await
    }
}
