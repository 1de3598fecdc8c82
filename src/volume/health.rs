//! Volume health monitor
//!
//! Periodically checks that every staged or published volume on this node is
//! still mounted where its status says, and records the result in the
//! volume's `Error` condition.

use crate::client::Clients;
use crate::crd::{DirectPVVolume, CONDITION_ERROR, REASON_NOT_MOUNTED, REASON_NO_ERROR};
use crate::error::Result;
use crate::lister::VolumeLister;
use crate::node::{MountTable, NodeOps};
use kube::ResourceExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct VolumeHealthMonitor {
    clients: Clients,
    ops: Arc<dyn NodeOps>,
    node_id: String,
    interval: Duration,
}

/// `Some(message)` naming the first path that is not mounted
fn unmounted_path(table: &MountTable, volume: &DirectPVVolume) -> Option<String> {
    if volume.is_published() && !table.is_mount_point(Path::new(volume.target_path())) {
        return Some(format!("target path {} is not mounted", volume.target_path()));
    }
    if volume.is_staged() && !table.is_mount_point(Path::new(volume.staging_target_path())) {
        return Some(format!(
            "staging target path {} is not mounted",
            volume.staging_target_path()
        ));
    }
    None
}

impl VolumeHealthMonitor {
    pub fn new(clients: Clients, ops: Arc<dyn NodeOps>, node_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            clients,
            ops,
            node_id: node_id.into(),
            interval,
        }
    }

    /// Check until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "starting volume health monitor");
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.check_volumes(cancel.child_token()).await {
                        warn!(error = %e, "volume health check failed");
                    }
                }
            }
        }
        info!("volume health monitor stopped");
    }

    /// One pass over the staged or published volumes of this node
    pub async fn check_volumes(&self, cancel: CancellationToken) -> Result<()> {
        let volumes = VolumeLister::new(self.clients.volumes.clone())
            .node_id(&self.node_id)
            .staged_or_published()
            .get(cancel)
            .await?;
        let table = self.ops.mount_table().await?;

        let mut first_error = None;
        for volume in volumes {
            if let Err(e) = self.check_volume(&table, volume).await {
                warn!(error = %e, "unable to update volume condition");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn check_volume(&self, table: &MountTable, mut volume: DirectPVVolume) -> Result<()> {
        let changed = match unmounted_path(table, &volume) {
            Some(message) => {
                warn!(volume = %volume.name_any(), %message, "volume is not mounted");
                volume.set_condition(CONDITION_ERROR, true, REASON_NOT_MOUNTED, &message)
            }
            None => volume.set_condition(CONDITION_ERROR, false, REASON_NO_ERROR, ""),
        };
        if !changed {
            return Ok(());
        }
        debug!(volume = %volume.name_any(), "updating volume error condition");
        self.clients.volumes.update_status(&volume).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NewVolume;
    use crate::node::FakeNodeOps;

    async fn staged_volume(clients: &Clients, name: &str, node: &str) {
        let mut volume = DirectPVVolume::build(NewVolume {
            name,
            fsuuid: "fs1",
            node_id: node,
            drive_id: "d1",
            drive_name: "sdb",
            size: 10,
        });
        let status = volume.status_mut();
        status.staging_target_path = format!("/stg/{name}");
        status.target_path = format!("/pods/{name}");
        clients.volumes.create(&volume).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_conditions() {
        let clients = Clients::fake();
        staged_volume(&clients, "v1", "n1").await;
        staged_volume(&clients, "v2", "n2").await;

        let ops = Arc::new(FakeNodeOps::new());
        ops.mkdir_all(Path::new("/data/v1")).await.unwrap();
        ops.bind_mount(Path::new("/data/v1"), Path::new("/stg/v1"), false).await.unwrap();

        let monitor = VolumeHealthMonitor::new(clients.clone(), ops.clone(), "n1", Duration::from_secs(60));
        monitor.check_volumes(CancellationToken::new()).await.unwrap();

        let v1 = clients.volumes.get("v1").await.unwrap();
        let condition = v1.condition(CONDITION_ERROR).unwrap();
        assert!(condition.status);
        assert_eq!(condition.reason, REASON_NOT_MOUNTED);
        assert!(condition.message.contains("/pods/v1"));
        assert!(clients.volumes.get("v2").await.unwrap().condition(CONDITION_ERROR).is_none());

        ops.bind_mount(Path::new("/stg/v1"), Path::new("/pods/v1"), false).await.unwrap();
        monitor.check_volumes(CancellationToken::new()).await.unwrap();
        let v1 = clients.volumes.get("v1").await.unwrap();
        let condition = v1.condition(CONDITION_ERROR).unwrap();
        assert!(!condition.status);
        assert_eq!(condition.reason, REASON_NO_ERROR);

        // a healthy pass with nothing new does not write
        let version = v1.resource_version();
        monitor.check_volumes(CancellationToken::new()).await.unwrap();
        assert_eq!(clients.volumes.get("v1").await.unwrap().resource_version(), version);
    }
}
