//! Volume reservation repairer
//!
//! CreateVolume writes the volume before reserving capacity on its drive. If
//! the second write is lost, the drive never learns about the volume; this
//! controller-side handler puts the reservation back.

use crate::client::Clients;
use crate::controller::{EventHandler, EventKind};
use crate::crd::{DirectPVVolume, DirectResource};
use crate::error::Result;
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{info, warn};

pub struct VolumeReservationRepairer {
    clients: Clients,
}

impl VolumeReservationRepairer {
    pub fn new(clients: Clients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl EventHandler<DirectPVVolume> for VolumeReservationRepairer {
    fn name(&self) -> &str {
        "volume-reservation"
    }

    async fn handle(&self, kind: EventKind, volume: Arc<DirectPVVolume>) -> Result<()> {
        if kind == EventKind::Delete || volume.is_deleting() || volume.drive_id().is_empty() {
            return Ok(());
        }
        let name = volume.name_any();
        let mut drive = match self.clients.drives.get(volume.drive_id()).await {
            Ok(drive) => drive,
            Err(e) if e.is_not_found() => {
                warn!(volume = %name, drive = %volume.drive_id(), "drive of volume not found");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !drive.reserve(&name, volume.reserved_capacity()) {
            return Ok(());
        }
        self.clients.drives.update(&drive).await?;
        info!(volume = %name, drive = %volume.drive_id(), "restored missing drive reservation");
        Ok(())
    }
}
