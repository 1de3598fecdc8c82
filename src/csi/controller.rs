//! CSI controller service
//!
//! CreateVolume picks a drive, writes the Volume and reserves capacity on the
//! Drive through a volume finalizer. The two writes are not transactional; the
//! reservation repairer and the drive reconciler converge whatever a crash
//! leaves behind.

use super::proto::controller_server::Controller;
use super::proto::controller_service_capability::{self, rpc};
use super::proto::validate_volume_capabilities_response::Confirmed;
use super::proto::*;
use super::selector::{claimed_drive_ids, select_drive, Criteria, SelectionRequest};
use super::validate_capability;
use crate::client::{retry_on_conflict, Clients, EventReason, EventType};
use crate::crd::{
    DirectPVVolume, DirectResource, LabelKey, NewVolume, VolumeState, PV_PROTECTION_FINALIZER,
};
use crate::error::{Error, Result};
use crate::lister::{get_one, DriveLister, LabelSelector, VolumeLister, MAX_THREAD_COUNT};
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

pub struct ControllerService {
    clients: Clients,
    max_objects: u32,
}

impl ControllerService {
    pub fn new(clients: Clients) -> Self {
        Self {
            clients,
            max_objects: MAX_THREAD_COUNT,
        }
    }

    /// Page size of the drive and volume listings
    pub fn with_max_objects(mut self, max_objects: u32) -> Self {
        self.max_objects = max_objects.max(1);
        self
    }

    async fn create_volume_inner(&self, request: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument("volume name missing in request".into()));
        }
        if request.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument("volume capabilities missing in request".into()));
        }
        for capability in &request.volume_capabilities {
            validate_capability(capability)?;
        }

        let criteria = Criteria::from_parameters(&request.parameters)?;
        let size = request
            .capacity_range
            .as_ref()
            .map(|r| r.required_bytes)
            .unwrap_or(0);
        let (preferred, requisite) = request
            .accessibility_requirements
            .as_ref()
            .map(|t| {
                (
                    t.preferred.iter().map(|s| s.segments.clone()).collect(),
                    t.requisite.iter().map(|s| s.segments.clone()).collect(),
                )
            })
            .unwrap_or_default();
        let selection = SelectionRequest {
            name: request.name.clone(),
            required_bytes: size,
            criteria,
            preferred,
            requisite,
        };

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        let claimed = match &selection.criteria.claim_id {
            Some(claim_id) => {
                let selector = LabelSelector::new().equals(LabelKey::VolumeClaimId, claim_id);
                let volumes = VolumeLister::new(self.clients.volumes.clone())
                    .labels(&selector)
                    .max_objects(self.max_objects)
                    .get(cancel.clone())
                    .await?;
                claimed_drive_ids(volumes.iter().filter(|v| v.name_any() != request.name))
            }
            None => Default::default(),
        };

        let drives = DriveLister::new(self.clients.drives.clone())
            .max_objects(self.max_objects)
            .get(cancel.clone())
            .await?;
        let drive = select_drive(drives, &selection, &claimed)?;
        let drive_id = drive.drive_id();
        debug!(volume = %request.name, drive = %drive_id, "drive selected");

        let mut volume = DirectPVVolume::build(NewVolume {
            name: &request.name,
            fsuuid: drive.fsuuid(),
            node_id: drive.node_id(),
            drive_id: &drive_id,
            drive_name: drive.drive_name(),
            size,
        });
        if let Some(claim_id) = &selection.criteria.claim_id {
            volume.set_label(LabelKey::VolumeClaimId, claim_id);
        }
        self.create_or_adopt(&volume).await?;

        let claim_id = selection.criteria.claim_id.clone();
        let reserved = retry_on_conflict(|| {
            let drives = self.clients.drives.clone();
            let drive_id = drive_id.clone();
            let name = request.name.clone();
            let claim_id = claim_id.clone();
            async move {
                let mut drive = drives.get(&drive_id).await?;
                if !drive.reserve(&name, size) {
                    return Ok(drive);
                }
                if let Some(claim_id) = &claim_id {
                    drive.set_label(LabelKey::VolumeClaimId, claim_id);
                }
                drives.update(&drive).await
            }
        })
        .await?;

        self.clients
            .events
            .record(
                reserved.object_ref(&()),
                EventType::Normal,
                EventReason::VolumeAdded,
                format!("volume {} added to drive {}", request.name, drive_id),
            )
            .await;
        info!(volume = %request.name, drive = %drive_id, size, "volume created");

        Ok(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: size,
                volume_id: request.name,
                volume_context: request.parameters,
                content_source: None,
                accessible_topology: vec![Topology {
                    segments: reserved.topology().into_iter().collect(),
                }],
            }),
        })
    }

    /// Create the volume; on a retry, bring the stored object back in line
    async fn create_or_adopt(&self, volume: &DirectPVVolume) -> Result<()> {
        match self.clients.volumes.create(volume).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                let name = volume.name_any();
                retry_on_conflict(|| {
                    let volumes = self.clients.volumes.clone();
                    let name = name.clone();
                    async move {
                        let mut existing = volumes.get(&name).await?;
                        existing.meta_mut().labels = volume.meta().labels.clone();
                        existing.meta_mut().finalizers = volume.meta().finalizers.clone();
                        existing.status = volume.status.clone();
                        let updated = volumes.update(&existing).await?;
                        volumes.update_status(&updated).await
                    }
                })
                .await?;
                debug!(volume = %volume.name_any(), "adopted existing volume");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_volume_inner(&self, request: DeleteVolumeRequest) -> Result<DeleteVolumeResponse> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID missing in request".into()));
        }
        let Some(volume) = get_one(&self.clients.volumes, &request.volume_id).await? else {
            return Ok(DeleteVolumeResponse {});
        };
        if volume.state() == VolumeState::Copying {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is being copied",
                request.volume_id
            )));
        }
        if volume.is_staged() || volume.is_published() {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is still staged or published",
                request.volume_id
            )));
        }

        retry_on_conflict(|| {
            let volumes = self.clients.volumes.clone();
            let name = request.volume_id.clone();
            async move {
                let mut volume = match volumes.get(&name).await {
                    Ok(volume) => volume,
                    Err(e) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e),
                };
                if volume.remove_finalizer(PV_PROTECTION_FINALIZER) {
                    volumes.update(&volume).await?;
                }
                Ok(())
            }
        })
        .await?;

        match self.clients.volumes.delete(&request.volume_id).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        info!(volume = %request.volume_id, "volume deleted");
        Ok(DeleteVolumeResponse {})
    }

    async fn set_reserved(&self, name: &str, reserved: i64) -> Result<()> {
        retry_on_conflict(|| {
            let volumes = self.clients.volumes.clone();
            async move {
                let mut volume = volumes.get(name).await?;
                volume.status_mut().reserved_capacity = reserved;
                volumes.update_status(&volume).await.map(|_| ())
            }
        })
        .await
    }

    async fn expand_volume_inner(&self, request: ControllerExpandVolumeRequest) -> Result<ControllerExpandVolumeResponse> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID missing in request".into()));
        }
        let requested = request
            .capacity_range
            .as_ref()
            .map(|r| r.required_bytes)
            .ok_or_else(|| Error::InvalidArgument("capacity range missing in request".into()))?;

        let volume = self.clients.volumes.get(&request.volume_id).await?;
        let total = volume.total_capacity();
        if total >= requested {
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: total,
                node_expansion_required: false,
            });
        }
        // a retried expansion finds its bytes already held by the volume
        let held = volume.reserved_capacity();
        if held >= requested {
            debug!(volume = %request.volume_id, requested, "expansion already reserved");
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: requested,
                node_expansion_required: true,
            });
        }
        let delta = requested - held;
        let drive_id = volume.drive_id().to_string();

        let drive = self.clients.drives.get(&drive_id).await?;
        check_free(&drive_id, drive.free_capacity(), delta)?;

        // record on the volume first so the drive reconciler counts the new size
        self.set_reserved(&request.volume_id, requested).await?;
        let charged = retry_on_conflict(|| {
            let drives = self.clients.drives.clone();
            let drive_id = drive_id.clone();
            async move {
                let mut drive = drives.get(&drive_id).await?;
                check_free(&drive_id, drive.free_capacity(), delta)?;
                drive.expand(delta);
                drives.update(&drive).await
            }
        })
        .await;
        if let Err(e) = charged {
            if let Err(undo) = self.set_reserved(&request.volume_id, held).await {
                warn!(volume = %request.volume_id, error = %undo, "failed to roll back expansion reservation");
            }
            return Err(e);
        }

        info!(volume = %request.volume_id, requested, "volume expansion reserved");
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: requested,
            node_expansion_required: true,
        })
    }
}

fn check_free(drive_id: &str, free: i64, delta: i64) -> Result<()> {
    if delta > free {
        return Err(Error::OutOfRange(format!(
            "drive {drive_id} has {free} bytes free; {delta} bytes requested"
        )));
    }
    Ok(())
}

fn controller_capability(kind: rpc::Type) -> ControllerServiceCapability {
    ControllerServiceCapability {
        r#type: Some(controller_service_capability::Type::Rpc(
            controller_service_capability::Rpc { r#type: kind as i32 },
        )),
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    #[instrument(skip(self, request))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> std::result::Result<Response<CreateVolumeResponse>, Status> {
        Ok(Response::new(self.create_volume_inner(request.into_inner()).await?))
    }

    #[instrument(skip(self, request))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> std::result::Result<Response<DeleteVolumeResponse>, Status> {
        Ok(Response::new(self.delete_volume_inner(request.into_inner()).await?))
    }

    #[instrument(skip(self, request))]
    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> std::result::Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let request = request.into_inner();
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume ID missing in request".into()).into());
        }
        if request.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument("volume capabilities missing in request".into()).into());
        }
        self.clients.volumes.get(&request.volume_id).await?;

        let rejected = request
            .volume_capabilities
            .iter()
            .find_map(|c| validate_capability(c).err());
        let response = match rejected {
            Some(error) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: error.to_string(),
            },
            None => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(Confirmed {
                    volume_context: request.volume_context,
                    volume_capabilities: request.volume_capabilities,
                    parameters: request.parameters,
                }),
                message: String::new(),
            },
        };
        Ok(Response::new(response))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![
                controller_capability(rpc::Type::CreateDeleteVolume),
                controller_capability(rpc::Type::ExpandVolume),
            ],
        }))
    }

    #[instrument(skip(self, request))]
    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> std::result::Result<Response<ControllerExpandVolumeResponse>, Status> {
        Ok(Response::new(self.expand_volume_inner(request.into_inner()).await?))
    }
}
