//! CSI node service
//!
//! Stage bind-mounts a volume's quota-limited data directory onto the staging
//! path; publish bind-mounts the staging path into the pod. Suspended volumes
//! are published as an empty read-only tmpfs instead.

use super::proto::node_server::Node;
use super::proto::node_service_capability::{self, rpc};
use super::proto::volume_usage::Unit;
use super::proto::*;
use super::validate_capability;
use crate::client::{retry_on_conflict, Clients, EventReason, EventType};
use crate::crd::{
    has_group_prefix, DirectPVVolume, DirectResource, LabelKey, VolumeState, CONDITION_ERROR,
};
use crate::error::{Error, Result};
use crate::node::paths::{DEFAULT_MOUNT_ROOT, DEFAULT_TMPFS_DIR};
use crate::node::{drive_mount_point, volume_data_path, NodeOps};
use kube::{Resource, ResourceExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

/// Volume context key carrying the pod name
pub const POD_NAME_KEY: &str = "csi.storage.k8s.io/pod.name";

/// Volume context key carrying the pod namespace
pub const POD_NAMESPACE_KEY: &str = "csi.storage.k8s.io/pod.namespace";

/// Boot configuration of the node service
#[derive(Debug, Clone)]
pub struct NodeServiceConfig {
    pub node_id: String,
    pub identity: String,
    pub rack: String,
    pub zone: String,
    pub region: String,
    pub mount_root: PathBuf,
    pub tmpfs_dir: PathBuf,
}

impl NodeServiceConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            identity: super::DRIVER_NAME.to_string(),
            rack: "default".into(),
            zone: "default".into(),
            region: "default".into(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            tmpfs_dir: PathBuf::from(DEFAULT_TMPFS_DIR),
        }
    }

    /// Topology segments advertised by NodeGetInfo and stamped on drives
    pub fn topology(&self) -> HashMap<String, String> {
        HashMap::from([
            (LabelKey::TopologyIdentity.as_str().to_string(), self.identity.clone()),
            (LabelKey::TopologyRack.as_str().to_string(), self.rack.clone()),
            (LabelKey::TopologyZone.as_str().to_string(), self.zone.clone()),
            (LabelKey::TopologyRegion.as_str().to_string(), self.region.clone()),
            (LabelKey::Node.as_str().to_string(), self.node_id.clone()),
        ])
    }
}

pub struct NodeService {
    clients: Clients,
    ops: Arc<dyn NodeOps>,
    config: NodeServiceConfig,
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{what} missing in request")));
    }
    Ok(())
}

impl NodeService {
    pub fn new(clients: Clients, ops: Arc<dyn NodeOps>, config: NodeServiceConfig) -> Self {
        Self { clients, ops, config }
    }

    /// Mount the tmpfs that suspended volumes are published from
    pub async fn prepare_tmpfs(&self) -> Result<()> {
        let dir = &self.config.tmpfs_dir;
        self.ops.mkdir_all(dir).await?;
        if self.ops.mount_table().await?.is_mount_point(dir) {
            return Ok(());
        }
        self.ops.mount_tmpfs(dir).await?;
        info!(path = %dir.display(), "tmpfs prepared for suspended volumes");
        Ok(())
    }

    /// Re-read the volume, apply `mutate` to it and write its status
    async fn update_volume_status<F>(&self, name: &str, mutate: F) -> Result<DirectPVVolume>
    where
        F: Fn(&mut DirectPVVolume) + Send + Sync,
    {
        retry_on_conflict(|| {
            let volumes = self.clients.volumes.clone();
            let mutate = &mutate;
            async move {
                let mut volume = volumes.get(name).await?;
                mutate(&mut volume);
                volumes.update_status(&volume).await
            }
        })
        .await
    }

    async fn stage_inner(&self, request: NodeStageVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume ID")?;
        require(&request.staging_target_path, "staging target path")?;
        let capability = request
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume capability missing in request".into()))?;
        validate_capability(capability)?;

        let volume = self.clients.volumes.get(&request.volume_id).await?;
        let staging = PathBuf::from(&request.staging_target_path);
        let table = self.ops.mount_table().await?;
        if volume.staging_target_path() == request.staging_target_path && table.is_mount_point(&staging) {
            debug!(volume = %request.volume_id, "volume already staged");
            return Ok(());
        }

        let fsuuid = volume.fsuuid().to_string();
        let device = match self.ops.device_by_fsuuid(&fsuuid).await {
            Ok(device) => device,
            Err(e) => {
                self.clients
                    .events
                    .record(
                        volume.object_ref(&()),
                        EventType::Warning,
                        EventReason::StageVolume,
                        format!("unable to find device for FSUUID {fsuuid}; {e}"),
                    )
                    .await;
                return Err(e);
            }
        };

        let mount_point = drive_mount_point(&self.config.mount_root, &fsuuid);
        if !table.is_mount_point(&mount_point) {
            self.ops.mkdir_all(&mount_point).await?;
            self.ops.mount_xfs(&device, &mount_point).await?;
            info!(device = %device.display(), path = %mount_point.display(), "drive mounted");
        }

        let data_path = volume_data_path(&self.config.mount_root, &fsuuid, &request.volume_id);
        self.ops.mkdir_all(&data_path).await?;
        self.ops
            .set_quota(&mount_point, &data_path, &request.volume_id, volume.total_capacity())
            .await?;
        self.ops.mkdir_all(&staging).await?;
        if !table.is_mount_point(&staging) {
            self.ops.bind_mount(&data_path, &staging, false).await?;
        }

        let data_path = data_path.display().to_string();
        self.update_volume_status(&request.volume_id, |volume| {
            let status = volume.status_mut();
            status.staging_target_path = request.staging_target_path.clone();
            status.data_path = data_path.clone();
            status.status = VolumeState::Ready;
        })
        .await?;
        info!(volume = %request.volume_id, path = %request.staging_target_path, "volume staged");
        Ok(())
    }

    async fn unstage_inner(&self, request: NodeUnstageVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume ID")?;
        require(&request.staging_target_path, "staging target path")?;

        let volume = self.clients.volumes.get(&request.volume_id).await?;
        if volume.staging_target_path() != request.staging_target_path {
            return Err(Error::not_found("staging target path", &request.staging_target_path));
        }
        self.ops
            .unmount(Path::new(&request.staging_target_path))
            .await?;
        self.update_volume_status(&request.volume_id, |volume| {
            volume.status_mut().staging_target_path.clear();
        })
        .await?;
        info!(volume = %request.volume_id, "volume unstaged");
        Ok(())
    }

    /// Copy the pod's DirectPV labels onto the volume
    async fn copy_pod_labels(&self, volume_id: &str, context: &HashMap<String, String>) -> Result<()> {
        let (Some(name), Some(namespace)) = (context.get(POD_NAME_KEY), context.get(POD_NAMESPACE_KEY)) else {
            return Ok(());
        };
        let pod_labels = self.clients.pods.pod_labels(namespace, name).await?;
        retry_on_conflict(|| {
            let volumes = self.clients.volumes.clone();
            let pod_labels = &pod_labels;
            async move {
                let mut volume = volumes.get(volume_id).await?;
                let before = volume.labels().clone();
                volume.set_label(LabelKey::PodName, name);
                volume.set_label(LabelKey::PodNamespace, namespace);
                for (key, value) in pod_labels.iter().filter(|(k, _)| has_group_prefix(k)) {
                    volume.labels_mut().insert(key.clone(), value.clone());
                }
                if volume.labels() == &before {
                    return Ok(());
                }
                volumes.update(&volume).await.map(|_| ())
            }
        })
        .await
    }

    async fn is_suspended(&self, volume: &DirectPVVolume) -> Result<bool> {
        if volume.is_suspended() {
            return Ok(true);
        }
        match self.clients.drives.get(volume.drive_id()).await {
            Ok(drive) => Ok(drive.is_suspended()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn publish_inner(&self, request: NodePublishVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume ID")?;
        require(&request.target_path, "target path")?;
        let capability = request
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume capability missing in request".into()))?;
        validate_capability(capability)?;

        self.copy_pod_labels(&request.volume_id, &request.volume_context)
            .await?;
        let volume = self.clients.volumes.get(&request.volume_id).await?;
        let target = PathBuf::from(&request.target_path);
        let table = self.ops.mount_table().await?;

        if self.is_suspended(&volume).await? {
            let tmpfs = &self.config.tmpfs_dir;
            if !table.is_mount_point(tmpfs) {
                return Err(Error::FailedPrecondition(format!(
                    "tmpfs {} is not mounted for suspended volume {}",
                    tmpfs.display(),
                    request.volume_id
                )));
            }
            if !table.is_mount_point(&target) {
                self.ops.mkdir_all(&target).await?;
                self.ops.bind_mount(tmpfs, &target, true).await?;
            }
            warn!(volume = %request.volume_id, "suspended volume published read-only");
        } else {
            require(&request.staging_target_path, "staging target path")?;
            let staging = PathBuf::from(&request.staging_target_path);
            let Some(staged) = table.get(&staging) else {
                return Err(Error::FailedPrecondition(format!(
                    "staging target path {} is not mounted",
                    staging.display()
                )));
            };
            match table.get(&target) {
                Some(existing) if existing.same_source(staged) => {
                    debug!(volume = %request.volume_id, "volume already published");
                }
                _ => {
                    self.ops.mkdir_all(&target).await?;
                    self.ops
                        .bind_mount(&staging, &target, request.readonly)
                        .await?;
                }
            }
        }

        self.update_volume_status(&request.volume_id, |volume| {
            volume.status_mut().target_path = request.target_path.clone();
        })
        .await?;
        info!(volume = %request.volume_id, path = %request.target_path, "volume published");
        Ok(())
    }

    async fn unpublish_inner(&self, request: NodeUnpublishVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume ID")?;
        require(&request.target_path, "target path")?;

        let volume = self.clients.volumes.get(&request.volume_id).await?;
        self.ops.unmount(Path::new(&request.target_path)).await?;
        if volume.is_published() {
            self.update_volume_status(&request.volume_id, |volume| {
                volume.status_mut().target_path.clear();
            })
            .await?;
        }
        info!(volume = %request.volume_id, "volume unpublished");
        Ok(())
    }

    async fn expand_inner(&self, request: NodeExpandVolumeRequest) -> Result<NodeExpandVolumeResponse> {
        require(&request.volume_id, "volume ID")?;
        let requested = request
            .capacity_range
            .as_ref()
            .map(|r| r.required_bytes)
            .ok_or_else(|| Error::InvalidArgument("capacity range missing in request".into()))?;

        let volume = self.clients.volumes.get(&request.volume_id).await?;
        if !volume.is_staged() {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is not staged",
                request.volume_id
            )));
        }
        if volume.total_capacity() >= requested {
            return Ok(NodeExpandVolumeResponse {
                capacity_bytes: volume.total_capacity(),
            });
        }

        let mount_point = drive_mount_point(&self.config.mount_root, volume.fsuuid());
        self.ops
            .set_quota(&mount_point, Path::new(volume.data_path()), &request.volume_id, requested)
            .await?;
        self.update_volume_status(&request.volume_id, |volume| {
            let status = volume.status_mut();
            status.total_capacity = requested;
            status.available_capacity = requested - status.used_capacity;
        })
        .await?;

        self.clients
            .events
            .record(
                volume.object_ref(&()),
                EventType::Normal,
                EventReason::VolumeExpanded,
                format!("volume expanded to {requested} bytes"),
            )
            .await;
        info!(volume = %request.volume_id, requested, "volume expanded");
        Ok(NodeExpandVolumeResponse {
            capacity_bytes: requested,
        })
    }

    async fn stats_inner(&self, request: NodeGetVolumeStatsRequest) -> Result<NodeGetVolumeStatsResponse> {
        require(&request.volume_id, "volume ID")?;
        require(&request.volume_path, "volume path")?;

        let volume = self.clients.volumes.get(&request.volume_id).await?;
        if volume.node_id() != self.config.node_id {
            return Err(Error::not_found("DirectPVVolume", &request.volume_id));
        }

        let mount_point = drive_mount_point(&self.config.mount_root, volume.fsuuid());
        let quota = self.ops.get_quota(&mount_point, &request.volume_id).await?;
        let total = quota.hard_limit;
        let used = quota.current_usage;

        let condition = volume
            .condition(CONDITION_ERROR)
            .map(|c| super::proto::VolumeCondition {
                abnormal: c.status,
                message: c.message.clone(),
            })
            .unwrap_or_default();

        Ok(NodeGetVolumeStatsResponse {
            usage: vec![VolumeUsage {
                available: (total - used).max(0),
                total,
                used,
                unit: Unit::Bytes as i32,
            }],
            volume_condition: Some(condition),
        })
    }
}

fn node_capability(kind: rpc::Type) -> NodeServiceCapability {
    NodeServiceCapability {
        r#type: Some(node_service_capability::Type::Rpc(node_service_capability::Rpc {
            r#type: kind as i32,
        })),
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    #[instrument(skip(self, request))]
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> std::result::Result<Response<NodeStageVolumeResponse>, Status> {
        self.stage_inner(request.into_inner()).await?;
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> std::result::Result<Response<NodeUnstageVolumeResponse>, Status> {
        self.unstage_inner(request.into_inner()).await?;
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> std::result::Result<Response<NodePublishVolumeResponse>, Status> {
        self.publish_inner(request.into_inner()).await?;
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<NodeUnpublishVolumeResponse>, Status> {
        self.unpublish_inner(request.into_inner()).await?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> std::result::Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Ok(Response::new(self.stats_inner(request.into_inner()).await?))
    }

    #[instrument(skip(self, request))]
    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> std::result::Result<Response<NodeExpandVolumeResponse>, Status> {
        Ok(Response::new(self.expand_inner(request.into_inner()).await?))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![
                node_capability(rpc::Type::StageUnstageVolume),
                node_capability(rpc::Type::GetVolumeStats),
                node_capability(rpc::Type::ExpandVolume),
            ],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> std::result::Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.config.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: Some(Topology {
                segments: self.config.topology(),
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryEventRecorder;
    use crate::crd::{NewVolume, REASON_NOT_MOUNTED};
    use crate::csi::proto::volume_capability::access_mode::Mode;
    use crate::csi::tests::capability;
    use crate::node::FakeNodeOps;
    use std::collections::BTreeMap;

    const FSUUID: &str = "5f2e7c1a-8b9d-4e3f-a6b1-c2d3e4f5a6b7";

    struct Harness {
        service: NodeService,
        clients: Clients,
        ops: Arc<FakeNodeOps>,
        events: Arc<MemoryEventRecorder>,
    }

    async fn harness() -> Harness {
        let mut clients = Clients::fake();
        let events = Arc::new(MemoryEventRecorder::default());
        clients.events = events.clone();
        let ops = Arc::new(FakeNodeOps::new());
        ops.add_device(FSUUID, "/dev/sdb");

        let volume = DirectPVVolume::build(NewVolume {
            name: "v1",
            fsuuid: FSUUID,
            node_id: "n1",
            drive_id: "d1",
            drive_name: "sdb",
            size: 1 << 20,
        });
        clients.volumes.create(&volume).await.unwrap();

        let mut config = NodeServiceConfig::new("n1");
        config.mount_root = PathBuf::from("/mnt");
        config.tmpfs_dir = PathBuf::from("/tmpfs");
        let service = NodeService::new(clients.clone(), ops.clone(), config);
        Harness {
            service,
            clients,
            ops,
            events,
        }
    }

    fn stage_request() -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: "/stg/v1".into(),
            volume_capability: Some(capability("xfs", Mode::SingleNodeWriter)),
            ..Default::default()
        }
    }

    fn publish_request() -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: "/stg/v1".into(),
            target_path: "/pods/v1".into(),
            volume_capability: Some(capability("xfs", Mode::SingleNodeWriter)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stage_is_idempotent() {
        let h = harness().await;
        h.service.stage_inner(stage_request()).await.unwrap();
        let mounts = h.ops.mounts().len();
        h.service.stage_inner(stage_request()).await.unwrap();
        assert_eq!(h.ops.mounts().len(), mounts);

        let volume = h.clients.volumes.get("v1").await.unwrap();
        assert_eq!(volume.staging_target_path(), "/stg/v1");
        assert_eq!(
            volume.data_path(),
            format!("/mnt/{FSUUID}/.FSUUID.{FSUUID}/v1")
        );
        assert!(h.ops.is_mount_point("/stg/v1"));
        assert!(h.ops.is_mount_point(format!("/mnt/{FSUUID}")));
        assert_eq!(h.ops.quota("v1").unwrap().hard_limit, 1 << 20);
    }

    #[tokio::test]
    async fn test_stage_lost_device() {
        let h = harness().await;
        h.ops.remove_device(FSUUID);
        let status: Status = h.service.stage_inner(stage_request()).await.unwrap_err().into();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(h.events.has_reason(EventReason::StageVolume));
        assert_eq!(h.events.events()[0].event_type, EventType::Warning);
    }

    #[tokio::test]
    async fn test_stage_missing_volume() {
        let h = harness().await;
        let mut request = stage_request();
        request.volume_id = "nope".into();
        let status: Status = h.service.stage_inner(request).await.unwrap_err().into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_publish_copies_pod_labels() {
        let h = harness().await;
        h.service.stage_inner(stage_request()).await.unwrap();

        let pods = crate::client::FakePodLabels::default();
        pods.insert(
            "ns",
            "pod-0",
            BTreeMap::from([
                ("directpv.min.io/tenant".to_string(), "acme".to_string()),
                ("app".to_string(), "minio".to_string()),
            ]),
        );
        let mut clients = h.clients.clone();
        clients.pods = Arc::new(pods);
        let service = NodeService::new(clients, h.ops.clone(), h.service.config.clone());

        let mut request = publish_request();
        request.readonly = true;
        request.volume_context = HashMap::from([
            (POD_NAME_KEY.to_string(), "pod-0".to_string()),
            (POD_NAMESPACE_KEY.to_string(), "ns".to_string()),
        ]);
        service.publish_inner(request.clone()).await.unwrap();
        service.publish_inner(request).await.unwrap();

        let volume = h.clients.volumes.get("v1").await.unwrap();
        assert_eq!(volume.target_path(), "/pods/v1");
        assert_eq!(volume.label(LabelKey::Tenant), Some("acme"));
        assert_eq!(volume.label(LabelKey::PodName), Some("pod-0"));
        assert!(!volume.labels().contains_key("app"));

        let published: Vec<_> = h
            .ops
            .mounts()
            .into_iter()
            .filter(|m| m.mount_point == Path::new("/pods/v1"))
            .collect();
        assert_eq!(published.len(), 1);
        assert!(published[0].read_only);
    }

    #[tokio::test]
    async fn test_publish_requires_stage() {
        let h = harness().await;
        let status: Status = h
            .service
            .publish_inner(publish_request())
            .await
            .unwrap_err()
            .into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_publish_suspended_uses_tmpfs() {
        let h = harness().await;
        let mut volume = h.clients.volumes.get("v1").await.unwrap();
        volume.set_label(LabelKey::Suspended, "true");
        h.clients.volumes.update(&volume).await.unwrap();

        let status: Status = h
            .service
            .publish_inner(publish_request())
            .await
            .unwrap_err()
            .into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        h.service.prepare_tmpfs().await.unwrap();
        h.service.prepare_tmpfs().await.unwrap();
        h.service.publish_inner(publish_request()).await.unwrap();
        let mount = h
            .ops
            .mounts()
            .into_iter()
            .find(|m| m.mount_point == Path::new("/pods/v1"))
            .unwrap();
        assert!(mount.read_only);
        assert_eq!(mount.source, "/tmpfs");
    }

    #[tokio::test]
    async fn test_unpublish_and_unstage() {
        let h = harness().await;
        h.service.stage_inner(stage_request()).await.unwrap();
        h.service.publish_inner(publish_request()).await.unwrap();

        let request = NodeUnpublishVolumeRequest {
            volume_id: "v1".into(),
            target_path: "/pods/v1".into(),
        };
        h.service.unpublish_inner(request.clone()).await.unwrap();
        h.service.unpublish_inner(request).await.unwrap();
        assert!(!h.ops.is_mount_point("/pods/v1"));

        let err = h
            .service
            .unstage_inner(NodeUnstageVolumeRequest {
                volume_id: "v1".into(),
                staging_target_path: "/other".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        h.service
            .unstage_inner(NodeUnstageVolumeRequest {
                volume_id: "v1".into(),
                staging_target_path: "/stg/v1".into(),
            })
            .await
            .unwrap();
        let volume = h.clients.volumes.get("v1").await.unwrap();
        assert!(!volume.is_staged());
        assert!(!volume.is_published());
        assert!(!h.ops.is_mount_point("/stg/v1"));
    }

    #[tokio::test]
    async fn test_expand_and_stats() {
        let h = harness().await;
        let expand = NodeExpandVolumeRequest {
            volume_id: "v1".into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 4 << 20,
                limit_bytes: 0,
            }),
            ..Default::default()
        };
        let err = h.service.expand_inner(expand.clone()).await.unwrap_err();
        assert_matches::assert_matches!(err, Error::FailedPrecondition(_));

        h.service.stage_inner(stage_request()).await.unwrap();
        let response = h.service.expand_inner(expand).await.unwrap();
        assert_eq!(response.capacity_bytes, 4 << 20);
        assert_eq!(h.ops.quota("v1").unwrap().hard_limit, 4 << 20);
        assert_eq!(h.clients.volumes.get("v1").await.unwrap().total_capacity(), 4 << 20);

        h.ops.set_usage("v1", 1 << 20);
        let mut volume = h.clients.volumes.get("v1").await.unwrap();
        volume.set_condition(CONDITION_ERROR, true, REASON_NOT_MOUNTED, "staging path /stg/v1 not mounted");
        h.clients.volumes.update_status(&volume).await.unwrap();

        let stats = h
            .service
            .stats_inner(NodeGetVolumeStatsRequest {
                volume_id: "v1".into(),
                volume_path: "/pods/v1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stats.usage[0].total, 4 << 20);
        assert_eq!(stats.usage[0].used, 1 << 20);
        assert_eq!(stats.usage[0].available, 3 << 20);
        assert!(stats.volume_condition.unwrap().abnormal);
    }

    #[tokio::test]
    async fn test_node_info() {
        let h = harness().await;
        let info = h
            .service
            .node_get_info(Request::new(NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, "n1");
        let segments = info.accessible_topology.unwrap().segments;
        assert_eq!(segments.get("directpv.min.io/node").map(String::as_str), Some("n1"));
        assert_eq!(segments.len(), 5);

        let caps = h
            .service
            .node_get_capabilities(Request::new(NodeGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(caps.capabilities.len(), 3);
    }
}
