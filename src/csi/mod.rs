//! CSI gRPC services
//!
//! The generated CSI types live in [`proto`]. The controller and node servers
//! both expose the identity service; each binds a unix socket taken from a
//! `unix://` endpoint.

pub mod controller;
pub mod identity;
pub mod node;
pub mod selector;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::{NodeService, NodeServiceConfig};

use crate::error::{Error, Result};
use proto::volume_capability::access_mode::Mode;
use proto::volume_capability::AccessType;
use proto::VolumeCapability;
use std::path::PathBuf;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tracing::info;

/// Generated CSI v1 types and service traits
#[allow(clippy::all)]
pub mod proto {
    tonic::include_proto!("csi.v1");
}

/// Name reported by GetPluginInfo
pub const DRIVER_NAME: &str = "directpv-min-io";

/// The only supported filesystem
pub const FS_TYPE: &str = "xfs";

/// Socket path of a `unix://` endpoint
pub fn socket_path(endpoint: &str) -> Result<PathBuf> {
    let path = endpoint
        .strip_prefix("unix://")
        .ok_or_else(|| Error::Configuration(format!("unsupported CSI endpoint {endpoint:?}")))?;
    if path.is_empty() {
        return Err(Error::Configuration("empty CSI endpoint path".into()));
    }
    Ok(PathBuf::from(path))
}

/// Serve `router` on the unix socket of `endpoint` until `cancel` fires
pub async fn serve(router: Router, endpoint: &str, cancel: CancellationToken) -> Result<()> {
    let path = socket_path(endpoint)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(&path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }
    let listener = UnixListener::bind(&path)?;
    info!(endpoint = %endpoint, "CSI server listening");

    router
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), cancel.cancelled())
        .await?;
    info!("CSI server stopped");
    Ok(())
}

/// Accept only single-node-writer filesystem volumes formatted as XFS. An
/// empty filesystem type means the default, XFS.
pub fn validate_capability(capability: &VolumeCapability) -> Result<()> {
    match &capability.access_type {
        Some(AccessType::Block(_)) => {
            return Err(Error::InvalidArgument("block volumes are not supported".into()));
        }
        Some(AccessType::Mount(mount)) => {
            if !mount.fs_type.is_empty() && mount.fs_type != FS_TYPE {
                return Err(Error::InvalidArgument(format!(
                    "unsupported filesystem type {:?}; only {FS_TYPE} is supported",
                    mount.fs_type
                )));
            }
        }
        None => {}
    }
    let mode = capability
        .access_mode
        .as_ref()
        .map(|m| m.mode())
        .unwrap_or(Mode::Unknown);
    if mode != Mode::SingleNodeWriter {
        return Err(Error::InvalidArgument(format!(
            "unsupported access mode {}",
            mode.as_str_name()
        )));
    }
    Ok(())
}
