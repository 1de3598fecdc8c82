//! Runtime configuration
//!
//! Built from the command line in `main.rs`; each struct checks itself before
//! any server starts.

use crate::controller::DEFAULT_WORKERS;
use crate::csi::{socket_path, NodeServiceConfig, DRIVER_NAME};
use crate::error::{Error, Result};
use crate::lister::MAX_THREAD_COUNT;
use crate::node::paths::{DEFAULT_MOUNT_ROOT, DEFAULT_TMPFS_DIR};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CSI_ENDPOINT: &str = "unix:///csi/csi.sock";
pub const DEFAULT_LEASE_NAMESPACE: &str = "directpv";
pub const DEFAULT_WEBHOOK_ADDR: &str = "0.0.0.0:30443";
const DEFAULT_TOPOLOGY_VALUE: &str = "default";

fn check_endpoint(endpoint: &str) -> Result<()> {
    socket_path(endpoint).map(|_| ())
}

fn check_workers(workers: usize) -> Result<()> {
    if workers == 0 {
        return Err(Error::Configuration("workers must be at least 1".into()));
    }
    Ok(())
}

/// Configuration of the `controller` command
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub csi_endpoint: String,
    /// Holder identity for the reservation repairer lease
    pub identity: String,
    pub workers: usize,
    pub leader_election: bool,
    pub lease_namespace: String,
    pub max_objects: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            csi_endpoint: DEFAULT_CSI_ENDPOINT.to_string(),
            identity: DRIVER_NAME.to_string(),
            workers: DEFAULT_WORKERS,
            leader_election: true,
            lease_namespace: DEFAULT_LEASE_NAMESPACE.to_string(),
            max_objects: MAX_THREAD_COUNT,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        check_endpoint(&self.csi_endpoint)?;
        check_workers(self.workers)?;
        if self.identity.is_empty() {
            return Err(Error::Configuration("identity must not be empty".into()));
        }
        if self.max_objects == 0 {
            return Err(Error::Configuration("max objects must be at least 1".into()));
        }
        if self.leader_election && self.lease_namespace.is_empty() {
            return Err(Error::Configuration(
                "lease namespace is required with leader election".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of the `node-server` command
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub csi_endpoint: String,
    pub node_id: String,
    pub identity: String,
    pub rack: String,
    pub zone: String,
    pub region: String,
    pub mount_root: PathBuf,
    pub tmpfs_dir: PathBuf,
    pub workers: usize,
    pub health_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            csi_endpoint: DEFAULT_CSI_ENDPOINT.to_string(),
            node_id: String::new(),
            identity: DRIVER_NAME.to_string(),
            rack: DEFAULT_TOPOLOGY_VALUE.to_string(),
            zone: DEFAULT_TOPOLOGY_VALUE.to_string(),
            region: DEFAULT_TOPOLOGY_VALUE.to_string(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            tmpfs_dir: PathBuf::from(DEFAULT_TMPFS_DIR),
            workers: DEFAULT_WORKERS,
            health_interval: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        check_endpoint(&self.csi_endpoint)?;
        check_workers(self.workers)?;
        if self.node_id.is_empty() {
            return Err(Error::Configuration("node ID must be set".into()));
        }
        if !self.mount_root.is_absolute() || !self.tmpfs_dir.is_absolute() {
            return Err(Error::Configuration(
                "mount root and tmpfs directory must be absolute paths".into(),
            ));
        }
        if self.health_interval.is_zero() {
            return Err(Error::Configuration("health interval must be positive".into()));
        }
        Ok(())
    }

    /// Boot configuration handed to the CSI node service
    pub fn service_config(&self) -> NodeServiceConfig {
        NodeServiceConfig {
            node_id: self.node_id.clone(),
            identity: self.identity.clone(),
            rack: self.rack.clone(),
            zone: self.zone.clone(),
            region: self.region.clone(),
            mount_root: self.mount_root.clone(),
            tmpfs_dir: self.tmpfs_dir.clone(),
        }
    }
}

/// Configuration of the `conversion-webhook` command
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub addr: SocketAddr,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 30443)),
        }
    }
}

impl WebhookConfig {
    pub fn from_addr(addr: &str) -> Result<Self> {
        let addr = addr
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid webhook address {addr:?}: {e}")))?;
        Ok(Self { addr })
    }
}
