//! Init config
//!
//! The YAML document an operator edits to choose which devices to format:
//!
//! ```yaml
//! version: v1
//! nodes:
//! - name: node-1
//!   drives:
//!   - id: "8:16$sdb"
//!     name: sdb
//!     size: 107374182400
//!     make: ATA QEMU_HARDDISK
//!     select: "yes"
//! ```

use crate::crd::{DirectPVInitRequest, DirectPVNode, InitDevice};
use crate::error::{Error, Result};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

/// Only supported config version
pub const INIT_CONFIG_VERSION: &str = "v1";

const SELECTED: &str = "yes";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    pub version: String,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    #[serde(default)]
    pub drives: Vec<DriveInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub make: String,
    /// Existing filesystem; formatting it requires force
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fs: String,
    #[serde(default)]
    pub select: String,
}

impl DriveInfo {
    pub fn is_selected(&self) -> bool {
        self.select == SELECTED
    }
}

impl InitConfig {
    /// Parse and validate a config document
    pub fn from_yaml(input: &str) -> Result<Self> {
        let config: InitConfig = serde_yaml::from_str(input)?;
        if config.version != INIT_CONFIG_VERSION {
            return Err(Error::InitConfig(format!(
                "unsupported version {:?}; expected {INIT_CONFIG_VERSION}",
                config.version
            )));
        }
        for node in &config.nodes {
            if node.name.is_empty() {
                return Err(Error::InitConfig("node without a name".into()));
            }
            if let Some(drive) = node.drives.iter().find(|d| d.id.is_empty() || d.name.is_empty()) {
                return Err(Error::InitConfig(format!(
                    "drive {:?} on node {} needs both id and name",
                    drive.name, node.name
                )));
            }
        }
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// A config selecting every available device of the given nodes
    pub fn from_node_devices(nodes: &[DirectPVNode]) -> Self {
        let nodes = nodes
            .iter()
            .map(|node| NodeInfo {
                name: node.name_any(),
                drives: node
                    .available_devices()
                    .map(|device| DriveInfo {
                        id: device.id.clone(),
                        name: device.name.clone(),
                        size: device.size,
                        make: device.make.clone(),
                        fs: device.fs.clone(),
                        select: SELECTED.to_string(),
                    })
                    .collect(),
            })
            .filter(|node| !node.drives.is_empty())
            .collect();
        Self {
            version: INIT_CONFIG_VERSION.to_string(),
            nodes,
        }
    }

    /// One request per node with selected drives, all tagged `request_id`
    pub fn to_init_request_objects(&self, request_id: &str) -> Result<Vec<DirectPVInitRequest>> {
        let requests: Vec<_> = self
            .nodes
            .iter()
            .filter_map(|node| {
                let devices: Vec<InitDevice> = node
                    .drives
                    .iter()
                    .filter(|d| d.is_selected())
                    .map(|d| InitDevice {
                        id: d.id.clone(),
                        name: d.name.clone(),
                        force: !d.fs.is_empty(),
                    })
                    .collect();
                if devices.is_empty() {
                    return None;
                }
                let name = format!("{}-{}", node.name, request_id);
                Some(DirectPVInitRequest::build(&name, request_id, &node.name, devices))
            })
            .collect();
        if requests.is_empty() {
            return Err(Error::InitConfig("no drives selected".into()));
        }
        Ok(requests)
    }
}
