//! DirectPVNode CRD
//!
//! Reflects a cluster node running the node plugin and the block devices it
//! can see. Setting `spec.refresh` asks the node to re-probe its devices.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DirectPVNode lists the devices visible on one node
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "directpv.min.io",
    version = "v1",
    kind = "DirectPVNode",
    plural = "directpvnodes",
    shortname = "dpvn",
    status = "NodeStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Refresh", "type": "boolean", "jsonPath": ".spec.refresh"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Re-probe devices on the next reconcile
    #[serde(default)]
    pub refresh: bool,
}

/// Status of a DirectPVNode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// A block device as seen by the node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Stable identifier, `<major>:<minor>$<name>`
    pub id: String,

    /// Kernel name, e.g. `sda`
    pub name: String,

    /// Size in bytes
    #[serde(default)]
    pub size: i64,

    #[serde(default)]
    pub make: String,

    /// Existing filesystem type, empty when unformatted
    #[serde(default)]
    pub fs: String,

    #[serde(default)]
    pub fsuuid: String,

    #[serde(default)]
    pub major_minor: String,

    /// Why the device cannot be initialized; empty when it can
    #[serde(default)]
    pub denied_reason: String,
}

impl Device {
    pub fn is_available(&self) -> bool {
        self.denied_reason.is_empty()
    }
}

impl DirectPVNode {
    /// Build a node object for `node_id` with the given devices
    pub fn build(node_id: &str, devices: Vec<Device>) -> Self {
        let mut node = DirectPVNode::new(node_id, NodeSpec::default());
        node.status = Some(NodeStatus { devices });
        node
    }

    pub fn devices(&self) -> &[Device] {
        self.status
            .as_ref()
            .map(|s| s.devices.as_slice())
            .unwrap_or_default()
    }

    pub fn available_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices().iter().filter(|d| d.is_available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_devices() {
        let node = DirectPVNode::build(
            "node-1",
            vec![
                Device {
                    id: "8:0$sda".into(),
                    name: "sda".into(),
                    size: 1 << 30,
                    ..Default::default()
                },
                Device {
                    id: "8:16$sdb".into(),
                    name: "sdb".into(),
                    denied_reason: "mounted".into(),
                    ..Default::default()
                },
            ],
        );
        let names: Vec<_> = node.available_devices().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["sda"]);
        assert_eq!(node.devices().len(), 2);
    }
}
