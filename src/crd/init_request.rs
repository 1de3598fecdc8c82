//! DirectPVInitRequest CRD
//!
//! A one-shot request asking one node to format devices into drives.

use super::labels::LabelKey;
use super::types::InitStatus;
use super::DirectResource;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DirectPVInitRequest is processed once by the node it names
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "directpv.min.io",
    version = "v1",
    kind = "DirectPVInitRequest",
    plural = "directpvinitrequests",
    shortname = "dpvi",
    status = "InitRequestStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeId"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct InitRequestSpec {
    /// Node expected to process the request
    pub node_id: String,

    #[serde(default)]
    pub devices: Vec<InitDevice>,
}

/// One device to initialize
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitDevice {
    pub id: String,
    pub name: String,
    /// Overwrite an existing filesystem
    #[serde(default)]
    pub force: bool,
}

/// Status of a DirectPVInitRequest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitRequestStatus {
    #[serde(default)]
    pub status: InitStatus,

    #[serde(default)]
    pub results: Vec<InitDeviceResult>,
}

/// Outcome for one device; `error` is empty on success
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitDeviceResult {
    pub name: String,
    #[serde(default)]
    pub error: String,
}

impl DirectPVInitRequest {
    /// Build a Pending request tagged with `request_id`
    pub fn build(name: &str, request_id: &str, node_id: &str, devices: Vec<InitDevice>) -> Self {
        let mut request = DirectPVInitRequest::new(
            name,
            InitRequestSpec {
                node_id: node_id.to_string(),
                devices,
            },
        );
        request.set_label(LabelKey::RequestId, request_id);
        request.set_label(LabelKey::Node, node_id);
        request.status = Some(InitRequestStatus::default());
        request
    }

    pub fn request_id(&self) -> &str {
        self.label(LabelKey::RequestId).unwrap_or_default()
    }

    pub fn init_status(&self) -> InitStatus {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    pub fn is_pending(&self) -> bool {
        self.init_status() == InitStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build() {
        let request = DirectPVInitRequest::build(
            "req-node-1",
            "0b8c5d7e",
            "node-1",
            vec![InitDevice {
                id: "8:0$sda".into(),
                name: "sda".into(),
                force: false,
            }],
        );
        assert_eq!(request.request_id(), "0b8c5d7e");
        assert_eq!(request.label(LabelKey::Node), Some("node-1"));
        assert!(request.is_pending());
        assert_eq!(request.spec.devices.len(), 1);
    }
}
