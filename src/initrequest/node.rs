//! Node reconciler
//!
//! Publishes the block devices this node can see on its DirectPVNode object,
//! at startup and whenever `spec.refresh` is set.

use crate::client::{Clients, ListOptions};
use crate::controller::{EventHandler, EventKind};
use crate::crd::{DirectPVNode, DirectResource, NodeStatus};
use crate::error::Result;
use crate::lister::get_one;
use crate::node::NodeOps;
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

pub struct NodeEventHandler {
    clients: Clients,
    ops: Arc<dyn NodeOps>,
    node_id: String,
}

impl NodeEventHandler {
    pub fn new(clients: Clients, ops: Arc<dyn NodeOps>, node_id: impl Into<String>) -> Self {
        Self {
            clients,
            ops,
            node_id: node_id.into(),
        }
    }

    /// Probe devices and create or refresh this node's object
    pub async fn sync_devices(&self) -> Result<()> {
        let devices = self.ops.probe_devices().await?;
        let count = devices.len();
        match get_one(&self.clients.nodes, &self.node_id).await? {
            None => {
                self.clients
                    .nodes
                    .create(&DirectPVNode::build(&self.node_id, devices))
                    .await?;
            }
            Some(mut node) => {
                if node.spec.refresh {
                    node.spec.refresh = false;
                    node = self.clients.nodes.update(&node).await?;
                }
                if node.devices() != devices.as_slice() {
                    node.status = Some(NodeStatus { devices });
                    self.clients.nodes.update_status(&node).await?;
                }
            }
        }
        info!(node = %self.node_id, devices = count, "node devices synced");
        Ok(())
    }
}

#[async_trait]
impl EventHandler<DirectPVNode> for NodeEventHandler {
    fn name(&self) -> &str {
        "node"
    }

    async fn handle(&self, kind: EventKind, node: Arc<DirectPVNode>) -> Result<()> {
        if kind == EventKind::Delete || node.is_deleting() || node.name_any() != self.node_id {
            return Ok(());
        }
        if !node.spec.refresh {
            return Ok(());
        }
        debug!(node = %self.node_id, "refresh requested");
        self.sync_devices().await
    }
}
