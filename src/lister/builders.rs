//! Per-kind lister builders

use super::{LabelSelector, Query};
use crate::crd::{
    AccessTier, DirectPVDrive, DirectPVInitRequest, DirectPVNode, DirectPVVolume, DriveHealth,
    InitStatus, LabelKey, VolumeState,
};
use crate::error::Result;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::client::ResourceClient;

macro_rules! common_builder_methods {
    ($kind:ty) => {
        /// Restrict to these object names
        pub fn names<I, S>(mut self, names: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            self.query.add_names(names);
            self
        }

        /// Merge arbitrary label requirements into the selector
        pub fn labels(mut self, selector: &LabelSelector) -> Self {
            self.query.select(|s| s.merge(selector));
            self
        }

        /// Page size
        pub fn max_objects(mut self, max_objects: u32) -> Self {
            self.query.set_max_objects(max_objects);
            self
        }

        /// Skip names that do not exist instead of failing
        pub fn ignore_not_found(mut self, ignore: bool) -> Self {
            self.query.set_ignore_not_found(ignore);
            self
        }

        pub fn list(self, cancel: CancellationToken) -> ReceiverStream<Result<$kind>> {
            self.query.list(cancel)
        }

        pub async fn get(self, cancel: CancellationToken) -> Result<Vec<$kind>> {
            self.query.get(cancel).await
        }
    };
}

/// Lists drives
pub struct DriveLister {
    query: Query<DirectPVDrive>,
}

impl DriveLister {
    pub fn new(client: Arc<dyn ResourceClient<DirectPVDrive>>) -> Self {
        Self {
            query: Query::new(client),
        }
    }

    pub fn node_id(mut self, node_id: &str) -> Self {
        self.query.select(|s| s.equals(LabelKey::Node, node_id));
        self
    }

    pub fn drive_name(mut self, drive_name: &str) -> Self {
        self.query.select(|s| s.equals(LabelKey::DriveName, drive_name));
        self
    }

    /// The drive ID is the object name
    pub fn drive_ids<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names(ids)
    }

    pub fn access_tier(mut self, tier: AccessTier) -> Self {
        self.query
            .select(|s| s.equals(LabelKey::AccessTier, &tier.to_string()));
        self
    }

    pub fn status(mut self, statuses: Vec<DriveHealth>) -> Self {
        if !statuses.is_empty() {
            self.query.filter(move |d: &DirectPVDrive| statuses.contains(&d.health()));
        }
        self
    }

    common_builder_methods!(DirectPVDrive);
}

/// Lists volumes
pub struct VolumeLister {
    query: Query<DirectPVVolume>,
}

impl VolumeLister {
    pub fn new(client: Arc<dyn ResourceClient<DirectPVVolume>>) -> Self {
        Self {
            query: Query::new(client),
        }
    }

    pub fn node_id(mut self, node_id: &str) -> Self {
        self.query.select(|s| s.equals(LabelKey::Node, node_id));
        self
    }

    pub fn drive_name(mut self, drive_name: &str) -> Self {
        self.query.select(|s| s.equals(LabelKey::DriveName, drive_name));
        self
    }

    pub fn drive_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.select(|s| s.in_set(LabelKey::DriveId, ids));
        self
    }

    pub fn pod_name(mut self, pod_name: &str) -> Self {
        self.query.select(|s| s.equals(LabelKey::PodName, pod_name));
        self
    }

    pub fn pod_namespace(mut self, pod_namespace: &str) -> Self {
        self.query
            .select(|s| s.equals(LabelKey::PodNamespace, pod_namespace));
        self
    }

    pub fn status(mut self, statuses: Vec<VolumeState>) -> Self {
        if !statuses.is_empty() {
            self.query.filter(move |v: &DirectPVVolume| statuses.contains(&v.state()));
        }
        self
    }

    /// Only volumes that are staged or published
    pub fn staged_or_published(mut self) -> Self {
        self.query
            .filter(|v: &DirectPVVolume| v.is_staged() || v.is_published());
        self
    }

    common_builder_methods!(DirectPVVolume);
}

/// Lists nodes
pub struct NodeLister {
    query: Query<DirectPVNode>,
}

impl NodeLister {
    pub fn new(client: Arc<dyn ResourceClient<DirectPVNode>>) -> Self {
        Self {
            query: Query::new(client),
        }
    }

    common_builder_methods!(DirectPVNode);
}

/// Lists init requests
pub struct InitRequestLister {
    query: Query<DirectPVInitRequest>,
}

impl InitRequestLister {
    pub fn new(client: Arc<dyn ResourceClient<DirectPVInitRequest>>) -> Self {
        Self {
            query: Query::new(client),
        }
    }

    pub fn node_id(mut self, node_id: &str) -> Self {
        self.query.select(|s| s.equals(LabelKey::Node, node_id));
        self
    }

    pub fn request_id(mut self, request_id: &str) -> Self {
        self.query.select(|s| s.equals(LabelKey::RequestId, request_id));
        self
    }

    pub fn status(mut self, statuses: Vec<InitStatus>) -> Self {
        if !statuses.is_empty() {
            self.query
                .filter(move |r: &DirectPVInitRequest| statuses.contains(&r.init_status()));
        }
        self
    }

    common_builder_methods!(DirectPVInitRequest);
}
