//! Custom Resource Definitions for DirectPV
//!
//! This module contains all CRD types, all cluster-scoped and at the latest
//! schema version:
//! - DirectPVDrive: a physical disk claimed on a node
//! - DirectPVVolume: a quota-enforced directory carved out of a drive
//! - DirectPVNode: the devices visible to the node plugin
//! - DirectPVInitRequest: a request to format devices into drives

pub mod drive;
pub mod init_request;
pub mod labels;
pub mod node;
pub mod types;
pub mod volume;

pub use drive::*;
pub use init_request::*;
pub use labels::*;
pub use node::*;
pub use types::*;
pub use volume::*;

use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// API group of every DirectPV resource
pub const GROUP: &str = "directpv.min.io";

/// Latest schema version
pub const LATEST_VERSION: &str = "v1";

/// Application name used in metadata directories and events
pub const APP_NAME: &str = "directpv";

/// Finalizer on a Volume removed by the controller on DeleteVolume
pub const PV_PROTECTION_FINALIZER: &str = "directpv.min.io/pv-protection";

/// Finalizer on a Volume removed by the node once on-disk data is purged
pub const PURGE_PROTECTION_FINALIZER: &str = "directpv.min.io/purge-protection";

/// Finalizer on a Drive removed once the drive is released
pub const DATA_PROTECTION_FINALIZER: &str = "directpv.min.io/data-protection";

/// Prefix of the per-volume reservation finalizers on a Drive
pub const VOLUME_FINALIZER_PREFIX: &str = "directpv.min.io/volume.";

/// Name of the reservation finalizer a Drive carries for a Volume
pub fn volume_finalizer(volume_name: &str) -> String {
    format!("{VOLUME_FINALIZER_PREFIX}{volume_name}")
}

/// Group/version string for a version, e.g. `directpv.min.io/v1`
pub fn api_version(version: &str) -> String {
    format!("{GROUP}/{version}")
}

/// Common behaviour of the DirectPV resources at the latest version
pub trait DirectResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name, e.g. `DirectPVDrive`
    fn kind_name() -> String {
        Self::kind(&()).to_string()
    }

    /// Value of a DirectPV label
    fn label(&self, key: LabelKey) -> Option<&str> {
        self.meta()
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key.as_str()))
            .map(String::as_str)
    }

    /// Set a DirectPV label; the value is normalized first
    fn set_label(&mut self, key: LabelKey, value: &str) {
        let value = sanitize_label_value(value);
        self.labels_mut().insert(key.as_str().to_string(), value);
    }

    /// Remove a DirectPV label
    fn remove_label(&mut self, key: LabelKey) {
        self.labels_mut().remove(key.as_str());
    }

    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Add a finalizer with set semantics; returns true when it was added
    fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers_mut().push(finalizer.to_string());
        true
    }

    /// Remove a finalizer; returns true when it was present
    fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let finalizers = self.finalizers_mut();
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        before != finalizers.len()
    }

    /// Whether a deletion timestamp is set
    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Whether the object carries `suspended=true`
    fn is_suspended(&self) -> bool {
        self.label(LabelKey::Suspended) == Some("true")
    }
}

impl DirectResource for DirectPVDrive {}
impl DirectResource for DirectPVVolume {}
impl DirectResource for DirectPVNode {}
impl DirectResource for DirectPVInitRequest {}
