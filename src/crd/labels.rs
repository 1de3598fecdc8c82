//! Label keys and label value normalization
//!
//! Every label written by DirectPV lives under the API group prefix. The key
//! set is closed; values are normalized to satisfy the Kubernetes label value
//! rules before they are stored.

use super::GROUP;
use std::fmt;
use tracing::warn;

/// Maximum length of a label value
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// The closed set of label keys used on DirectPV objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LabelKey {
    Node,
    DriveName,
    DriveId,
    DrivePath,
    AccessTier,
    PodName,
    PodNamespace,
    Tenant,
    TopologyIdentity,
    TopologyRack,
    TopologyZone,
    TopologyRegion,
    CreatedBy,
    Version,
    RequestId,
    VolumeClaimId,
    Suspended,
}

impl LabelKey {
    /// All label keys
    pub const ALL: [LabelKey; 17] = [
        LabelKey::Node,
        LabelKey::DriveName,
        LabelKey::DriveId,
        LabelKey::DrivePath,
        LabelKey::AccessTier,
        LabelKey::PodName,
        LabelKey::PodNamespace,
        LabelKey::Tenant,
        LabelKey::TopologyIdentity,
        LabelKey::TopologyRack,
        LabelKey::TopologyZone,
        LabelKey::TopologyRegion,
        LabelKey::CreatedBy,
        LabelKey::Version,
        LabelKey::RequestId,
        LabelKey::VolumeClaimId,
        LabelKey::Suspended,
    ];

    /// Fully qualified key, e.g. `directpv.min.io/node`
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelKey::Node => "directpv.min.io/node",
            LabelKey::DriveName => "directpv.min.io/drive-name",
            LabelKey::DriveId => "directpv.min.io/drive",
            LabelKey::DrivePath => "directpv.min.io/path",
            LabelKey::AccessTier => "directpv.min.io/access-tier",
            LabelKey::PodName => "directpv.min.io/pod.name",
            LabelKey::PodNamespace => "directpv.min.io/pod.namespace",
            LabelKey::Tenant => "directpv.min.io/tenant",
            LabelKey::TopologyIdentity => "directpv.min.io/identity",
            LabelKey::TopologyRack => "directpv.min.io/rack",
            LabelKey::TopologyZone => "directpv.min.io/zone",
            LabelKey::TopologyRegion => "directpv.min.io/region",
            LabelKey::CreatedBy => "directpv.min.io/created-by",
            LabelKey::Version => "directpv.min.io/version",
            LabelKey::RequestId => "directpv.min.io/request-id",
            LabelKey::VolumeClaimId => "directpv.min.io/volume-claim-id",
            LabelKey::Suspended => "directpv.min.io/suspended",
        }
    }

    /// Look up a key by its qualified name
    pub fn parse(key: &str) -> Option<LabelKey> {
        Self::ALL.iter().copied().find(|k| k.as_str() == key)
    }
}

impl fmt::Display for LabelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the key carries the DirectPV label prefix
pub fn has_group_prefix(key: &str) -> bool {
    key.strip_prefix(GROUP)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

/// Whether the value is a valid label value as-is
pub fn is_valid_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    value.len() <= MAX_LABEL_VALUE_LEN
        && value.chars().all(is_allowed)
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric())
}

/// Normalize a raw value into a valid label value.
///
/// Invalid values are truncated to 63 characters, disallowed characters are
/// replaced with `-`, and non-alphanumeric characters are trimmed from both
/// ends.
pub fn sanitize_label_value(value: &str) -> String {
    if is_valid_label_value(value) {
        return value.to_string();
    }

    let replaced: String = value
        .chars()
        .take(MAX_LABEL_VALUE_LEN)
        .map(|c| if is_allowed(c) { c } else { '-' })
        .collect();
    let result = replaced
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string();

    warn!(original = %value, sanitized = %result, "label value normalized");
    result
}
