//! Drive selection for CreateVolume
//!
//! Candidates are filtered on health, schedulability, free capacity, request
//! parameters and topology; the drive with the most free capacity wins, with
//! ties broken uniformly at random from the OS RNG.

use crate::crd::{has_group_prefix, AccessTier, DirectPVDrive, DirectResource, DriveHealth, LabelKey};
use crate::error::{Error, Result};
use kube::ResourceExt;
use rand::rngs::OsRng;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Length of a dashed hex UUID
const CLAIM_ID_LEN: usize = 36;

/// Topology segments as carried by CSI requests
pub type Segments = HashMap<String, String>;

/// Constraints parsed from storage-class parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    pub access_tier: Option<AccessTier>,
    pub claim_id: Option<String>,
    /// Other prefixed parameters, matched against drive labels
    pub labels: BTreeMap<String, String>,
}

impl Criteria {
    /// Parse the parameters bearing the DirectPV prefix; others are ignored
    pub fn from_parameters(parameters: &HashMap<String, String>) -> Result<Self> {
        let mut criteria = Criteria::default();
        for (key, value) in parameters {
            if !has_group_prefix(key) {
                continue;
            }
            match LabelKey::parse(key) {
                Some(LabelKey::AccessTier) => {
                    criteria.access_tier = Some(value.parse()?);
                }
                Some(LabelKey::VolumeClaimId) => {
                    if value.len() != CLAIM_ID_LEN || uuid::Uuid::parse_str(value).is_err() {
                        return Err(Error::InvalidArgument(format!(
                            "invalid volume claim ID {value:?}"
                        )));
                    }
                    criteria.claim_id = Some(value.clone());
                }
                _ => {
                    criteria.labels.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(criteria)
    }
}

/// Everything the selector needs from a CreateVolume request
#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    pub name: String,
    /// 0 when no size was requested
    pub required_bytes: i64,
    pub criteria: Criteria,
    pub preferred: Vec<Segments>,
    pub requisite: Vec<Segments>,
}

impl SelectionRequest {
    fn has_topology(&self) -> bool {
        !self.preferred.is_empty() || !self.requisite.is_empty()
    }

    fn requested_nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = self
            .preferred
            .iter()
            .chain(self.requisite.iter())
            .filter_map(|segments| segments.get(LabelKey::Node.as_str()))
            .map(String::as_str)
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }
}

/// Whether every segment is present in the drive's topology
pub fn matches_segments(topology: &BTreeMap<String, String>, segments: &Segments) -> bool {
    segments
        .iter()
        .all(|(key, value)| topology.get(key) == Some(value))
}

/// Preferred sets win; otherwise one requisite set must match
pub fn matches_topology(topology: &BTreeMap<String, String>, preferred: &[Segments], requisite: &[Segments]) -> bool {
    if preferred.iter().any(|s| matches_segments(topology, s)) {
        return true;
    }
    if !requisite.is_empty() {
        return requisite.iter().any(|s| matches_segments(topology, s));
    }
    preferred.is_empty()
}

fn matches_criteria(drive: &DirectPVDrive, criteria: &Criteria, claimed: &HashSet<String>) -> bool {
    if let Some(tier) = criteria.access_tier {
        if drive.access_tier() != tier {
            return false;
        }
    }
    if criteria.claim_id.is_some() && claimed.contains(&drive.drive_id()) {
        return false;
    }
    let labels = drive.labels();
    criteria
        .labels
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Drives eligible for the request. `claimed` holds the IDs of drives that
/// already host a volume with the requested claim ID.
pub fn filter_drives(drives: Vec<DirectPVDrive>, request: &SelectionRequest, claimed: &HashSet<String>) -> Vec<DirectPVDrive> {
    drives
        .into_iter()
        .filter(|d| !d.is_deleting())
        .filter(|d| d.health() == DriveHealth::Ready)
        .filter(|d| !d.is_unschedulable())
        .filter(|d| request.required_bytes == 0 || d.free_capacity() >= request.required_bytes)
        .filter(|d| matches_criteria(d, &request.criteria, claimed))
        .filter(|d| matches_topology(&d.topology(), &request.preferred, &request.requisite))
        .collect()
}

/// One of the drives with the most free capacity, chosen at random
pub fn pick_drive(mut candidates: Vec<DirectPVDrive>) -> Option<DirectPVDrive> {
    let max = candidates.iter().map(|d| d.free_capacity()).max()?;
    candidates.retain(|d| d.free_capacity() == max);
    let index = OsRng.gen_range(0..candidates.len());
    Some(candidates.swap_remove(index))
}

/// Select a drive for `request`
///
/// A drive already reserved for the volume is returned as-is so retried
/// requests are idempotent.
pub fn select_drive(drives: Vec<DirectPVDrive>, request: &SelectionRequest, claimed: &HashSet<String>) -> Result<DirectPVDrive> {
    if let Some(drive) = drives.iter().find(|d| d.has_volume(&request.name)) {
        return Ok(drive.clone());
    }

    let mut candidates = filter_drives(drives, request, claimed);
    // drives in a preferred segment beat drives admitted only by requisite
    if candidates
        .iter()
        .any(|d| request.preferred.iter().any(|s| matches_segments(&d.topology(), s)))
    {
        candidates.retain(|d| request.preferred.iter().any(|s| matches_segments(&d.topology(), s)));
    }
    if let Some(drive) = pick_drive(candidates) {
        return Ok(drive);
    }

    if request.has_topology() {
        return Err(Error::ResourceExhausted(format!(
            "no drive found for requested topology; requested node(s): {}; requested size: {} bytes",
            request.requested_nodes().join(","),
            request.required_bytes
        )));
    }
    if request.required_bytes > 0 {
        return Err(Error::OutOfRange(format!(
            "no drive found for requested size {} bytes",
            request.required_bytes
        )));
    }
    Err(Error::FailedPrecondition("no drive found".into()))
}

/// Drive IDs used by the claim, read from volumes' labels
pub fn claimed_drive_ids<'a>(volumes: impl IntoIterator<Item = &'a crate::crd::DirectPVVolume>) -> HashSet<String> {
    volumes
        .into_iter()
        .map(|v| v.drive_id().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}
