//! Schema conversion engine
//!
//! Migrates untyped DirectPV objects between schema versions. Versions form an
//! ordered list; a migration walks every adjacent step between the source and
//! the target, upgrading or downgrading, and rewrites `apiVersion` after each
//! step. Steps are total functions kept in a single registry keyed by
//! `(kind, from, to)`.

mod drive;
mod identity;
mod volume;
pub mod webhook;

use crate::crd::{LabelKey, GROUP, LATEST_VERSION};
use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

/// Supported schema versions, oldest first
pub const VERSIONS: [&str; 6] = ["v1alpha1", "v1beta1", "v1beta2", "v1beta3", "v1beta4", "v1"];

/// Kinds known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Drive,
    Volume,
    Node,
    InitRequest,
}

impl Kind {
    pub const ALL: [Kind; 4] = [Kind::Drive, Kind::Volume, Kind::Node, Kind::InitRequest];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Drive => "DirectPVDrive",
            Kind::Volume => "DirectPVVolume",
            Kind::Node => "DirectPVNode",
            Kind::InitRequest => "DirectPVInitRequest",
        }
    }

    /// Resolve a kind name; legacy `DirectCSI*` names map onto the same kinds
    pub fn parse(kind: &str) -> Result<Kind> {
        match kind {
            "DirectPVDrive" | "DirectCSIDrive" => Ok(Kind::Drive),
            "DirectPVVolume" | "DirectCSIVolume" => Ok(Kind::Volume),
            "DirectPVNode" => Ok(Kind::Node),
            "DirectPVInitRequest" => Ok(Kind::InitRequest),
            other => Err(Error::KindUnsupported(other.to_string())),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single migration step on an untyped object
pub type Step = fn(&mut Value) -> Result<()>;

/// Migration step registry
pub struct Converter {
    steps: HashMap<(Kind, &'static str, &'static str), Step>,
}

impl Default for Converter {
    fn default() -> Self {
        Self::new()
    }
}

impl Converter {
    /// Build a converter with every known step registered
    pub fn new() -> Self {
        let mut converter = Self {
            steps: HashMap::new(),
        };
        drive::register(&mut converter);
        volume::register(&mut converter);
        identity::register(&mut converter, Kind::Node);
        identity::register(&mut converter, Kind::InitRequest);
        converter
    }

    /// Process-wide shared converter
    pub fn global() -> &'static Converter {
        static CONVERTER: OnceLock<Converter> = OnceLock::new();
        CONVERTER.get_or_init(Converter::new)
    }

    /// Register an upgrade step and its inverse
    pub fn register(
        &mut self,
        kind: Kind,
        from: &'static str,
        to: &'static str,
        upgrade: Step,
        downgrade: Step,
    ) {
        self.steps.insert((kind, from, to), upgrade);
        self.steps.insert((kind, to, from), downgrade);
    }

    /// Migrate `object` to the group-version `to_api_version`
    pub fn migrate(&self, object: &Value, to_api_version: &str) -> Result<Value> {
        let kind_name = object
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let kind = Kind::parse(kind_name)?;

        let from_api_version = object
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let from = version_index(from_api_version)
            .ok_or_else(|| Error::InvalidFromVersion(from_api_version.to_string()))?;
        let to = version_index(to_api_version)
            .ok_or_else(|| Error::InvalidToVersion(to_api_version.to_string()))?;

        let mut migrated = object.clone();
        if from == to {
            return Ok(migrated);
        }

        stamp_version_label(&mut migrated, VERSIONS[from]);

        let path: Vec<(usize, usize)> = if from < to {
            (from..to).map(|i| (i, i + 1)).collect()
        } else {
            (to..from).rev().map(|i| (i + 1, i)).collect()
        };

        for (a, b) in path {
            let (step_from, step_to) = (VERSIONS[a], VERSIONS[b]);
            let step = self.steps.get(&(kind, step_from, step_to)).ok_or_else(|| {
                Error::Migration {
                    kind: kind.to_string(),
                    from: step_from.to_string(),
                    to: step_to.to_string(),
                    reason: "no step registered".to_string(),
                }
            })?;
            step(&mut migrated)?;
            set_api_version(&mut migrated, step_to);
        }
        if let Some(map) = migrated.as_object_mut() {
            map.insert("kind".to_string(), Value::String(kind.as_str().to_string()));
        }

        debug!(
            kind = %kind,
            from = VERSIONS[from],
            to = VERSIONS[to],
            "migrated object"
        );
        Ok(migrated)
    }

    /// Migrate an object to the latest version
    pub fn migrate_to_latest(&self, object: &Value) -> Result<Value> {
        self.migrate(object, &format!("{GROUP}/{LATEST_VERSION}"))
    }

    /// Migrate every item of a list and stamp the list envelope
    pub fn migrate_list(&self, list: &Value, to_api_version: &str) -> Result<Value> {
        let mut migrated = list.clone();
        if let Some(items) = migrated.get_mut("items").and_then(Value::as_array_mut) {
            for item in items.iter_mut() {
                *item = self.migrate(item, to_api_version)?;
            }
        }
        if let Some(envelope) = migrated.as_object_mut() {
            envelope.insert(
                "apiVersion".to_string(),
                Value::String(to_api_version.to_string()),
            );
        }
        Ok(migrated)
    }
}

/// Position of a group-version (or bare version) in [`VERSIONS`]
pub fn version_index(api_version: &str) -> Option<usize> {
    let version = match api_version.split_once('/') {
        Some((group, version)) if group == GROUP || group == LEGACY_GROUP => version,
        Some(_) => return None,
        None => api_version,
    };
    VERSIONS.iter().position(|v| *v == version)
}

/// API group used by the oldest schema versions
pub const LEGACY_GROUP: &str = "direct.csi.min.io";

fn set_api_version(object: &mut Value, version: &str) {
    if let Some(map) = object.as_object_mut() {
        map.insert(
            "apiVersion".to_string(),
            Value::String(format!("{GROUP}/{version}")),
        );
    }
}

fn stamp_version_label(object: &mut Value, version: &str) {
    let labels = labels_mut(object);
    if !labels.contains_key(LabelKey::Version.as_str()) {
        labels.insert(
            LabelKey::Version.as_str().to_string(),
            Value::String(version.to_string()),
        );
    }
}

// =============================================================================
// Value helpers shared by the step modules
// =============================================================================

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just made an object"),
    }
}

/// Object at `key`, created when missing or not an object
pub(crate) fn object_mut<'a>(parent: &'a mut Value, key: &str) -> &'a mut Map<String, Value> {
    let child = ensure_object(parent)
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    ensure_object(child)
}

pub(crate) fn status_mut(object: &mut Value) -> &mut Map<String, Value> {
    object_mut(object, "status")
}

pub(crate) fn spec_mut(object: &mut Value) -> &mut Map<String, Value> {
    object_mut(object, "spec")
}

pub(crate) fn labels_mut(object: &mut Value) -> &mut Map<String, Value> {
    let labels = object_mut(object, "metadata")
        .entry("labels".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    ensure_object(labels)
}

/// Move `from` to `to` within a map, leaving `to` untouched when `from` is absent
pub(crate) fn rename(map: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = map.remove(from) {
        map.insert(to.to_string(), value);
    }
}

/// Insert `value` at `key` only when the key is absent
pub(crate) fn seed(map: &mut Map<String, Value>, key: &str, value: Value) {
    map.entry(key.to_string()).or_insert(value);
}

/// Move a string field into a label
pub(crate) fn field_to_label(object: &mut Value, field: &str, label: LabelKey) {
    let value = status_mut(object).remove(field);
    if let Some(Value::String(value)) = value {
        if !value.is_empty() {
            labels_mut(object).insert(label.as_str().to_string(), Value::String(value));
        }
    }
}

/// Move a label back into a string field
pub(crate) fn label_to_field(object: &mut Value, label: LabelKey, field: &str) {
    let value = labels_mut(object).remove(label.as_str());
    if let Some(value) = value {
        status_mut(object).insert(field.to_string(), value);
    }
}
