//! Volume migration steps

use super::{field_to_label, label_to_field, rename, seed, status_mut, Converter, Kind};
use crate::crd::LabelKey;
use crate::error::Result;
use serde_json::Value;

pub(super) fn register(converter: &mut Converter) {
    converter.register(Kind::Volume, "v1alpha1", "v1beta1", seed_fsuuid, drop_fsuuid);
    converter.register(Kind::Volume, "v1beta1", "v1beta2", seed_status, drop_status);
    converter.register(Kind::Volume, "v1beta2", "v1beta3", to_target_path, to_container_path);
    converter.register(Kind::Volume, "v1beta3", "v1beta4", to_data_path, to_host_path);
    converter.register(Kind::Volume, "v1beta4", "v1", to_latest, from_latest);
}

fn seed_fsuuid(object: &mut Value) -> Result<()> {
    seed(status_mut(object), "fsuuid", Value::from(""));
    Ok(())
}

fn drop_fsuuid(object: &mut Value) -> Result<()> {
    status_mut(object).remove("fsuuid");
    Ok(())
}

fn seed_status(object: &mut Value) -> Result<()> {
    seed(status_mut(object), "status", Value::from("Ready"));
    Ok(())
}

fn drop_status(object: &mut Value) -> Result<()> {
    status_mut(object).remove("status");
    Ok(())
}

fn to_target_path(object: &mut Value) -> Result<()> {
    rename(status_mut(object), "containerPath", "targetPath");
    Ok(())
}

fn to_container_path(object: &mut Value) -> Result<()> {
    rename(status_mut(object), "targetPath", "containerPath");
    Ok(())
}

fn to_data_path(object: &mut Value) -> Result<()> {
    rename(status_mut(object), "hostPath", "dataPath");
    Ok(())
}

fn to_host_path(object: &mut Value) -> Result<()> {
    rename(status_mut(object), "dataPath", "hostPath");
    Ok(())
}

fn to_latest(object: &mut Value) -> Result<()> {
    rename(status_mut(object), "stagingPath", "stagingTargetPath");
    field_to_label(object, "nodeName", LabelKey::Node);
    field_to_label(object, "driveName", LabelKey::DriveId);
    Ok(())
}

fn from_latest(object: &mut Value) -> Result<()> {
    rename(status_mut(object), "stagingTargetPath", "stagingPath");
    label_to_field(object, LabelKey::Node, "nodeName");
    label_to_field(object, LabelKey::DriveId, "driveName");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::Converter;
    use serde_json::{json, Value};

    fn v1beta2_volume() -> Value {
        json!({
            "apiVersion": "directpv.min.io/v1beta2",
            "kind": "DirectPVVolume",
            "metadata": {"name": "pvc-9"},
            "status": {
                "fsuuid": "fs-1",
                "status": "Ready",
                "containerPath": "/var/lib/kubelet/pods/x/volumes/pvc-9",
                "hostPath": "/var/lib/direct-csi/mnt/fs-1/pvc-9",
                "stagingPath": "/var/lib/kubelet/plugins/stage/pvc-9",
                "nodeName": "node-1",
                "driveName": "drive-1",
                "totalCapacity": 1024,
            },
        })
    }

    #[test]
    fn test_upgrade_renames_paths() {
        let converter = Converter::new();
        let volume = converter.migrate(&v1beta2_volume(), "directpv.min.io/v1").unwrap();
        let status = &volume["status"];
        assert_eq!(status["targetPath"], "/var/lib/kubelet/pods/x/volumes/pvc-9");
        assert_eq!(status["dataPath"], "/var/lib/direct-csi/mnt/fs-1/pvc-9");
        assert_eq!(status["stagingTargetPath"], "/var/lib/kubelet/plugins/stage/pvc-9");
        assert!(status.get("containerPath").is_none());
        assert!(status.get("nodeName").is_none());
        let labels = &volume["metadata"]["labels"];
        assert_eq!(labels["directpv.min.io/node"], "node-1");
        assert_eq!(labels["directpv.min.io/drive"], "drive-1");
        assert_eq!(labels["directpv.min.io/version"], "v1beta2");
    }

    #[test]
    fn test_round_trip() {
        let converter = Converter::new();
        let original = v1beta2_volume();
        let latest = converter.migrate(&original, "directpv.min.io/v1").unwrap();
        let back = converter.migrate(&latest, "directpv.min.io/v1beta2").unwrap();
        assert_eq!(back["status"], original["status"]);
    }

    #[test]
    fn test_seeds_from_oldest() {
        let converter = Converter::new();
        let object = json!({
            "apiVersion": "directpv.min.io/v1alpha1",
            "kind": "DirectPVVolume",
            "metadata": {"name": "pvc-1"},
        });
        let latest = converter.migrate(&object, "directpv.min.io/v1").unwrap();
        assert_eq!(latest["status"]["fsuuid"], "");
        assert_eq!(latest["status"]["status"], "Ready");
    }
}
