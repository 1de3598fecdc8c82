//! Host layer of the node server
//!
//! - [`ops`]: the capability trait and its in-memory double
//! - [`linux`]: mounts, quotas and formatting on a real node
//! - [`probe`]: sysfs block device discovery
//! - [`paths`]: where drives, metadata and volume data live

pub mod linux;
pub mod ops;
pub mod paths;
pub mod probe;

pub use linux::{parse_mountinfo, project_id, LinuxNodeOps};
pub use ops::{FakeNodeOps, MountEntry, MountTable, NodeOps, Quota};
pub use paths::{drive_mount_point, meta_info_path, volume_data_path, MetaInfo};
pub use probe::{DeviceProbe, ProbeConfig};
