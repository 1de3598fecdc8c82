//! Drive initialization
//!
//! An operator turns the devices a node reports into an [`InitConfig`],
//! selects some and submits them as InitRequests. The node formats the
//! selected devices and publishes them as drives.

pub mod config;
pub mod event;
pub mod node;

pub use config::{DriveInfo, InitConfig, NodeInfo, INIT_CONFIG_VERSION};
pub use event::InitRequestEventHandler;
pub use node::NodeEventHandler;
