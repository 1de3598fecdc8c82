//! DirectPV - node-local CSI provisioner
//!
//! Exposes directly-attached drives as quota-enforced XFS volumes. One binary
//! runs in three roles: the cluster-wide CSI controller, the per-node CSI
//! node server and the CRD conversion webhook.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────────┐
//! │        controller            │      │           node-server             │
//! │  CSI Identity + Controller   │      │  CSI Identity + Node              │
//! │  drive selection             │      │  drive / volume / node /          │
//! │  reservation repairer        │      │  initrequest reconcilers          │
//! │  (leader elected)            │      │  volume health monitor            │
//! └──────────────┬───────────────┘      └──────────────┬───────────────────┘
//!                │        latest-version clients        │
//!                └───────────────┬──────────────────────┘
//!                     ┌──────────┴──────────┐
//!                     │  Kubernetes API     │◄── conversion-webhook
//!                     │  Drive Volume Node  │    (schema migrations)
//!                     │  InitRequest        │
//!                     └─────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`crd`]: resource types, labels and finalizers
//! - [`converter`]: schema migrations and the conversion webhook
//! - [`client`]: latest-version clients, events and the in-memory doubles
//! - [`lister`]: label selectors and streaming list queries
//! - [`controller`]: informers, work queues, dispatchers and leader election
//! - [`csi`]: gRPC identity, controller and node services
//! - [`node`]: host operations (mounts, quotas, formatting, device probing)
//! - [`drive`], [`volume`], [`initrequest`]: node-side reconcilers
//! - [`config`]: runtime configuration per role
//! - [`error`]: error types and handling

pub mod client;
pub mod config;
pub mod controller;
pub mod converter;
pub mod crd;
pub mod csi;
pub mod drive;
pub mod error;
pub mod initrequest;
pub mod lister;
pub mod node;
pub mod volume;

pub use client::{retry_on_conflict, Clients, ListOptions, ResourceClient};
pub use config::{ControllerConfig, NodeConfig, WebhookConfig};
pub use controller::{Dispatcher, EventHandler, EventKind, LeaderElector, LeaseConfig};
pub use converter::Converter;
pub use crd::{
    DirectPVDrive, DirectPVInitRequest, DirectPVNode, DirectPVVolume, DirectResource, DriveHealth,
    LabelKey,
};
pub use csi::{ControllerService, IdentityService, NodeService, NodeServiceConfig};
pub use drive::DriveEventHandler;
pub use error::{Error, ErrorAction, Result};
pub use initrequest::{InitConfig, InitRequestEventHandler, NodeEventHandler};
pub use node::{FakeNodeOps, LinuxNodeOps, NodeOps};
pub use volume::{VolumeEventHandler, VolumeHealthMonitor, VolumeReservationRepairer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
