//! Node-side drive reconciler

pub mod event;

pub use event::DriveEventHandler;
