//! Volume reconcilers
//!
//! - [`event`]: node side; purges a deleted volume's data and releases its
//!   drive reservation
//! - [`health`]: node side; periodic mount checks feeding the `Error`
//!   condition
//! - [`reservation`]: controller side; restores drive reservations lost
//!   between the two CreateVolume writes

pub mod event;
pub mod health;
pub mod reservation;

pub use event::VolumeEventHandler;
pub use health::VolumeHealthMonitor;
pub use reservation::VolumeReservationRepairer;
