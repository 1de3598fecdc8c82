//! Event dispatch framework
//!
//! An informer per handler lists and watches one kind, a rate-limited work
//! queue deduplicates keys, and a pool of workers runs the handler. Handlers
//! that must be singletons run under a Lease.

pub mod dispatcher;
pub mod informer;
pub mod leader;
pub mod queue;

pub use dispatcher::{Dispatcher, EventHandler, DEFAULT_WORKERS};
pub use informer::{Event, EventKind, EventSink, Informer};
pub use leader::{can_acquire, LeaderElector, LeaseConfig};
pub use queue::{RateLimiter, WorkQueue};
