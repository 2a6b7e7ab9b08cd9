#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! The coordinator's single-threaded dispatch engine: Action Store, worker
//! registry, scheduler, batch slots, host mapping, Persistence Mirror,
//! Timer Engine, reporting, and crash recovery, tied together by
//! [`coordinator::Coordinator`].
//!
//! Nothing here spawns a task that touches shared state concurrently; the
//! binary crate owns the `tokio::select!` loop and calls into `Coordinator`
//! synchronously from a single task.

pub mod batch;
pub mod coordinator;
pub mod hostmap;
pub mod mirror;
pub mod queue;
pub mod recovery;
pub mod reporting;
pub mod scheduler;
pub mod store;
pub mod timer;
pub mod worker;

pub use coordinator::Coordinator;
