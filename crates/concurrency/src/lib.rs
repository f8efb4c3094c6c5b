//! Concurrency layer for Cairn
//!
//! This crate implements the storage-slot machinery:
//! - Slot: move-only handle to one physical storage connection
//! - SlotPool: bounded pool with fair, timed acquisition
//! - SlotTracker: per-session record of which transaction holds which slot,
//!   with drain-and-wait support for shutdown

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pool;
pub mod slot;
pub mod tracker;

pub use pool::{PoolStats, SlotPool};
pub use slot::{Slot, SlotConnection, SlotId};
pub use tracker::SlotTracker;
