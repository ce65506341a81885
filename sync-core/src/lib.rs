//! # sync-core
//!
//! Pure logic for opsync (no I/O, instant tests).
//!
//! This crate implements the log, conflict resolution and cycle state
//! machine for sync without any network or disk I/O, enabling fast unit
//! tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, disk) is performed by `sync-client`, which
//! interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod log_store;
pub mod state;
pub mod store;
pub mod tombstone;

pub use conflict::{ApplyError, ApplyOutcome, ConflictResolver, SkipReason, Stamp, Verdict};
pub use log_store::{LogError, OperationLogStore, RecordedError, RejectedOp, MAX_RECORDED_ERRORS};
pub use state::{calculate_backoff, Action, CycleState, Event, Phase, RetryPolicy, SyncEvent};
pub use store::{shape_of, EntityMap, EntityShape, EntityStore, MemoryStore, Snapshot, ARCHIVED_FIELD};
pub use tombstone::{Tombstone, TombstoneSet};
