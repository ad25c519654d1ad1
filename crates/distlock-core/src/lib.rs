//! Distlock Core - Distributed mutual exclusion over a coordination store
//!
//! This crate provides:
//! - Lease sessions with a background keep-alive worker
//! - A contention queue ordered by store-assigned revisions
//! - The distributed mutex state machine
//! - `LockManager`, the facade handing out lock handles

pub mod cancel;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod mutex;
pub mod queue;
pub mod session;

pub use cancel::CancelSignal;
pub use config::LockConfig;
pub use manager::{LockHandle, LockManager};
pub use model::{AcquireOptions, LockStats, MutexState, Rank, SessionState};
pub use mutex::DistributedMutex;
pub use queue::{ContentionQueue, QueueEntry};
pub use session::Session;

pub use distlock_common::{LockError, StoreError};
