//! Distlock Store - Coordination store capability
//!
//! This crate provides:
//! - The `CoordinationStore` trait: leases, atomic create, ordered prefix reads,
//!   deletes and key watches
//! - `MemoryStore`: an in-process implementation with lease expiry and fault
//!   injection, used by tests and the demo binary

pub mod memory;
pub mod model;
pub mod store;

pub use memory::{MemoryStore, MemoryStoreConfig};
pub use model::{KeyValue, WatchEvent, WatchStream};
pub use store::CoordinationStore;
