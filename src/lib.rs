//! Read-cache synchronization for a permissioned pharmaceutical supply-chain ledger.
//!
//! The ledger is authoritative. This crate mirrors actors, medications and the units owned by the
//! local identity into a local store, bootstrapping from ledger queries and then following the
//! ledger's block-ordered event feed from a persisted checkpoint.

pub mod config;
pub mod gateway;
pub mod objects;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use sync::{SyncComponents, SyncError, SyncService, WorkerStatus};
