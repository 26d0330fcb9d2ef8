//! Ledger Synchronization Module
//!
//! This module provides the core logic for keeping the local read cache in step with the ledger.
//! It is composed of several submodules, each responsible for a specific aspect of the sync process:
//!
//! - `orchestrator`: The `SyncService` entry point. It bootstraps the cache, runs the worker and exposes the runtime triggers.
//! - `events`: Decodes raw ledger events into a closed event type and defines the handler trait the subscriber drives.
//! - `subscriber`: Keeps the event feed open with exponential backoff and cancellation.
//! - `reconciler`: Applies events, owner resyncs, bootstrap and identity binding to the entity store.
//! - `batch`: Reconstructs a unit batch from its last unit.
//! - `enricher`: Resolves off-chain document references.
//! - `checkpoint`: Persists the bound identity and the last processed block.
//! - `progress_tracker`: Counts what the reconciler did and logs progress.

/// Unit batch reconstruction
pub mod batch;
/// Checkpoint context and persistence
pub mod checkpoint;
/// Off-chain enrichment
pub mod enricher;
/// Ledger event decoding and the handler trait
pub mod events;
/// Main coordinator for the sync process
pub mod orchestrator;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Applies events and resyncs to the entity store
pub mod reconciler;
/// Reconnecting event feed consumer
pub mod subscriber;
/// Error types for the sync core
pub mod types;

pub use orchestrator::*;
pub use types::*;
