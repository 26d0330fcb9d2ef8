//! Local persistent store for the read cache
//!
//! Holds the cached actor, medication and unit rows plus the singleton sync checkpoint.
//! Only the sync core writes here; readers go through the same traits.

/// Cached entity types and their wire names
pub mod entities;
/// Entity and checkpoint storage traits with in-memory and file-backed implementations
pub mod repositories;

pub use entities::*;
pub use repositories::*;
