//! Checkpoint persistence for the sync core.
//!
//! This module provides the `SyncContext`, the in-memory view of the persisted checkpoint (bound
//! identity and last fully processed block), and the `CheckpointService` that loads and saves it
//! through a `CheckpointRepository`.
//!
//! The checkpoint is block-granular while events are delivered one at a time, and a block may
//! hold several events. A block only counts as processed once an event of a later block arrives,
//! so the stored checkpoint never names a block whose remaining events could still be lost to a
//! dropped feed, a shutdown or a crash. Resubscribing replays the open block from its first event.

use crate::store::{CheckpointRepository, StoreError, SyncCheckpoint};

use std::sync::Arc;
use tracing::{debug, info};

/// Mutable sync state mirrored into the checkpoint record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncContext {
    pub current_identity: Option<String>,
    /// Highest block whose events have all been applied.
    pub last_processed_block: Option<u64>,
    /// Block whose events are being applied.
    open_block: Option<u64>,
}

impl SyncContext {
    pub fn from_checkpoint(checkpoint: &SyncCheckpoint) -> Self {
        Self {
            current_identity: checkpoint.current_identity_id.clone(),
            last_processed_block: checkpoint.last_processed_block,
            open_block: None,
        }
    }

    pub fn to_checkpoint(&self) -> SyncCheckpoint {
        SyncCheckpoint {
            current_identity_id: self.current_identity.clone(),
            last_processed_block: self.last_processed_block,
            ..SyncCheckpoint::default()
        }
    }

    /// First block the event feed should deliver.
    pub fn resume_from_block(&self) -> u64 {
        self.last_processed_block.map(|b| b + 1).unwrap_or(0)
    }

    pub fn open_block(&self) -> Option<u64> {
        self.open_block
    }

    /// Checkpoint value once an event of `block` arrives, if that completes the open block.
    pub fn completed_by(&self, block: u64) -> Option<u64> {
        match self.open_block {
            Some(open) if block > open => {
                Some(self.last_processed_block.map_or(open, |b| b.max(open)))
            }
            _ => None,
        }
    }

    /// Record `completed` as processed and open `block`.
    pub fn close_block(&mut self, completed: u64, block: u64) {
        self.last_processed_block = Some(completed);
        self.open_block = Some(block);
    }

    /// Note that an event of `block` is about to be applied. Never moves back to an earlier block.
    pub fn enter_block(&mut self, block: u64) {
        if self.open_block.is_none_or(|open| block > open) {
            self.open_block = Some(block);
        }
    }
}

/// Service for loading and saving the sync checkpoint.
#[derive(Clone)]
pub struct CheckpointService {
    repository: Arc<dyn CheckpointRepository>,
}

impl CheckpointService {
    pub fn new(repository: Arc<dyn CheckpointRepository>) -> Self {
        Self { repository }
    }

    /// Load the checkpoint, or start fresh if none exists.
    pub async fn restore(&self) -> Result<SyncContext, StoreError> {
        match self.repository.load().await? {
            Some(checkpoint) => {
                info!(
                    "Restored checkpoint: identity {:?}, last processed block {:?}",
                    checkpoint.current_identity_id, checkpoint.last_processed_block
                );
                Ok(SyncContext::from_checkpoint(&checkpoint))
            }
            None => {
                info!("No checkpoint found, starting from the first block");
                Ok(SyncContext::default())
            }
        }
    }

    pub async fn persist(&self, context: &SyncContext) -> Result<(), StoreError> {
        self.repository.save(&context.to_checkpoint()).await?;
        debug!(
            "Checkpoint persisted at block {:?}",
            context.last_processed_block
        );
        Ok(())
    }
}
