//! Progress tracking for ledger synchronization.
//!
//! This module provides the `SyncProgressTracker`, which counts what the reconciler did with the
//! events it was handed (applied, skipped, failed, given up on) and how many owner resyncs ran,
//! and logs a progress line at regular intervals.

use std::collections::BTreeMap;
use tracing::info;

/// Events between two periodic progress lines.
const LOG_INTERVAL_EVENTS: usize = 100;

/// Service for tracking synchronization progress
#[derive(Debug, Clone, Default)]
pub struct SyncProgressTracker {
    /// The highest block an event was applied or skipped at
    highest_block: Option<u64>,
    /// Events applied, by event name
    applied_by_name: BTreeMap<String, usize>,
    events_skipped: usize,
    handler_failures: usize,
    /// Events skipped after exhausting their attempts
    events_abandoned: usize,
    owner_resyncs: usize,
    full_resyncs: usize,
    /// Total events seen when progress was last logged
    last_logged_at: usize,
}

impl SyncProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_block(&mut self, block: u64) {
        self.highest_block = Some(self.highest_block.map_or(block, |b| b.max(block)));
    }

    pub fn record_applied(&mut self, name: &str, block: u64) {
        self.record_block(block);
        *self.applied_by_name.entry(name.to_string()).or_default() += 1;
    }

    pub fn record_skipped(&mut self, block: u64) {
        self.record_block(block);
        self.events_skipped += 1;
    }

    pub fn record_failure(&mut self) {
        self.handler_failures += 1;
    }

    pub fn record_abandoned(&mut self, block: u64) {
        self.record_block(block);
        self.events_abandoned += 1;
    }

    pub fn record_owner_resync(&mut self) {
        self.owner_resyncs += 1;
    }

    pub fn record_full_resync(&mut self) {
        self.full_resyncs += 1;
    }

    fn events_seen(&self) -> usize {
        self.applied_by_name.values().sum::<usize>() + self.events_skipped + self.events_abandoned
    }

    /// Log progress every `LOG_INTERVAL_EVENTS` events or when forced
    pub fn log_progress(&mut self, force: bool) {
        let seen = self.events_seen();
        let should_log = force || seen.saturating_sub(self.last_logged_at) >= LOG_INTERVAL_EVENTS;

        if should_log && seen > 0 {
            info!("Sync progress: {}", self.get_stats().summary());
            self.last_logged_at = seen;
        }
    }

    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            highest_block: self.highest_block,
            events_applied: self.applied_by_name.values().sum(),
            applied_by_name: self.applied_by_name.clone(),
            events_skipped: self.events_skipped,
            handler_failures: self.handler_failures,
            events_abandoned: self.events_abandoned,
            owner_resyncs: self.owner_resyncs,
            full_resyncs: self.full_resyncs,
        }
    }
}

/// Statistics about the sync progress since startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub highest_block: Option<u64>,
    pub events_applied: usize,
    pub applied_by_name: BTreeMap<String, usize>,
    pub events_skipped: usize,
    pub handler_failures: usize,
    pub events_abandoned: usize,
    pub owner_resyncs: usize,
    pub full_resyncs: usize,
}

impl SyncStats {
    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        format!(
            "{} events applied, {} skipped, {} failed attempts{} up to block {}; {} owner resyncs, {} full resyncs",
            self.events_applied,
            self.events_skipped,
            self.handler_failures,
            if self.events_abandoned == 0 {
                String::new()
            } else {
                format!(" ({} abandoned)", self.events_abandoned)
            },
            self.highest_block
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.owner_resyncs,
            self.full_resyncs
        )
    }
}
