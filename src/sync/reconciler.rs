//! Event reconciliation.
//!
//! This module defines the `Reconciler`, which turns decoded ledger events into entity store
//! writes and keeps the checkpoint in step with them. Event payloads are treated as notifications:
//! where the ledger offers a query for the canonical post-state, the reconciler fetches it rather
//! than trusting the payload. The two exceptions are batch creation, where the payload is the only
//! source for the sibling units, and transfers, where the payload names the owners to resync.
//!
//! The reconciler also owns the whole-cache operations built from the same pieces: bootstrap,
//! owner resync and identity binding.

use crate::gateway::LedgerQueries;
use crate::store::{Actor, EntityRepository, Medication, Role, Unit};
use crate::sync::{
    SyncError,
    batch::reconstruct_batch,
    checkpoint::{CheckpointService, SyncContext},
    enricher::Enricher,
    events::{Delivery, EventHandler, EventKind, LedgerEvent},
    progress_tracker::{SyncProgressTracker, SyncStats},
};

use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What applying an event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Applied,
    Skipped,
}

/// Identifies an event across redeliveries of its block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EventKey {
    block: u64,
    tx_id: String,
    name: String,
}

impl EventKey {
    fn of(event: &LedgerEvent) -> Self {
        Self {
            block: event.block_number,
            tx_id: event.tx_id.clone(),
            name: event.name.clone(),
        }
    }
}

/// Applies ledger events and resyncs to the local entity store
pub struct Reconciler {
    queries: LedgerQueries,
    enricher: Enricher,
    entities: EntityRepository,
    checkpoints: CheckpointService,
    context: SyncContext,
    tracker: SyncProgressTracker,
    /// `0` retries a failing event forever.
    max_event_attempts: u32,
    /// Failed attempts per event of the open block. Entries at the cap mark abandoned events.
    attempts: HashMap<EventKey, u32>,
}

impl Reconciler {
    pub fn new(
        queries: LedgerQueries,
        enricher: Enricher,
        entities: EntityRepository,
        checkpoints: CheckpointService,
        context: SyncContext,
        max_event_attempts: u32,
    ) -> Self {
        Self {
            queries,
            enricher,
            entities,
            checkpoints,
            context,
            tracker: SyncProgressTracker::new(),
            max_event_attempts,
            attempts: HashMap::new(),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn current_identity(&self) -> Option<&str> {
        self.context.current_identity.as_deref()
    }

    pub fn resume_from_block(&self) -> u64 {
        self.context.resume_from_block()
    }

    pub fn stats(&self) -> SyncStats {
        self.tracker.get_stats()
    }

    pub fn log_progress(&mut self) {
        self.tracker.log_progress(true);
    }

    pub async fn persist_checkpoint(&self) -> Result<(), SyncError> {
        Ok(self.checkpoints.persist(&self.context).await?)
    }

    /// Apply one event of the feed.
    ///
    /// The checkpoint moves past a block once an event of a later block arrives. On failure the
    /// feed is reopened at the open block and the whole block is replayed. An event that keeps
    /// failing is skipped once it has used up `max_event_attempts`, and stays skipped when its
    /// block is replayed. Events the ledger refuses outright are skipped at once.
    pub async fn apply_event(&mut self, event: LedgerEvent) -> Delivery {
        let block = event.block_number;
        if let Err(e) = self.close_completed_block(block).await {
            return self.handle_failure(&event, e).await;
        }
        self.context.enter_block(block);

        let key = EventKey::of(&event);
        if self.is_abandoned(&key) {
            debug!(
                "Skipping {} at block {} (tx {}), abandoned earlier",
                event.name, block, event.tx_id
            );
            self.tracker.record_skipped(block);
            return Delivery::Skipped;
        }

        match self.dispatch(&event).await {
            Ok(outcome) => {
                self.attempts.remove(&key);
                let delivery = match outcome {
                    Outcome::Applied => {
                        self.tracker.record_applied(&event.name, block);
                        Delivery::Applied
                    }
                    Outcome::Skipped => {
                        self.tracker.record_skipped(block);
                        Delivery::Skipped
                    }
                };
                self.tracker.log_progress(false);
                delivery
            }
            Err(e) if e.is_ledger_rejection() => {
                warn!(
                    "Ledger refused {} at block {} (tx {}), skipping: {}",
                    event.name, block, event.tx_id, e
                );
                self.attempts.remove(&key);
                self.tracker.record_skipped(block);
                Delivery::Skipped
            }
            Err(e) => self.handle_failure(&event, e).await,
        }
    }

    async fn dispatch(&mut self, event: &LedgerEvent) -> Result<Outcome, SyncError> {
        debug!(
            "Applying {} at block {} (tx {})",
            event.name, event.block_number, event.tx_id
        );

        match &event.kind {
            EventKind::ActorChanged { actor_id } => self.refresh_actor(actor_id).await,
            EventKind::ActorDeleted { actor_id } => {
                self.entities.delete::<Actor>(actor_id).await?;
                info!("Removed actor {} from cache", actor_id);
                Ok(Outcome::Applied)
            }
            EventKind::MedicationChanged { med_id } => self.refresh_medication(med_id).await,
            EventKind::MedicationDeleted { med_id } => {
                self.entities.delete::<Medication>(med_id).await?;
                info!("Removed medication {} from cache", med_id);
                Ok(Outcome::Applied)
            }
            EventKind::UnitsCreated { unit_id, template } => {
                self.create_units(unit_id, template.as_deref()).await
            }
            EventKind::UnitTemperatureAdded { unit_id } => self.refresh_unit(unit_id).await,
            EventKind::UnitTransferred {
                unit_id,
                previous_owner,
                new_owner,
            } => {
                self.transfer_unit(
                    unit_id.as_deref(),
                    previous_owner.as_deref(),
                    new_owner.as_deref(),
                )
                .await
            }
            EventKind::UnitDeleted { unit_id } => {
                self.entities.delete::<Unit>(unit_id).await?;
                info!("Removed unit {} from cache", unit_id);
                Ok(Outcome::Applied)
            }
            EventKind::Malformed { issue } => {
                warn!(
                    "Skipping {} at block {} (tx {}): {}. Payload: {}",
                    event.name, event.block_number, event.tx_id, issue, event.payload
                );
                Ok(Outcome::Skipped)
            }
            EventKind::Unknown => {
                warn!(
                    "Unknown event '{}' at block {}, skipping",
                    event.name, event.block_number
                );
                Ok(Outcome::Skipped)
            }
        }
    }

    async fn refresh_actor(&mut self, actor_id: &str) -> Result<Outcome, SyncError> {
        let actor = self.queries.actor_by_id(actor_id).await?;
        if let Some(role) = Role::from_actor_id(&actor.id).filter(|role| *role != actor.role) {
            warn!(
                "Actor {} is stored with role {:?} but its id says {:?}",
                actor.id, actor.role, role
            );
        }

        let actor = self.enricher.enrich(actor).await;
        self.entities.upsert(&actor).await?;
        debug!("Cached actor {}", actor.id);
        Ok(Outcome::Applied)
    }

    async fn refresh_medication(&mut self, med_id: &str) -> Result<Outcome, SyncError> {
        let medication = self.queries.medication_by_id(med_id).await?;
        if let Some(cached) = self.entities.find::<Medication>(med_id).await? {
            if !cached.status.can_transition_to(medication.status) {
                warn!(
                    "Medication {} went from {:?} to {:?}, which the ledger should not allow",
                    med_id, cached.status, medication.status
                );
            }
        }

        let medication = self.enricher.enrich(medication).await;
        self.entities.upsert(&medication).await?;
        debug!("Cached medication {}", medication.id);
        Ok(Outcome::Applied)
    }

    async fn refresh_unit(&mut self, unit_id: &str) -> Result<Outcome, SyncError> {
        let unit = self.queries.unit_by_id(unit_id).await?;
        let unit = self.enricher.enrich(unit).await;
        self.entities.upsert(&unit).await?;
        debug!("Cached unit {}", unit.id);
        Ok(Outcome::Applied)
    }

    /// Rebuild a batch from its last unit.
    ///
    /// The delivered unit is always written. Its siblings are only inserted where no row exists
    /// yet; an existing row is newer than the creation payload.
    async fn create_units(
        &mut self,
        unit_id: &str,
        template: Option<&Unit>,
    ) -> Result<Outcome, SyncError> {
        let Some(template) = template else {
            warn!(
                "UnitCreated payload for {} is not a unit document, fetching the unit instead",
                unit_id
            );
            return self.refresh_unit(unit_id).await;
        };

        let template = self.enricher.enrich(template.clone()).await;
        let Some(mut batch) = reconstruct_batch(&template) else {
            warn!(
                "Unit id {} carries no batch sequence, fetching the single unit",
                unit_id
            );
            return self.refresh_unit(unit_id).await;
        };

        let total = batch.len();
        let delivered = batch.pop();
        let mut rows = Vec::with_capacity(total);
        for sibling in batch {
            if self.entities.find::<Unit>(&sibling.id).await?.is_none() {
                rows.push(sibling);
            }
        }
        let inserted = rows.len();
        rows.extend(delivered);

        self.entities.upsert_many(&rows).await?;
        info!(
            "Batch {} of {}: {} units, {} siblings inserted, {} already cached",
            template.batch_label,
            template.medication_id,
            total,
            inserted,
            total - 1 - inserted
        );
        Ok(Outcome::Applied)
    }

    async fn transfer_unit(
        &mut self,
        unit_id: Option<&str>,
        previous_owner: Option<&str>,
        new_owner: Option<&str>,
    ) -> Result<Outcome, SyncError> {
        match (previous_owner, new_owner) {
            (Some(from), Some(to)) => {
                self.resync_owner(from).await?;
                if to != from {
                    self.resync_owner(to).await?;
                }
                Ok(Outcome::Applied)
            }
            _ => match unit_id {
                Some(unit_id) => {
                    warn!(
                        "Transfer of {} does not name both owners, refreshing the unit only",
                        unit_id
                    );
                    self.refresh_unit(unit_id).await
                }
                None => Ok(Outcome::Skipped),
            },
        }
    }

    /// Replace every cached unit owned by `actor_id` with what the ledger returns for that owner.
    ///
    /// Returns the number of units now cached for the owner.
    pub async fn resync_owner(&mut self, actor_id: &str) -> Result<usize, SyncError> {
        let actor_id = actor_id.trim();
        if actor_id.is_empty() {
            debug!("Ignoring owner resync without an actor id");
            return Ok(0);
        }

        let units = self.queries.units_by_owner(actor_id).await?;
        let units = self.enricher.enrich_all(units).await;

        let removed = self.entities.delete_by_owner::<Unit>(actor_id).await?;
        self.entities.upsert_many(&units).await?;
        self.tracker.record_owner_resync();

        info!(
            "Resynced units of {}: {} removed, {} stored",
            actor_id,
            removed,
            units.len()
        );
        Ok(units.len())
    }

    /// Replace all actors and medications with the ledger's, then resync the bound identity's units.
    pub async fn bootstrap(&mut self) -> Result<(), SyncError> {
        info!("Bootstrapping cache from the ledger");
        let (actors, medications) =
            futures::try_join!(self.queries.all_actors(), self.queries.all_medications())?;

        let actors = self.enricher.enrich_all(actors).await;
        self.entities.replace_all(&actors).await?;
        let medications = self.enricher.enrich_all(medications).await;
        self.entities.replace_all(&medications).await?;
        info!(
            "Cached {} actors and {} medications",
            actors.len(),
            medications.len()
        );

        if let Some(identity) = self.context.current_identity.clone() {
            self.resync_owner(&identity).await?;
        } else {
            info!("No identity bound, skipping unit resync");
        }

        self.tracker.record_full_resync();
        Ok(())
    }

    /// Bind the local identity, persist it and resync its units.
    ///
    /// Returns `false` if `actor_id` was already bound (or empty), in which case nothing happens.
    /// Units cached for a previously bound identity are left in place.
    pub async fn bind_identity(&mut self, actor_id: &str) -> Result<bool, SyncError> {
        let actor_id = actor_id.trim();
        if actor_id.is_empty() {
            warn!("Refusing to bind an empty identity");
            return Ok(false);
        }
        if self.context.current_identity.as_deref() == Some(actor_id) {
            debug!("Identity {} already bound", actor_id);
            return Ok(false);
        }

        info!(
            "Binding identity {} (previously {:?})",
            actor_id, self.context.current_identity
        );
        let mut next = self.context.clone();
        next.current_identity = Some(actor_id.to_string());
        self.checkpoints.persist(&next).await?;
        self.context = next;

        self.resync_owner(actor_id).await?;
        Ok(true)
    }

    /// Persist the open block as processed once an event of a later block arrives.
    async fn close_completed_block(&mut self, block: u64) -> Result<(), SyncError> {
        let Some(completed) = self.context.completed_by(block) else {
            return Ok(());
        };

        let mut next = self.context.clone();
        next.close_block(completed, block);
        self.checkpoints.persist(&next).await?;
        self.context = next;
        self.attempts.retain(|key, _| key.block >= block);
        Ok(())
    }

    fn is_abandoned(&self, key: &EventKey) -> bool {
        self.max_event_attempts > 0
            && self
                .attempts
                .get(key)
                .is_some_and(|attempts| *attempts >= self.max_event_attempts)
    }

    async fn handle_failure(&mut self, event: &LedgerEvent, error: SyncError) -> Delivery {
        self.tracker.record_failure();
        let block = event.block_number;
        let attempts = self.attempts.entry(EventKey::of(event)).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;

        if self.max_event_attempts > 0 && attempts >= self.max_event_attempts {
            error!(
                "Giving up on {} at block {} (tx {}) after {} attempts: {}. Payload: {}",
                event.name, block, event.tx_id, attempts, error, event.payload
            );
            self.tracker.record_abandoned(block);
            return Delivery::Skipped;
        }

        error!(
            "Failed to apply {} at block {} (tx {}), attempt {}: {}",
            event.name, block, event.tx_id, attempts, error
        );
        if let Some(open) = self.context.open_block() {
            debug!("Block {} will be replayed from its first event", open);
        }
        Delivery::Retry
    }
}

/// The worker and runtime triggers share one reconciler; the lock serializes them.
#[async_trait::async_trait]
impl EventHandler for Mutex<Reconciler> {
    async fn resume_from_block(&self) -> u64 {
        self.lock().await.resume_from_block()
    }

    async fn handle(&self, event: LedgerEvent) -> Delivery {
        self.lock().await.apply_event(event).await
    }
}
