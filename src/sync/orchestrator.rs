//! Sync service and integration point for all sync components.
//!
//! This module defines the `SyncService`, which owns the lifecycle of the read cache:
//! - Restoring the checkpoint and wiring the reconciler to the ledger, object store and entity store
//! - Bootstrapping actors, medications and the bound identity's units
//! - Running the event subscriber as a background worker, starting after the checkpoint
//! - Exposing the runtime triggers (identity lookup and rebinding, full and owner resyncs)
//! - Stopping the worker within a bounded grace period
//!
//! The worker and the triggers share one `Reconciler` behind an async mutex, so a triggered resync
//! never interleaves with an event being applied.

use crate::config::SyncConfig;
use crate::gateway::{LedgerGateway, LedgerQueries};
use crate::objects::ObjectStore;
use crate::store::{CheckpointRepository, EntityRepository, EntityStore};
use crate::sync::{
    SyncError,
    checkpoint::CheckpointService,
    enricher::Enricher,
    progress_tracker::SyncStats,
    reconciler::Reconciler,
    subscriber::{BackoffPolicy, EventSubscriber},
};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// External collaborators of the sync core.
#[derive(Clone)]
pub struct SyncComponents {
    pub gateway: Arc<dyn LedgerGateway>,
    pub objects: Arc<dyn ObjectStore>,
    pub entities: Arc<dyn EntityStore>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
}

/// State of the background worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Stopped,
    Failed(String),
}

/// Main sync service
pub struct SyncService {
    reconciler: Arc<Mutex<Reconciler>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<Result<(), SyncError>>>>,
    status: watch::Receiver<WorkerStatus>,
    shutdown_grace: Duration,
}

impl SyncService {
    /// Bootstrap the cache and start the event worker.
    ///
    /// `identity`, if given, is bound before bootstrap (it replaces the checkpoint's identity).
    /// Ledger failures during bootstrap are logged and do not prevent the worker from starting;
    /// a checkpoint that cannot be read does.
    pub async fn start(
        components: SyncComponents,
        config: &SyncConfig,
        identity: Option<String>,
    ) -> Result<Self, SyncError> {
        let checkpoints = CheckpointService::new(components.checkpoints);
        let mut context = checkpoints.restore().await?;

        if let Some(identity) = identity.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
            if context.current_identity.as_deref() != Some(identity.as_str()) {
                info!(
                    "Using identity {} (checkpoint had {:?})",
                    identity, context.current_identity
                );
                context.current_identity = Some(identity);
                checkpoints.persist(&context).await?;
            }
        }

        let mut reconciler = Reconciler::new(
            LedgerQueries::new(components.gateway.clone()),
            Enricher::new(components.objects, config.enrichment_concurrency),
            EntityRepository::new(components.entities),
            checkpoints,
            context,
            config.max_event_attempts,
        );

        if let Err(e) = reconciler.bootstrap().await {
            error!(
                "Bootstrap failed, cache may be incomplete until the next resync: {}",
                e
            );
        }

        let reconciler = Arc::new(Mutex::new(reconciler));
        let cancel = CancellationToken::new();
        let subscriber = EventSubscriber::new(
            components.gateway,
            BackoffPolicy::from_config(config),
            cancel.clone(),
        );
        let (status_tx, status) = watch::channel(WorkerStatus::Running);

        let handler = reconciler.clone();
        let worker = tokio::spawn(async move {
            let result = subscriber.run(handler.as_ref()).await;
            let status = match &result {
                Ok(()) => WorkerStatus::Stopped,
                Err(e) => {
                    error!(
                        "Sync worker terminated, the cache is no longer updated: {}",
                        e
                    );
                    WorkerStatus::Failed(e.to_string())
                }
            };
            let _ = status_tx.send(status);
            result
        });
        info!("Sync service started");

        Ok(Self {
            reconciler,
            cancel,
            worker: Mutex::new(Some(worker)),
            status,
            shutdown_grace: config.shutdown_grace(),
        })
    }

    /// The bound identity, if any.
    pub async fn current_identity(&self) -> Option<String> {
        self.reconciler
            .lock()
            .await
            .current_identity()
            .map(str::to_string)
    }

    /// Rebind the local identity and resync its units. Returns `false` if it was already bound.
    pub async fn bind_identity(&self, actor_id: &str) -> Result<bool, SyncError> {
        self.reconciler.lock().await.bind_identity(actor_id).await
    }

    /// Re-run the bootstrap (all actors, all medications, the identity's units).
    pub async fn trigger_full_resync(&self) -> Result<(), SyncError> {
        info!("Full resync requested");
        self.reconciler.lock().await.bootstrap().await
    }

    /// Resync the units owned by `actor_id`. Returns the number of units cached for it.
    pub async fn trigger_owner_resync(&self, actor_id: &str) -> Result<usize, SyncError> {
        info!("Owner resync requested for {}", actor_id);
        self.reconciler.lock().await.resync_owner(actor_id).await
    }

    pub async fn stats(&self) -> SyncStats {
        self.reconciler.lock().await.stats()
    }

    pub async fn last_processed_block(&self) -> Option<u64> {
        self.reconciler.lock().await.context().last_processed_block
    }

    pub fn worker_status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Resolve once the worker has stopped on its own or been stopped.
    pub async fn stopped(&self) -> WorkerStatus {
        let mut status = self.status.clone();
        match status.wait_for(|s| *s != WorkerStatus::Running).await {
            Ok(s) => (*s).clone(),
            Err(_) => self.worker_status(),
        }
    }

    /// Stop the worker, waiting up to the configured grace period before aborting it, and
    /// persist the final checkpoint.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        info!("Stopping sync service");
        self.cancel.cancel();

        let worker = self.worker.lock().await.take();
        let mut result = Ok(());
        if let Some(mut worker) = worker {
            match tokio::time::timeout(self.shutdown_grace, &mut worker).await {
                Ok(Ok(worker_result)) => result = worker_result,
                Ok(Err(e)) => result = Err(SyncError::WorkerError(e.to_string())),
                Err(_) => {
                    warn!(
                        "Sync worker did not stop within {}s, aborting it",
                        self.shutdown_grace.as_secs()
                    );
                    worker.abort();
                }
            }
        }

        let mut reconciler = self.reconciler.lock().await;
        reconciler.log_progress();
        if let Err(e) = reconciler.persist_checkpoint().await {
            error!("Failed to persist final checkpoint: {}", e);
        }
        info!("Sync service stopped");
        result
    }
}
