use pharma_ledger_sync::config::Config;
use pharma_ledger_sync::gateway::{LedgerGatewayClient, LedgerQueries};
use pharma_ledger_sync::objects::IpfsClient;
use pharma_ledger_sync::store::{FileCheckpointRepository, FileEntityStore};
use pharma_ledger_sync::{SyncComponents, SyncService, WorkerStatus};

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting ledger read-cache sync");

	let config = match Config::load() {
		Ok(config) => config,
		Err(e) => {
			error!("Failed to load configuration: {}", e);
			return ExitCode::FAILURE;
		}
	};

	let gateway = match LedgerGatewayClient::new(
		config.gateway.url.clone(),
		config.gateway.ws_url.clone(),
		config.gateway.chaincode.clone(),
		Duration::from_secs(config.gateway.request_timeout_secs),
	) {
		Ok(client) => Arc::new(client),
		Err(e) => {
			error!("Failed to create gateway client: {}", e);
			return ExitCode::FAILURE;
		}
	};

	let objects = match IpfsClient::new(
		config.object_store.api_url.clone(),
		Duration::from_secs(config.object_store.timeout_secs),
		Duration::from_secs(config.object_store.failure_cooldown_mins * 60),
		config.object_store.cache_entries,
	) {
		Ok(client) => Arc::new(client),
		Err(e) => {
			error!("Failed to create object store client: {}", e);
			return ExitCode::FAILURE;
		}
	};

	let entities = match FileEntityStore::open(config.data_dir.clone()).await {
		Ok(store) => Arc::new(store),
		Err(e) => {
			error!("Failed to open entity store in {:?}: {}", config.data_dir, e);
			return ExitCode::FAILURE;
		}
	};
	let checkpoints = Arc::new(FileCheckpointRepository::new(config.data_dir.clone()));

	info!("Created gateway, object store and local stores");

	// Register (or look up) our own actor; sync continues under the stored identity if this fails.
	let identity = match LedgerQueries::new(gateway.clone()).init_call().await {
		Ok(actor) => {
			info!("Ledger identity is {} ({:?})", actor.id, actor.role);
			Some(actor.id)
		}
		Err(e) => {
			warn!("initCall failed, keeping the stored identity: {}", e);
			None
		}
	};

	let components = SyncComponents {
		gateway,
		objects,
		entities,
		checkpoints,
	};
	let service = match SyncService::start(components, &config.sync, identity).await {
		Ok(service) => service,
		Err(e) => {
			error!("Failed to start sync service: {}", e);
			return ExitCode::FAILURE;
		}
	};

	let worker_failed = tokio::select! {
		signal = tokio::signal::ctrl_c() => {
			if let Err(e) = signal {
				error!("Failed to listen for shutdown signal: {}", e);
			}
			info!("Shutdown requested");
			false
		}
		status = service.stopped() => matches!(status, WorkerStatus::Failed(_)),
	};

	if let Err(e) = service.shutdown().await {
		error!("Sync worker ended with error: {}", e);
		return ExitCode::FAILURE;
	}
	if worker_failed {
		return ExitCode::FAILURE;
	}

	info!("{}", service.stats().await.summary());
	ExitCode::SUCCESS
}
