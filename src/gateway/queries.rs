//! Typed ledger queries used by the sync core.

use super::types::{GatewayError, LedgerGateway};
use crate::store::{Actor, Medication, Unit};

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

/// Failure of a typed ledger query: either the call itself or decoding its result.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
	#[error("Ledger call '{name}' failed: {source}")]
	Call {
		name: &'static str,
		#[source]
		source: GatewayError,
	},

	#[error("Could not decode result of '{name}': {source}")]
	Decode {
		name: &'static str,
		#[source]
		source: serde_json::Error,
	},
}

/// Evaluate-only queries (plus the identity bootstrap call) over a LedgerGateway.
#[derive(Clone)]
pub struct LedgerQueries {
	gateway: Arc<dyn LedgerGateway>,
}

impl LedgerQueries {
	pub fn new(gateway: Arc<dyn LedgerGateway>) -> Self {
		Self { gateway }
	}

	async fn evaluate<T: DeserializeOwned>(
		&self,
		name: &'static str,
		args: &[&str],
	) -> Result<T, QueryError> {
		let bytes = self
			.gateway
			.evaluate(name, args)
			.await
			.map_err(|source| QueryError::Call { name, source })?;
		debug!("Evaluated '{}' {:?}: {} bytes", name, args, bytes.len());
		serde_json::from_slice(&bytes).map_err(|source| QueryError::Decode { name, source })
	}

	/// Register (or look up) the calling identity on the ledger and return its actor record.
	pub async fn init_call(&self) -> Result<Actor, QueryError> {
		const NAME: &str = "initCall";
		let bytes = self
			.gateway
			.submit(NAME, &[])
			.await
			.map_err(|source| QueryError::Call { name: NAME, source })?;
		serde_json::from_slice(&bytes).map_err(|source| QueryError::Decode { name: NAME, source })
	}

	pub async fn actor_by_id(&self, actor_id: &str) -> Result<Actor, QueryError> {
		self.evaluate("queryActorById", &[actor_id]).await
	}

	pub async fn all_actors(&self) -> Result<Vec<Actor>, QueryError> {
		self.evaluate("queryAllActors", &[]).await
	}

	pub async fn medication_by_id(&self, med_id: &str) -> Result<Medication, QueryError> {
		self.evaluate("queryMedikamentById", &[med_id]).await
	}

	pub async fn all_medications(&self) -> Result<Vec<Medication>, QueryError> {
		self.evaluate("queryAllMedikamente", &[]).await
	}

	pub async fn unit_by_id(&self, unit_id: &str) -> Result<Unit, QueryError> {
		self.evaluate("queryUnitById", &[unit_id]).await
	}

	pub async fn units_by_owner(&self, owner_id: &str) -> Result<Vec<Unit>, QueryError> {
		self.evaluate("queryUnitsByOwner", &[owner_id]).await
	}
}
