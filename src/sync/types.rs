use crate::gateway::{GatewayError, QueryError};
use crate::store::StoreError;

/// Error types for the sync core
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Ledger query error: {0}")]
	QueryError(#[from] QueryError),

	#[error("Gateway error: {0}")]
	GatewayError(#[from] GatewayError),

	#[error("Store error: {0}")]
	StoreError(#[from] StoreError),

	#[error("Sync worker error: {0}")]
	WorkerError(String),
}

impl SyncError {
	/// Whether the ledger answered and refused, so asking again gets the same answer.
	///
	/// Typical case: a record was deleted in a later block and its earlier events are replayed.
	pub fn is_ledger_rejection(&self) -> bool {
		match self {
			SyncError::QueryError(QueryError::Call { source, .. }) | SyncError::GatewayError(source) => {
				matches!(source, GatewayError::Rejected { .. })
			}
			SyncError::QueryError(QueryError::Decode { .. }) => true,
			SyncError::StoreError(_) | SyncError::WorkerError(_) => false,
		}
	}
}
