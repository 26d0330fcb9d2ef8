//! Off-chain object store integration
//!
//! Content-addressed `put`/`get` of JSON documents referenced from ledger records, backed by
//! the IPFS HTTP API.

/// IPFS HTTP API client
mod ipfs;

pub use ipfs::IpfsClient;

/// Error types for object store operations
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
	#[error("Invalid content reference: '{0}'")]
	InvalidReference(String),

	#[error("Content {0} recently failed to resolve, not retrying yet")]
	RecentlyFailed(String),

	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("Object store returned {status} for {reference}")]
	Status {
		reference: String,
		status: reqwest::StatusCode,
	},

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Object {0} not found")]
	NotFound(String),
}

/// Content-addressed blob store for off-chain documents
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
	/// Store `bytes` and return their content hash.
	async fn put(&self, bytes: Vec<u8>) -> Result<String, ObjectStoreError>;

	/// Fetch the bytes stored under `hash`.
	async fn get(&self, hash: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

/// Strip the `ipfs://` scheme and surrounding whitespace from a content reference.
pub fn normalize_reference(reference: &str) -> &str {
	let trimmed = reference.trim();
	trimmed.strip_prefix("ipfs://").unwrap_or(trimmed).trim()
}

/// Whether `hash` looks like a CIDv0 (`Qm` + 44 chars) or a base32 CIDv1 (`b...`).
pub fn is_valid_hash(hash: &str) -> bool {
	let hash = hash.trim();
	(hash.starts_with("Qm") && hash.len() == 46) || (hash.starts_with('b') && hash.len() > 30)
}
