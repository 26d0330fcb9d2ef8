//!
//! IPFS HTTP API client with a content cache and a negative cache for failed hashes.

use super::{ObjectStore, ObjectStoreError, is_valid_hash, normalize_reference};

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use lru::LruCache;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Deserialize)]
struct AddResponse {
	#[serde(rename = "Hash")]
	hash: String,
}

/// Hashes whose last fetch failed, kept for a cooldown period.
///
/// At most `capacity` hashes are remembered; the oldest failure is forgotten first.
#[derive(Debug)]
struct FailedHashes {
	cooldown: Duration,
	failed_at: LruCache<String, Instant>,
}

impl FailedHashes {
	fn new(cooldown: Duration, capacity: NonZeroUsize) -> Self {
		Self {
			cooldown,
			failed_at: LruCache::new(capacity),
		}
	}

	/// Whether `hash` is still cooling down at `now`; expired entries are dropped.
	fn is_blocked(&mut self, hash: &str, now: Instant) -> bool {
		match self.failed_at.peek(hash) {
			Some(failed) if now.duration_since(*failed) < self.cooldown => true,
			Some(_) => {
				self.failed_at.pop(hash);
				false
			}
			None => false,
		}
	}

	fn record(&mut self, hash: &str, now: Instant) {
		// failures are recorded in time order, so expired entries sit at the cold end
		while let Some((_, failed)) = self.failed_at.peek_lru() {
			if now.duration_since(*failed) < self.cooldown {
				break;
			}
			self.failed_at.pop_lru();
		}
		self.failed_at.put(hash.to_string(), now);
	}
}

/// IPFS object store client
pub struct IpfsClient {
	http_client: Client,
	api_url: String,
	/// Content is immutable per hash, so successful reads are kept (least recently used evicted).
	content_cache: Mutex<LruCache<String, Vec<u8>>>,
	failed_hashes: Mutex<FailedHashes>,
}

impl IpfsClient {
	/// Create a new IPFS client.
	///
	/// # Arguments
	/// * `api_url` - Base URL of the IPFS HTTP API (e.g. `http://localhost:5001`).
	/// * `timeout` - Per-request timeout.
	/// * `failure_cooldown` - How long a failed hash is not retried.
	/// * `cache_entries` - How many documents (and failed hashes) are kept in memory.
	pub fn new(
		api_url: String,
		timeout: Duration,
		failure_cooldown: Duration,
		cache_entries: usize,
	) -> Result<Self, ObjectStoreError> {
		let capacity = NonZeroUsize::new(cache_entries).unwrap_or(NonZeroUsize::MIN);
		let http_client = Client::builder().timeout(timeout).build()?;
		info!(
			"IPFS client initialised for {} with timeout {}s",
			api_url,
			timeout.as_secs()
		);

		Ok(Self {
			http_client,
			api_url: api_url.trim_end_matches('/').to_string(),
			content_cache: Mutex::new(LruCache::new(capacity)),
			failed_hashes: Mutex::new(FailedHashes::new(failure_cooldown, capacity)),
		})
	}

	async fn remember(&self, hash: &str, content: Vec<u8>) {
		self.content_cache.lock().await.put(hash.to_string(), content);
	}

	async fn fetch(&self, hash: &str) -> Result<Vec<u8>, ObjectStoreError> {
		let response = self
			.http_client
			.post(format!("{}/api/v0/cat", self.api_url))
			.query(&[("arg", hash)])
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(ObjectStoreError::Status {
				reference: hash.to_string(),
				status: response.status(),
			});
		}

		Ok(response.bytes().await?.to_vec())
	}
}

#[async_trait::async_trait]
impl ObjectStore for IpfsClient {
	async fn put(&self, bytes: Vec<u8>) -> Result<String, ObjectStoreError> {
		let form = Form::new().part("file", Part::bytes(bytes.clone()).file_name("data.json"));
		let response = self
			.http_client
			.post(format!("{}/api/v0/add", self.api_url))
			.multipart(form)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(ObjectStoreError::Status {
				reference: "add".to_string(),
				status: response.status(),
			});
		}

		let added: AddResponse = serde_json::from_slice(&response.bytes().await?)?;
		info!("Stored object in IPFS under {}", added.hash);

		self.remember(&added.hash, bytes).await;
		Ok(added.hash)
	}

	async fn get(&self, reference: &str) -> Result<Vec<u8>, ObjectStoreError> {
		let hash = normalize_reference(reference);
		if !is_valid_hash(hash) {
			warn!("Invalid IPFS hash '{}', skipping fetch", reference);
			return Err(ObjectStoreError::InvalidReference(reference.to_string()));
		}

		if let Some(content) = self.content_cache.lock().await.get(hash) {
			return Ok(content.clone());
		}

		if self
			.failed_hashes
			.lock()
			.await
			.is_blocked(hash, Instant::now())
		{
			trace!("Skipping IPFS fetch for {} (negative cache)", hash);
			return Err(ObjectStoreError::RecentlyFailed(hash.to_string()));
		}

		match self.fetch(hash).await {
			Ok(content) => {
				debug!("Fetched {} bytes for {}", content.len(), hash);
				self.remember(hash, content.clone()).await;
				Ok(content)
			}
			Err(e) => {
				error!("Failed to fetch IPFS content for {}: {}", hash, e);
				self.failed_hashes.lock().await.record(hash, Instant::now());
				Err(e)
			}
		}
	}
}
