//! Off-chain enrichment.
//!
//! Entities may reference a JSON document in the object store. The enricher resolves it and
//! attaches the parsed value to the entity. Failures are logged and leave the entity as it was;
//! enrichment never fails a sync step.

use crate::objects::{ObjectStore, normalize_reference};
use crate::store::{Actor, Medication, Unit};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// An entity that may carry an off-chain document reference.
pub trait Enrichable: Send {
	fn entity_id(&self) -> &str;

	fn ipfs_link(&self) -> Option<&str>;

	fn attach(&mut self, document: Value);
}

macro_rules! impl_enrichable {
	($($entity:ty),*) => {
		$(
			impl Enrichable for $entity {
				fn entity_id(&self) -> &str {
					&self.id
				}

				fn ipfs_link(&self) -> Option<&str> {
					self.ipfs_link.as_deref()
				}

				fn attach(&mut self, document: Value) {
					self.ipfs_data = Some(document);
				}
			}
		)*
	};
}

impl_enrichable!(Actor, Medication, Unit);

/// Resolves off-chain references through an ObjectStore
#[derive(Clone)]
pub struct Enricher {
	objects: Arc<dyn ObjectStore>,
	concurrency: usize,
}

impl Enricher {
	pub fn new(objects: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
		Self {
			objects,
			concurrency: concurrency.max(1),
		}
	}

	/// Attach the referenced document to `entity`, if it has a resolvable reference.
	pub async fn enrich<T: Enrichable>(&self, mut entity: T) -> T {
		let Some(reference) = entity
			.ipfs_link()
			.map(normalize_reference)
			.filter(|r| !r.is_empty())
			.map(str::to_string)
		else {
			return entity;
		};

		match self.fetch_document(&reference).await {
			Some(document) => {
				debug!("Attached off-chain document {} to {}", reference, entity.entity_id());
				entity.attach(document);
			}
			None => warn!(
				"Off-chain document {} for {} unavailable, keeping entity without it",
				reference,
				entity.entity_id()
			),
		}
		entity
	}

	/// Enrich every entity, with up to `concurrency` fetches in flight. Order is preserved.
	pub async fn enrich_all<T: Enrichable>(&self, entities: Vec<T>) -> Vec<T> {
		stream::iter(entities)
			.map(|entity| self.enrich(entity))
			.buffered(self.concurrency)
			.collect()
			.await
	}

	async fn fetch_document(&self, reference: &str) -> Option<Value> {
		let bytes = match self.objects.get(reference).await {
			Ok(bytes) => bytes,
			Err(e) => {
				debug!("Object store lookup for {} failed: {}", reference, e);
				return None;
			}
		};
		match decode_document(&bytes) {
			Ok(document) => Some(document),
			Err(e) => {
				warn!("Off-chain document {} is not valid JSON: {}", reference, e);
				None
			}
		}
	}
}

/// Parse a stored document. Some writers store JSON serialized twice (a JSON string holding an
/// object); that is unwrapped.
pub fn decode_document(bytes: &[u8]) -> Result<Value, serde_json::Error> {
	let value: Value = serde_json::from_slice(bytes)?;
	if let Value::String(inner) = &value {
		let trimmed = inner.trim();
		if trimmed.starts_with('{') && trimmed.ends_with('}') {
			return serde_json::from_str(trimmed);
		}
	}
	Ok(value)
}
