use crate::store::entities::{CachedEntity, EntityKind};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Errors raised by the local entity and checkpoint stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("IO error on {path:?}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Corrupt store file {path:?}: {reason}")]
	Corrupt { path: PathBuf, reason: String },
}

/// A stored row: the record document plus its secondary (owner) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
	pub owner: Option<String>,
	pub record: serde_json::Value,
}

/// Per-kind persistent table with upsert/delete by id and lookup by owner
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
	async fn upsert(&self, kind: EntityKind, id: &str, row: StoredRow) -> Result<(), StoreError>;
	async fn upsert_many(
		&self,
		kind: EntityKind,
		rows: Vec<(String, StoredRow)>,
	) -> Result<(), StoreError>;
	/// Deleting an absent id is not an error.
	async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError>;
	async fn find_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<StoredRow>, StoreError>;
	async fn find_by_owner(&self, kind: EntityKind, owner: &str) -> Result<Vec<StoredRow>, StoreError>;
	/// Returns the number of rows removed.
	async fn delete_by_owner(&self, kind: EntityKind, owner: &str) -> Result<usize, StoreError>;
	/// Drop every row of `kind` and insert `rows` in its place.
	async fn replace_all(
		&self,
		kind: EntityKind,
		rows: Vec<(String, StoredRow)>,
	) -> Result<(), StoreError>;
	async fn list(&self, kind: EntityKind) -> Result<Vec<StoredRow>, StoreError>;
	async fn count(&self, kind: EntityKind) -> Result<usize, StoreError>;
}

type Tables = HashMap<EntityKind, BTreeMap<String, StoredRow>>;

/// In-memory implementation of EntityStore
#[derive(Default)]
pub struct InMemoryEntityStore {
	tables: RwLock<Tables>,
}

impl InMemoryEntityStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn from_tables(tables: Tables) -> Self {
		Self {
			tables: RwLock::new(tables),
		}
	}

	async fn table_snapshot(&self, kind: EntityKind) -> BTreeMap<String, StoredRow> {
		self.tables
			.read()
			.await
			.get(&kind)
			.cloned()
			.unwrap_or_default()
	}
}

#[async_trait::async_trait]
impl EntityStore for InMemoryEntityStore {
	async fn upsert(&self, kind: EntityKind, id: &str, row: StoredRow) -> Result<(), StoreError> {
		self.tables
			.write()
			.await
			.entry(kind)
			.or_default()
			.insert(id.to_string(), row);
		Ok(())
	}

	async fn upsert_many(
		&self,
		kind: EntityKind,
		rows: Vec<(String, StoredRow)>,
	) -> Result<(), StoreError> {
		let mut tables = self.tables.write().await;
		let table = tables.entry(kind).or_default();
		for (id, row) in rows {
			table.insert(id, row);
		}
		Ok(())
	}

	async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
		if let Some(table) = self.tables.write().await.get_mut(&kind) {
			table.remove(id);
		}
		Ok(())
	}

	async fn find_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<StoredRow>, StoreError> {
		Ok(self
			.tables
			.read()
			.await
			.get(&kind)
			.and_then(|table| table.get(id))
			.cloned())
	}

	async fn find_by_owner(&self, kind: EntityKind, owner: &str) -> Result<Vec<StoredRow>, StoreError> {
		Ok(self
			.tables
			.read()
			.await
			.get(&kind)
			.map(|table| {
				table
					.values()
					.filter(|row| row.owner.as_deref() == Some(owner))
					.cloned()
					.collect()
			})
			.unwrap_or_default())
	}

	async fn delete_by_owner(&self, kind: EntityKind, owner: &str) -> Result<usize, StoreError> {
		let mut tables = self.tables.write().await;
		let Some(table) = tables.get_mut(&kind) else {
			return Ok(0);
		};
		let before = table.len();
		table.retain(|_, row| row.owner.as_deref() != Some(owner));
		Ok(before - table.len())
	}

	async fn replace_all(
		&self,
		kind: EntityKind,
		rows: Vec<(String, StoredRow)>,
	) -> Result<(), StoreError> {
		self.tables
			.write()
			.await
			.insert(kind, rows.into_iter().collect());
		Ok(())
	}

	async fn list(&self, kind: EntityKind) -> Result<Vec<StoredRow>, StoreError> {
		Ok(self.table_snapshot(kind).await.into_values().collect())
	}

	async fn count(&self, kind: EntityKind) -> Result<usize, StoreError> {
		Ok(self
			.tables
			.read()
			.await
			.get(&kind)
			.map(|table| table.len())
			.unwrap_or(0))
	}
}

/// File-based implementation of EntityStore.
///
/// Rows are held in memory and every mutation rewrites the affected kind's table file
/// (`{kind}_cache.json`) in the data directory.
pub struct FileEntityStore {
	data_dir: PathBuf,
	inner: InMemoryEntityStore,
}

impl FileEntityStore {
	/// Open the store, loading any table files already present in `data_dir`.
	pub async fn open(data_dir: PathBuf) -> Result<Self, StoreError> {
		tokio::fs::create_dir_all(&data_dir)
			.await
			.map_err(|source| StoreError::Io {
				path: data_dir.clone(),
				source,
			})?;

		let mut tables = Tables::new();
		for kind in EntityKind::ALL {
			let path = Self::table_filename(&data_dir, kind);
			if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
				continue;
			}
			let content = tokio::fs::read_to_string(&path)
				.await
				.map_err(|source| StoreError::Io {
					path: path.clone(),
					source,
				})?;
			let table: BTreeMap<String, StoredRow> =
				serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
					path: path.clone(),
					reason: e.to_string(),
				})?;
			info!("Loaded {} {} rows from {:?}", table.len(), kind, path);
			tables.insert(kind, table);
		}

		Ok(Self {
			data_dir,
			inner: InMemoryEntityStore::from_tables(tables),
		})
	}

	fn table_filename(data_dir: &Path, kind: EntityKind) -> PathBuf {
		data_dir.join(format!("{}_cache.json", kind.as_str()))
	}

	async fn flush(&self, kind: EntityKind) -> Result<(), StoreError> {
		let table = self.inner.table_snapshot(kind).await;
		let content = serde_json::to_string_pretty(&table)?;
		let path = Self::table_filename(&self.data_dir, kind);
		write_atomically(&path, content.as_bytes()).await?;
		debug!("Flushed {} {} rows to {:?}", table.len(), kind, path);
		Ok(())
	}
}

#[async_trait::async_trait]
impl EntityStore for FileEntityStore {
	async fn upsert(&self, kind: EntityKind, id: &str, row: StoredRow) -> Result<(), StoreError> {
		self.inner.upsert(kind, id, row).await?;
		self.flush(kind).await
	}

	async fn upsert_many(
		&self,
		kind: EntityKind,
		rows: Vec<(String, StoredRow)>,
	) -> Result<(), StoreError> {
		self.inner.upsert_many(kind, rows).await?;
		self.flush(kind).await
	}

	async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
		self.inner.delete(kind, id).await?;
		self.flush(kind).await
	}

	async fn find_by_id(&self, kind: EntityKind, id: &str) -> Result<Option<StoredRow>, StoreError> {
		self.inner.find_by_id(kind, id).await
	}

	async fn find_by_owner(&self, kind: EntityKind, owner: &str) -> Result<Vec<StoredRow>, StoreError> {
		self.inner.find_by_owner(kind, owner).await
	}

	async fn delete_by_owner(&self, kind: EntityKind, owner: &str) -> Result<usize, StoreError> {
		let removed = self.inner.delete_by_owner(kind, owner).await?;
		if removed > 0 {
			self.flush(kind).await?;
		}
		Ok(removed)
	}

	async fn replace_all(
		&self,
		kind: EntityKind,
		rows: Vec<(String, StoredRow)>,
	) -> Result<(), StoreError> {
		self.inner.replace_all(kind, rows).await?;
		self.flush(kind).await
	}

	async fn list(&self, kind: EntityKind) -> Result<Vec<StoredRow>, StoreError> {
		self.inner.list(kind).await
	}

	async fn count(&self, kind: EntityKind) -> Result<usize, StoreError> {
		self.inner.count(kind).await
	}
}

/// Typed access to an EntityStore.
///
/// Serializes cached entities into stored rows and back, deriving the owner key from the entity.
#[derive(Clone)]
pub struct EntityRepository {
	store: Arc<dyn EntityStore>,
}

impl EntityRepository {
	pub fn new(store: Arc<dyn EntityStore>) -> Self {
		Self { store }
	}

	fn to_row<T: CachedEntity>(entity: &T) -> Result<(String, StoredRow), StoreError> {
		Ok((
			entity.id().to_string(),
			StoredRow {
				owner: entity.owner().map(str::to_string),
				record: serde_json::to_value(entity)?,
			},
		))
	}

	fn from_row<T: CachedEntity>(row: StoredRow) -> Result<T, StoreError> {
		Ok(serde_json::from_value(row.record)?)
	}

	pub async fn upsert<T: CachedEntity>(&self, entity: &T) -> Result<(), StoreError> {
		let (id, row) = Self::to_row(entity)?;
		self.store.upsert(T::KIND, &id, row).await
	}

	pub async fn upsert_many<T: CachedEntity>(&self, entities: &[T]) -> Result<(), StoreError> {
		let rows = entities
			.iter()
			.map(Self::to_row)
			.collect::<Result<Vec<_>, _>>()?;
		self.store.upsert_many(T::KIND, rows).await
	}

	pub async fn delete<T: CachedEntity>(&self, id: &str) -> Result<(), StoreError> {
		self.store.delete(T::KIND, id).await
	}

	pub async fn find<T: CachedEntity>(&self, id: &str) -> Result<Option<T>, StoreError> {
		self.store
			.find_by_id(T::KIND, id)
			.await?
			.map(Self::from_row)
			.transpose()
	}

	pub async fn find_by_owner<T: CachedEntity>(&self, owner: &str) -> Result<Vec<T>, StoreError> {
		self.store
			.find_by_owner(T::KIND, owner)
			.await?
			.into_iter()
			.map(Self::from_row)
			.collect()
	}

	pub async fn delete_by_owner<T: CachedEntity>(&self, owner: &str) -> Result<usize, StoreError> {
		self.store.delete_by_owner(T::KIND, owner).await
	}

	pub async fn replace_all<T: CachedEntity>(&self, entities: &[T]) -> Result<(), StoreError> {
		let rows = entities
			.iter()
			.map(Self::to_row)
			.collect::<Result<Vec<_>, _>>()?;
		self.store.replace_all(T::KIND, rows).await
	}

	pub async fn list<T: CachedEntity>(&self) -> Result<Vec<T>, StoreError> {
		self.store
			.list(T::KIND)
			.await?
			.into_iter()
			.map(Self::from_row)
			.collect()
	}

	pub async fn count<T: CachedEntity>(&self) -> Result<usize, StoreError> {
		self.store.count(T::KIND).await
	}
}

/// Id of the singleton checkpoint record.
pub const CHECKPOINT_ID: &str = "pharmalink-system-state";

/// Persisted sync checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
	pub id: String,
	#[serde(rename = "currentIdentityId")]
	pub current_identity_id: Option<String>,
	/// Highest block whose events have all been applied; `None` before the first one.
	#[serde(rename = "lastProcessedBlock")]
	pub last_processed_block: Option<u64>,
}

impl Default for SyncCheckpoint {
	fn default() -> Self {
		Self {
			id: CHECKPOINT_ID.to_string(),
			current_identity_id: None,
			last_processed_block: None,
		}
	}
}

/// Repository for the checkpoint record
#[async_trait::async_trait]
pub trait CheckpointRepository: Send + Sync {
	async fn load(&self) -> Result<Option<SyncCheckpoint>, StoreError>;
	async fn save(&self, checkpoint: &SyncCheckpoint) -> Result<(), StoreError>;
}

/// File-based implementation of CheckpointRepository
pub struct FileCheckpointRepository {
	data_dir: PathBuf,
}

impl FileCheckpointRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_checkpoint_filename(&self) -> PathBuf {
		self.data_dir.join("sync_state.json")
	}
}

#[async_trait::async_trait]
impl CheckpointRepository for FileCheckpointRepository {
	async fn load(&self) -> Result<Option<SyncCheckpoint>, StoreError> {
		let path = self.get_checkpoint_filename();
		if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
			return Ok(None);
		}

		let content = tokio::fs::read_to_string(&path)
			.await
			.map_err(|source| StoreError::Io {
				path: path.clone(),
				source,
			})?;

		let checkpoint: SyncCheckpoint =
			serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
				path: path.clone(),
				reason: e.to_string(),
			})?;

		info!(
			"Loaded checkpoint from {:?}: identity {:?}, last block {:?}",
			path, checkpoint.current_identity_id, checkpoint.last_processed_block
		);
		Ok(Some(checkpoint))
	}

	async fn save(&self, checkpoint: &SyncCheckpoint) -> Result<(), StoreError> {
		tokio::fs::create_dir_all(&self.data_dir)
			.await
			.map_err(|source| StoreError::Io {
				path: self.data_dir.clone(),
				source,
			})?;

		let mut document = serde_json::to_value(checkpoint)?;
		document["savedAt"] = serde_json::Value::String(chrono::Utc::now().to_rfc3339());
		let content = serde_json::to_string_pretty(&document)?;

		let path = self.get_checkpoint_filename();
		write_atomically(&path, content.as_bytes()).await?;
		debug!(
			"Checkpoint saved to {:?}: identity {:?}, last block {:?}",
			path, checkpoint.current_identity_id, checkpoint.last_processed_block
		);
		Ok(())
	}
}

/// In-memory implementation of CheckpointRepository
#[derive(Default)]
pub struct InMemoryCheckpointRepository {
	checkpoint: RwLock<Option<SyncCheckpoint>>,
}

impl InMemoryCheckpointRepository {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_checkpoint(checkpoint: SyncCheckpoint) -> Self {
		Self {
			checkpoint: RwLock::new(Some(checkpoint)),
		}
	}
}

#[async_trait::async_trait]
impl CheckpointRepository for InMemoryCheckpointRepository {
	async fn load(&self) -> Result<Option<SyncCheckpoint>, StoreError> {
		Ok(self.checkpoint.read().await.clone())
	}

	async fn save(&self, checkpoint: &SyncCheckpoint) -> Result<(), StoreError> {
		*self.checkpoint.write().await = Some(checkpoint.clone());
		Ok(())
	}
}

async fn write_atomically(path: &Path, content: &[u8]) -> Result<(), StoreError> {
	let tmp = path.with_extension("json.tmp");
	tokio::fs::write(&tmp, content)
		.await
		.map_err(|source| StoreError::Io {
			path: tmp.clone(),
			source,
		})?;
	tokio::fs::rename(&tmp, path)
		.await
		.map_err(|source| StoreError::Io {
			path: path.to_path_buf(),
			source,
		})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::entities::{Actor, Role, Unit};

	fn unit(id: &str, owner: &str) -> Unit {
		Unit {
			id: id.to_string(),
			medication_id: "MED-1".to_string(),
			batch_label: "CH1".to_string(),
			current_owner: owner.to_string(),
			transfer_history: Vec::new(),
			temperature_readings: Vec::new(),
			consumed: false,
			consumed_ref_id: None,
			ipfs_link: None,
			ipfs_data: None,
		}
	}

	#[tokio::test]
	async fn owner_lookup_and_delete_are_scoped_to_owner() {
		let repo = EntityRepository::new(Arc::new(InMemoryEntityStore::new()));
		repo.upsert_many(&[unit("u1", "a"), unit("u2", "a"), unit("u3", "b")])
			.await
			.unwrap();

		let owned: Vec<Unit> = repo.find_by_owner("a").await.unwrap();
		assert_eq!(owned.len(), 2);

		assert_eq!(repo.delete_by_owner::<Unit>("a").await.unwrap(), 2);
		assert_eq!(repo.count::<Unit>().await.unwrap(), 1);
		assert!(repo.find::<Unit>("u3").await.unwrap().is_some());
	}

	#[tokio::test]
	async fn deleting_missing_row_is_a_no_op() {
		let repo = EntityRepository::new(Arc::new(InMemoryEntityStore::new()));
		repo.delete::<Actor>("apotheke-404").await.unwrap();
		assert_eq!(repo.count::<Actor>().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn file_store_reloads_tables() {
		let dir = tempfile::tempdir().unwrap();
		{
			let store = FileEntityStore::open(dir.path().to_path_buf()).await.unwrap();
			let repo = EntityRepository::new(Arc::new(store));
			repo.upsert(&Actor {
				id: "apotheke-1".to_string(),
				name: "Sonnen-Apotheke".to_string(),
				role: Role::Pharmacy,
				email: None,
				ipfs_link: None,
				ipfs_data: None,
			})
			.await
			.unwrap();
			repo.upsert(&unit("u1", "apotheke-1")).await.unwrap();
		}

		let store = FileEntityStore::open(dir.path().to_path_buf()).await.unwrap();
		let repo = EntityRepository::new(Arc::new(store));
		let actor: Actor = repo.find("apotheke-1").await.unwrap().unwrap();
		assert_eq!(actor.name, "Sonnen-Apotheke");
		let units: Vec<Unit> = repo.find_by_owner("apotheke-1").await.unwrap();
		assert_eq!(units.len(), 1);
	}

	#[tokio::test]
	async fn file_checkpoint_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileCheckpointRepository::new(dir.path().to_path_buf());
		assert!(repo.load().await.unwrap().is_none());

		let checkpoint = SyncCheckpoint {
			current_identity_id: Some("apotheke-abcd1234".to_string()),
			last_processed_block: Some(42),
			..SyncCheckpoint::default()
		};
		repo.save(&checkpoint).await.unwrap();
		assert_eq!(repo.load().await.unwrap(), Some(checkpoint));
	}
}
