//! In-process fakes and fixtures for the sync core's tests.

use crate::gateway::{EventStream, GatewayError, LedgerGateway, LedgerQueries, RawLedgerEvent};
use crate::objects::{ObjectStore, ObjectStoreError};
use crate::store::{
	Actor, CheckpointRepository, EntityRepository, InMemoryCheckpointRepository, InMemoryEntityStore,
	Medication, MedicationStatus, Role, SyncCheckpoint, TransferEntry, Unit,
};
use crate::sync::SyncComponents;
use crate::sync::checkpoint::CheckpointService;
use crate::sync::enricher::Enricher;
use crate::sync::events::LedgerEvent;
use crate::sync::reconciler::Reconciler;

use futures::stream;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn actor(id: &str) -> Actor {
	Actor {
		id: id.to_string(),
		name: format!("Akteur {}", id),
		role: Role::from_actor_id(id).unwrap_or(Role::Pharmacy),
		email: None,
		ipfs_link: None,
		ipfs_data: None,
	}
}

pub fn medication(id: &str) -> Medication {
	Medication {
		id: id.to_string(),
		manufacturer_id: "hersteller-1".to_string(),
		name: format!("Medikament {}", id),
		document_hash: None,
		ipfs_link: None,
		status: MedicationStatus::Created,
		approved_by: None,
		tags: BTreeMap::new(),
		ipfs_data: None,
	}
}

pub fn unit(id: &str, owner: &str) -> Unit {
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

pub fn raw_event(name: &str, payload: &str, block: u64) -> RawLedgerEvent {
	RawLedgerEvent {
		name: name.to_string(),
		payload: payload.as_bytes().to_vec(),
		block_number: block,
		tx_id: format!("tx-{}-{}", block, name),
	}
}

pub fn decoded(name: &str, payload: Value, block: u64) -> LedgerEvent {
	LedgerEvent::decode(raw_event(name, &payload.to_string(), block))
}

/// Poll `condition` until it holds, sleeping between checks. Panics after a long wait.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
	for _ in 0..10_000 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not reached in time");
}

pub async fn wait_until_async<F, Fut>(mut condition: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..10_000 {
		if condition().await {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not reached in time");
}

/// How the fake ledger answers one subscription.
pub enum ConnectionScript {
	Refuse(GatewayError),
	/// Deliver this many backlog events, then fail the stream.
	DropAfter(usize, GatewayError),
}

#[derive(Default)]
struct World {
	actors: BTreeMap<String, Actor>,
	medications: BTreeMap<String, Medication>,
	units: BTreeMap<String, Unit>,
	unit_counters: HashMap<String, u32>,
	identity: Option<Actor>,
}

/// Ledger gateway over an in-memory world state and event log.
///
/// Each subscription delivers every logged event at or after its start block, then keeps
/// following the log, unless a `ConnectionScript` says otherwise.
#[derive(Default)]
pub struct FakeLedger {
	world: Mutex<World>,
	chain: Arc<Mutex<Vec<RawLedgerEvent>>>,
	scripts: Mutex<VecDeque<ConnectionScript>>,
	failing: Mutex<HashSet<String>>,
	subscriptions: Mutex<Vec<u64>>,
	calls: Mutex<Vec<String>>,
}

impl FakeLedger {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn put_actor(&self, actor: Actor) {
		self.world.lock().unwrap().actors.insert(actor.id.clone(), actor);
	}

	pub fn remove_actor(&self, actor_id: &str) {
		self.world.lock().unwrap().actors.remove(actor_id);
	}

	pub fn put_medication(&self, medication: Medication) {
		self.world
			.lock()
			.unwrap()
			.medications
			.insert(medication.id.clone(), medication);
	}

	pub fn put_unit(&self, unit: Unit) {
		self.world.lock().unwrap().units.insert(unit.id.clone(), unit);
	}

	pub fn set_identity(&self, actor: Actor) {
		self.world.lock().unwrap().identity = Some(actor);
	}

	/// Create `count` units the way the chaincode does and return the last one.
	pub fn create_units(&self, med_id: &str, batch: &str, count: u32, owner: &str) -> Unit {
		let mut world = self.world.lock().unwrap();
		let counter = world
			.unit_counters
			.entry(format!("{}|{}", med_id, batch))
			.or_default();
		let first = *counter + 1;
		*counter += count;
		let last = *counter;

		let mut created = None;
		for seq in first..=last {
			let next = Unit {
				id: format!("{}-{}-{:04}", med_id, batch, seq),
				medication_id: med_id.to_string(),
				batch_label: batch.to_string(),
				..unit("", owner)
			};
			world.units.insert(next.id.clone(), next.clone());
			created = Some(next);
		}
		created.expect("count must be at least 1")
	}

	/// Move a unit to `to` and return its post-transfer document.
	pub fn transfer_unit(&self, unit_id: &str, to: &str) -> Option<Unit> {
		let mut world = self.world.lock().unwrap();
		let unit = world.units.get_mut(unit_id)?;
		unit.transfer_history.push(TransferEntry {
			from: Some(unit.current_owner.clone()),
			to: Some(to.to_string()),
			timestamp: "2025-07-12T11:00:00Z".to_string(),
		});
		unit.current_owner = to.to_string();
		Some(unit.clone())
	}

	pub fn publish_raw(&self, event: RawLedgerEvent) {
		self.chain.lock().unwrap().push(event);
	}

	pub fn publish(&self, name: &str, payload: Value, block: u64) {
		self.publish_raw(raw_event(name, &payload.to_string(), block));
	}

	pub fn script(&self, script: ConnectionScript) {
		self.scripts.lock().unwrap().push_back(script);
	}

	/// Make every evaluate of `name` fail with a transport error.
	pub fn fail_query(&self, name: &str) {
		self.failing.lock().unwrap().insert(name.to_string());
	}

	pub fn recover_query(&self, name: &str) {
		self.failing.lock().unwrap().remove(name);
	}

	/// Start blocks of all subscriptions so far.
	pub fn subscriptions(&self) -> Vec<u64> {
		self.subscriptions.lock().unwrap().clone()
	}

	/// Names of all evaluate calls so far.
	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().unwrap().clone()
	}

	fn not_found(name: &str, key: &str) -> GatewayError {
		GatewayError::Rejected {
			name: name.to_string(),
			message: format!("{} does not exist", key),
		}
	}
}

#[async_trait::async_trait]
impl LedgerGateway for FakeLedger {
	async fn submit(&self, name: &str, _args: &[&str]) -> Result<Vec<u8>, GatewayError> {
		match name {
			"initCall" => {
				let world = self.world.lock().unwrap();
				let identity = world
					.identity
					.as_ref()
					.ok_or_else(|| Self::not_found(name, "identity"))?;
				Ok(serde_json::to_vec(identity)?)
			}
			other => Err(GatewayError::ProtocolError(format!("unexpected submit {}", other))),
		}
	}

	async fn evaluate(&self, name: &str, args: &[&str]) -> Result<Vec<u8>, GatewayError> {
		self.calls.lock().unwrap().push(name.to_string());
		if self.failing.lock().unwrap().contains(name) {
			return Err(GatewayError::Unavailable(format!("{} timed out", name)));
		}

		let key = args.first().copied().unwrap_or_default();
		let world = self.world.lock().unwrap();
		let value = match name {
			"queryActorById" => world
				.actors
				.get(key)
				.map(serde_json::to_value)
				.ok_or_else(|| Self::not_found(name, key))??,
			"queryAllActors" => serde_json::to_value(world.actors.values().collect::<Vec<_>>())?,
			"queryMedikamentById" => world
				.medications
				.get(key)
				.map(serde_json::to_value)
				.ok_or_else(|| Self::not_found(name, key))??,
			"queryAllMedikamente" => {
				serde_json::to_value(world.medications.values().collect::<Vec<_>>())?
			}
			"queryUnitById" => world
				.units
				.get(key)
				.map(serde_json::to_value)
				.ok_or_else(|| Self::not_found(name, key))??,
			"queryUnitsByOwner" => serde_json::to_value(
				world
					.units
					.values()
					.filter(|u| u.current_owner == key)
					.collect::<Vec<_>>(),
			)?,
			other => return Err(GatewayError::ProtocolError(format!("unknown query {}", other))),
		};
		Ok(serde_json::to_vec(&value)?)
	}

	async fn events(&self, from_block: u64) -> Result<EventStream, GatewayError> {
		self.subscriptions.lock().unwrap().push(from_block);
		let mut backlog: Vec<Result<RawLedgerEvent, GatewayError>> = self
			.chain
			.lock()
			.unwrap()
			.iter()
			.filter(|e| e.block_number >= from_block)
			.cloned()
			.map(Ok)
			.collect();

		match self.scripts.lock().unwrap().pop_front() {
			Some(ConnectionScript::Refuse(e)) => Err(e),
			Some(ConnectionScript::DropAfter(n, e)) => {
				backlog.truncate(n);
				backlog.push(Err(e));
				Ok(Box::pin(stream::iter(backlog)))
			}
			None => {
				// live feed: follows the event log, including events published later
				let chain = self.chain.clone();
				let live = stream::unfold(0usize, move |delivered| {
					let chain = chain.clone();
					async move {
						loop {
							let next = chain
								.lock()
								.unwrap()
								.iter()
								.filter(|e| e.block_number >= from_block)
								.nth(delivered)
								.cloned();
							if let Some(event) = next {
								return Some((Ok::<_, GatewayError>(event), delivered + 1));
							}
							tokio::time::sleep(Duration::from_millis(10)).await;
						}
					}
				});
				Ok(Box::pin(live))
			}
		}
	}
}

/// Object store over a map, counting reads.
#[derive(Default)]
pub struct FakeObjectStore {
	objects: Mutex<HashMap<String, Vec<u8>>>,
	fail_all: Mutex<bool>,
	get_calls: Mutex<usize>,
}

impl FakeObjectStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, hash: &str, bytes: &[u8]) {
		self.objects
			.lock()
			.unwrap()
			.insert(hash.to_string(), bytes.to_vec());
	}

	pub fn fail_all(&self) {
		*self.fail_all.lock().unwrap() = true;
	}

	pub fn get_calls(&self) -> usize {
		*self.get_calls.lock().unwrap()
	}
}

#[async_trait::async_trait]
impl ObjectStore for FakeObjectStore {
	async fn put(&self, bytes: Vec<u8>) -> Result<String, ObjectStoreError> {
		let hash = format!("Qm{:0>44}", self.objects.lock().unwrap().len());
		self.insert(&hash, &bytes);
		Ok(hash)
	}

	async fn get(&self, hash: &str) -> Result<Vec<u8>, ObjectStoreError> {
		*self.get_calls.lock().unwrap() += 1;
		let hash = crate::objects::normalize_reference(hash);
		if *self.fail_all.lock().unwrap() {
			return Err(ObjectStoreError::RecentlyFailed(hash.to_string()));
		}
		self.objects
			.lock()
			.unwrap()
			.get(hash)
			.cloned()
			.ok_or_else(|| ObjectStoreError::NotFound(hash.to_string()))
	}
}

/// A fake ledger, fake object store and in-memory stores wired together.
pub struct Harness {
	pub ledger: Arc<FakeLedger>,
	pub objects: Arc<FakeObjectStore>,
	pub store: Arc<InMemoryEntityStore>,
	pub entities: EntityRepository,
	pub checkpoints: Arc<InMemoryCheckpointRepository>,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_checkpoints(InMemoryCheckpointRepository::new())
	}

	pub fn with_checkpoint(checkpoint: SyncCheckpoint) -> Self {
		Self::with_checkpoints(InMemoryCheckpointRepository::with_checkpoint(checkpoint))
	}

	fn with_checkpoints(checkpoints: InMemoryCheckpointRepository) -> Self {
		let store = Arc::new(InMemoryEntityStore::new());
		Self {
			ledger: Arc::new(FakeLedger::new()),
			objects: Arc::new(FakeObjectStore::new()),
			entities: EntityRepository::new(store.clone()),
			store,
			checkpoints: Arc::new(checkpoints),
		}
	}

	pub fn components(&self) -> SyncComponents {
		SyncComponents {
			gateway: self.ledger.clone(),
			objects: self.objects.clone(),
			entities: self.store.clone(),
			checkpoints: self.checkpoints.clone(),
		}
	}

	pub async fn reconciler(&self, max_event_attempts: u32) -> Reconciler {
		let checkpoints = CheckpointService::new(self.checkpoints.clone());
		let context = checkpoints.restore().await.unwrap();
		Reconciler::new(
			LedgerQueries::new(self.ledger.clone()),
			Enricher::new(self.objects.clone(), 4),
			self.entities.clone(),
			checkpoints,
			context,
			max_event_attempts,
		)
	}

	pub async fn saved_checkpoint(&self) -> SyncCheckpoint {
		self.checkpoints.load().await.unwrap().unwrap_or_default()
	}
}
