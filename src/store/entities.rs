//! Cached entity types mirrored from the ledger.
//!
//! Field names on the wire follow the ledger's JSON documents (`actorId`, `medId`, `unitId`, ...),
//! so the same types decode evaluate results, event payloads and the local store's own files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The kinds of rows held by the entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
	Actor,
	Medication,
	Unit,
}

impl EntityKind {
	pub const ALL: [EntityKind; 3] = [EntityKind::Actor, EntityKind::Medication, EntityKind::Unit];

	pub fn as_str(&self) -> &'static str {
		match self {
			EntityKind::Actor => "actor",
			EntityKind::Medication => "medication",
			EntityKind::Unit => "unit",
		}
	}
}

impl fmt::Display for EntityKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A row type that can live in the entity store.
pub trait CachedEntity: Serialize + serde::de::DeserializeOwned + Clone + Send + Sync {
	const KIND: EntityKind;

	fn id(&self) -> &str;

	/// Secondary key used by owner-scoped lookups, if the kind has one.
	fn owner(&self) -> Option<&str> {
		None
	}
}

/// Participant role. The ledger spells roles in German; English names are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
	#[serde(rename = "hersteller", alias = "manufacturer")]
	Manufacturer,
	#[serde(rename = "grosshaendler", alias = "distributor")]
	Distributor,
	#[serde(rename = "apotheke", alias = "pharmacy")]
	Pharmacy,
	#[serde(rename = "behoerde", alias = "regulator")]
	Regulator,
}

impl Role {
	/// Derive the role from an actor id (`{role}-{hash}`).
	pub fn from_actor_id(actor_id: &str) -> Option<Role> {
		let (prefix, rest) = actor_id.split_once('-')?;
		if rest.is_empty() {
			return None;
		}
		match prefix.to_ascii_lowercase().as_str() {
			"hersteller" | "manufacturer" => Some(Role::Manufacturer),
			"grosshaendler" | "distributor" => Some(Role::Distributor),
			"apotheke" | "pharmacy" => Some(Role::Pharmacy),
			"behoerde" | "regulator" => Some(Role::Regulator),
			_ => None,
		}
	}
}

/// Actor (participant) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
	#[serde(rename = "actorId")]
	pub id: String,
	#[serde(rename = "bezeichnung", default)]
	pub name: String,
	pub role: Role,
	#[serde(default)]
	pub email: Option<String>,
	#[serde(rename = "ipfsLink", default)]
	pub ipfs_link: Option<String>,
	/// Resolved off-chain document, attached by the enricher.
	#[serde(rename = "ipfsData", default, skip_serializing_if = "Option::is_none")]
	pub ipfs_data: Option<serde_json::Value>,
}

impl CachedEntity for Actor {
	const KIND: EntityKind = EntityKind::Actor;

	fn id(&self) -> &str {
		&self.id
	}
}

/// Medication lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MedicationStatus {
	#[serde(rename = "angelegt", alias = "created")]
	Created,
	#[serde(rename = "freigegeben", alias = "approved")]
	Approved,
	#[serde(rename = "abgelehnt", alias = "rejected")]
	Rejected,
}

impl MedicationStatus {
	/// Whether the ledger may move a medication from `self` to `next`.
	pub fn can_transition_to(&self, next: MedicationStatus) -> bool {
		match (self, next) {
			(a, b) if *a == b => true,
			(MedicationStatus::Created, _) => true,
			_ => false,
		}
	}
}

/// Medication record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
	#[serde(rename = "medId")]
	pub id: String,
	#[serde(rename = "herstellerId")]
	pub manufacturer_id: String,
	#[serde(rename = "bezeichnung", default)]
	pub name: String,
	#[serde(rename = "infoblattHash", default)]
	pub document_hash: Option<String>,
	#[serde(rename = "ipfsLink", default)]
	pub ipfs_link: Option<String>,
	pub status: MedicationStatus,
	#[serde(rename = "approvedById", default)]
	pub approved_by: Option<String>,
	/// One tag per writer role.
	#[serde(default)]
	pub tags: BTreeMap<String, String>,
	#[serde(rename = "ipfsData", default, skip_serializing_if = "Option::is_none")]
	pub ipfs_data: Option<serde_json::Value>,
}

impl CachedEntity for Medication {
	const KIND: EntityKind = EntityKind::Medication;

	fn id(&self) -> &str {
		&self.id
	}
}

/// One custody transfer of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
	#[serde(rename = "fromActorId", default)]
	pub from: Option<String>,
	#[serde(rename = "toActorId", default)]
	pub to: Option<String>,
	#[serde(default)]
	pub timestamp: String,
}

/// A temperature measurement recorded for a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemperatureReading {
	#[serde(default)]
	pub timestamp: String,
	#[serde(rename = "temperature", default)]
	pub value: String,
}

/// A single physical unit of a medication batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
	#[serde(rename = "unitId")]
	pub id: String,
	#[serde(rename = "medId")]
	pub medication_id: String,
	#[serde(rename = "chargeBezeichnung", default)]
	pub batch_label: String,
	#[serde(rename = "currentOwnerActorId")]
	pub current_owner: String,
	#[serde(rename = "transferHistory", default)]
	pub transfer_history: Vec<TransferEntry>,
	#[serde(rename = "temperatureReadings", default)]
	pub temperature_readings: Vec<TemperatureReading>,
	#[serde(rename = "isConsumed", alias = "consumed", default)]
	pub consumed: bool,
	#[serde(rename = "consumedRefId", default)]
	pub consumed_ref_id: Option<String>,
	#[serde(rename = "ipfsLink", default)]
	pub ipfs_link: Option<String>,
	#[serde(rename = "ipfsData", default, skip_serializing_if = "Option::is_none")]
	pub ipfs_data: Option<serde_json::Value>,
}

impl Unit {
	/// Copy of this unit under another id. Everything else, history included, is kept.
	pub fn with_id(&self, id: String) -> Unit {
		Unit { id, ..self.clone() }
	}

	/// The most recent custody transfer, if any.
	pub fn last_transfer(&self) -> Option<&TransferEntry> {
		self.transfer_history.last()
	}
}

impl CachedEntity for Unit {
	const KIND: EntityKind = EntityKind::Unit;

	fn id(&self) -> &str {
		&self.id
	}

	fn owner(&self) -> Option<&str> {
		Some(&self.current_owner)
	}
}
