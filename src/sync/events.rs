//! Ledger events as seen by the sync core.
//!
//! Raw chaincode events are decoded exactly once, at the stream boundary, into the closed
//! `EventKind` enum. The reconciler then matches on it exhaustively, so a new ledger event
//! cannot be silently dropped by a forgotten string comparison.
//!
//! This module also defines the `EventHandler` trait the subscriber drives.

use crate::gateway::RawLedgerEvent;
use crate::store::Unit;

use serde_json::Value;

/// Why a payload could not be turned into an actionable event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadIssue {
    /// The event carried no payload bytes.
    Empty,
    /// The payload was not valid JSON.
    InvalidJson(String),
    /// A field the handler needs was absent or not a string.
    MissingField(&'static str),
}

impl std::fmt::Display for PayloadIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadIssue::Empty => f.write_str("empty payload"),
            PayloadIssue::InvalidJson(e) => write!(f, "invalid JSON: {}", e),
            PayloadIssue::MissingField(field) => write!(f, "missing field '{}'", field),
        }
    }
}

/// What a ledger event means for the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// ActorInitialized, ActorCreated, ActorUpdated, ActorIpfsLinkUpdated
    ActorChanged { actor_id: String },
    /// ActorDeleted
    ActorDeleted { actor_id: String },
    /// MedikamentCreated, MedikamentStatusUpdated, MedikamentUpdated, MedikamentTagAdded
    MedicationChanged { med_id: String },
    /// MedikamentDeleted
    MedicationDeleted { med_id: String },
    /// UnitCreated. Only the last unit of a batch is delivered; `template` is its full
    /// document when the payload decodes as one.
    UnitsCreated {
        unit_id: String,
        template: Option<Box<Unit>>,
    },
    /// UnitTemperatureAdded
    UnitTemperatureAdded { unit_id: String },
    /// UnitTransferred. The payload is the post-transfer unit; the previous owner is taken
    /// from the last transfer history entry.
    UnitTransferred {
        unit_id: Option<String>,
        previous_owner: Option<String>,
        new_owner: Option<String>,
    },
    /// UnitDeleted
    UnitDeleted { unit_id: String },
    /// A known event whose payload cannot be acted on.
    Malformed { issue: PayloadIssue },
    /// An event name this version does not know.
    Unknown,
}

/// A decoded ledger event with its position in the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub name: String,
    pub block_number: u64,
    pub tx_id: String,
    pub kind: EventKind,
    /// Payload as text, kept for log lines.
    pub payload: String,
}

impl LedgerEvent {
    /// Decode a raw chaincode event. Never fails: undecodable payloads become
    /// `EventKind::Malformed` and unknown names `EventKind::Unknown`.
    pub fn decode(raw: RawLedgerEvent) -> Self {
        let payload = String::from_utf8_lossy(&raw.payload).into_owned();
        let kind = decode_kind(&raw.name, &raw.payload)
            .unwrap_or_else(|issue| EventKind::Malformed { issue });

        Self {
            name: raw.name,
            block_number: raw.block_number,
            tx_id: raw.tx_id,
            kind,
            payload,
        }
    }
}

fn decode_kind(name: &str, payload: &[u8]) -> Result<EventKind, PayloadIssue> {
    // Unknown names are recognised before the payload is looked at.
    if !matches!(
        name,
        "ActorInitialized"
            | "ActorCreated"
            | "ActorUpdated"
            | "ActorIpfsLinkUpdated"
            | "ActorDeleted"
            | "MedikamentCreated"
            | "MedikamentStatusUpdated"
            | "MedikamentUpdated"
            | "MedikamentTagAdded"
            | "MedikamentDeleted"
            | "UnitCreated"
            | "UnitTemperatureAdded"
            | "UnitTransferred"
            | "UnitDeleted"
    ) {
        return Ok(EventKind::Unknown);
    }

    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(PayloadIssue::Empty);
    }
    let json: Value =
        serde_json::from_slice(payload).map_err(|e| PayloadIssue::InvalidJson(e.to_string()))?;

    let kind = match name {
        "ActorInitialized" | "ActorCreated" | "ActorUpdated" | "ActorIpfsLinkUpdated" => {
            EventKind::ActorChanged {
                actor_id: required(&json, "actorId")?,
            }
        }
        "ActorDeleted" => EventKind::ActorDeleted {
            actor_id: required(&json, "actorId")?,
        },
        "MedikamentCreated"
        | "MedikamentStatusUpdated"
        | "MedikamentUpdated"
        | "MedikamentTagAdded" => EventKind::MedicationChanged {
            med_id: required(&json, "medId")?,
        },
        "MedikamentDeleted" => EventKind::MedicationDeleted {
            med_id: required(&json, "medId")?,
        },
        "UnitCreated" => EventKind::UnitsCreated {
            unit_id: required(&json, "unitId")?,
            template: serde_json::from_value::<Unit>(json).ok().map(Box::new),
        },
        "UnitTemperatureAdded" => EventKind::UnitTemperatureAdded {
            unit_id: required(&json, "unitId")?,
        },
        "UnitTransferred" => {
            let previous_owner = json
                .get("transferHistory")
                .and_then(Value::as_array)
                .and_then(|history| history.last())
                .and_then(|last| optional(last, "fromActorId"));
            let transferred = EventKind::UnitTransferred {
                unit_id: optional(&json, "unitId"),
                previous_owner,
                new_owner: optional(&json, "currentOwnerActorId"),
            };
            if let EventKind::UnitTransferred {
                unit_id: None,
                previous_owner: None,
                ..
            }
            | EventKind::UnitTransferred {
                unit_id: None,
                new_owner: None,
                ..
            } = transferred
            {
                return Err(PayloadIssue::MissingField("unitId"));
            }
            transferred
        }
        "UnitDeleted" => EventKind::UnitDeleted {
            unit_id: required(&json, "unitId")?,
        },
        _ => EventKind::Unknown,
    };

    Ok(kind)
}

/// Non-empty string field.
fn optional(json: &Value, field: &str) -> Option<String> {
    json.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required(json: &Value, field: &'static str) -> Result<String, PayloadIssue> {
    optional(json, field).ok_or(PayloadIssue::MissingField(field))
}

/// How the handler disposed of one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The cache reflects the event and the checkpoint moved past it.
    Applied,
    /// Nothing to apply; the event is consumed and the checkpoint moved past it.
    Skipped,
    /// Applying failed. The checkpoint did not move; the feed must be reopened from it.
    Retry,
}

/// Trait for consumers of the ledger event feed.
///
/// The subscriber asks the handler where to resume on every (re)connection and hands it
/// every event strictly in delivery order.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// The block to (re)open the feed at: checkpoint + 1, or 0 without a checkpoint.
    async fn resume_from_block(&self) -> u64;

    /// Apply one event.
    async fn handle(&self, event: LedgerEvent) -> Delivery;
}
