//! Unit batch reconstruction.
//!
//! The ledger emits a single `UnitCreated` event for a whole batch, carrying only the last unit.
//! Unit ids are `{prefix}-{NNNN}` with a sequence that counts up per medication and batch, so the
//! earlier siblings of a batch can be derived from the last one.

use crate::store::Unit;

/// Largest batch that will be materialized from a single event.
pub const MAX_RECONSTRUCTED_BATCH: u32 = 100_000;

/// A unit id split into its batch prefix and sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitIdParts<'a> {
	/// Everything before the last `-`.
	pub prefix: &'a str,
	pub sequence: u32,
}

impl UnitIdParts<'_> {
	/// Id of the `sequence`-th unit of this batch, zero-padded to at least four digits.
	pub fn unit_id(&self, sequence: u32) -> String {
		format!("{}-{:04}", self.prefix, sequence)
	}
}

/// Split `id` at its last `-`. Fails unless the suffix is a decimal sequence >= 1 and the prefix
/// is non-empty.
pub fn parse_unit_id(id: &str) -> Option<UnitIdParts<'_>> {
	let (prefix, suffix) = id.rsplit_once('-')?;
	if prefix.is_empty() || suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	let sequence: u32 = suffix.parse().ok()?;
	if sequence == 0 {
		return None;
	}
	Some(UnitIdParts { prefix, sequence })
}

/// Materialize units `1..=N` of the batch whose last unit is `last`.
///
/// Every unit is a copy of `last` apart from its id; the last one keeps its original id string.
/// Returns `None` if the id carries no batch structure.
pub fn reconstruct_batch(last: &Unit) -> Option<Vec<Unit>> {
	let parts = parse_unit_id(&last.id)?;
	if parts.sequence > MAX_RECONSTRUCTED_BATCH {
		return None;
	}

	let mut units: Vec<Unit> = (1..parts.sequence)
		.map(|sequence| last.with_id(parts.unit_id(sequence)))
		.collect();
	units.push(last.clone());
	Some(units)
}
