//! Persisted snapshot record.

use crate::Order;
use serde::{Deserialize, Serialize};

/// Schema version of the snapshot layout written by this build.
///
/// Bump whenever [`Snapshot`] or [`Order`] change incompatibly; a stored
/// record with another version is discarded rather than migrated.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// The single versioned record kept in the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
	pub schema_version: u32,
	pub orders: Vec<Order>,
	/// Unix seconds.
	pub saved_at: u64,
}

impl Snapshot {
	/// Builds a current-version snapshot of the given orders.
	pub fn new(orders: Vec<Order>, saved_at: u64) -> Self {
		Self {
			schema_version: SNAPSHOT_SCHEMA_VERSION,
			orders,
			saved_at,
		}
	}

	pub fn is_current(&self) -> bool {
		self.schema_version == SNAPSHOT_SCHEMA_VERSION
	}
}
