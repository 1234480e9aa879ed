//! Durable fallback cache of the order store.
//!
//! One versioned [`Snapshot`] per client is kept under the `snapshot`
//! namespace. A record written by another schema version, or one that no
//! longer decodes, is deleted on load: the cache is reset and the engine
//! falls back to a full pull instead of failing.

use crate::{StorageError, StorageService};
use dispatch_types::{truncate_id, Snapshot, StorageKey, SNAPSHOT_SCHEMA_VERSION};
use std::sync::Arc;

/// Result of reading the cache at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLoad {
	/// A current-version snapshot was found.
	Restored(Snapshot),
	/// Nothing was cached.
	Empty,
	/// The record was unusable and has been discarded.
	Reset { reason: String },
}

impl CacheLoad {
	pub fn into_snapshot(self) -> Option<Snapshot> {
		match self {
			CacheLoad::Restored(snapshot) => Some(snapshot),
			CacheLoad::Empty | CacheLoad::Reset { .. } => None,
		}
	}
}

/// Versioned snapshot store for one client.
#[derive(Clone)]
pub struct PersistenceFallback {
	storage: Arc<StorageService>,
	client_id: String,
}

impl PersistenceFallback {
	pub fn new(storage: Arc<StorageService>, client_id: impl Into<String>) -> Self {
		Self {
			storage,
			client_id: client_id.into(),
		}
	}

	/// Replaces the cached snapshot.
	pub async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
		self.storage
			.store(StorageKey::Snapshot, &self.client_id, snapshot)
			.await?;
		tracing::trace!(
			client_id = %truncate_id(&self.client_id),
			orders = snapshot.orders.len(),
			"Saved snapshot"
		);
		Ok(())
	}

	/// Returns the cached snapshot, or `None` when absent or discarded.
	pub async fn load(&self) -> Option<Snapshot> {
		self.restore().await.into_snapshot()
	}

	/// Reads the cached snapshot and resets the cache when it is unusable.
	pub async fn restore(&self) -> CacheLoad {
		let raw = match self
			.storage
			.retrieve::<serde_json::Value>(StorageKey::Snapshot, &self.client_id)
			.await
		{
			Ok(raw) => raw,
			Err(StorageError::NotFound) => return CacheLoad::Empty,
			Err(e) => return self.reset(format!("unreadable cache record: {}", e)).await,
		};

		let version = raw.get("schema_version").and_then(|v| v.as_u64());
		if version != Some(u64::from(SNAPSHOT_SCHEMA_VERSION)) {
			let found = version.map_or_else(|| "none".to_string(), |v| v.to_string());
			return self
				.reset(format!(
					"schema version {} does not match {}",
					found, SNAPSHOT_SCHEMA_VERSION
				))
				.await;
		}

		match serde_json::from_value::<Snapshot>(raw) {
			Ok(snapshot) => CacheLoad::Restored(snapshot),
			Err(e) => self.reset(format!("undecodable snapshot: {}", e)).await,
		}
	}

	async fn reset(&self, reason: String) -> CacheLoad {
		tracing::warn!(client_id = %truncate_id(&self.client_id), %reason, "Resetting local cache");
		if let Err(e) = self
			.storage
			.remove(StorageKey::Snapshot, &self.client_id)
			.await
		{
			tracing::warn!(error = %e, "Failed to delete cache record");
		}
		CacheLoad::Reset { reason }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::memory::MemoryStorage;
	use dispatch_types::{Customer, Order, OrderStatus};
	use rust_decimal::Decimal;

	fn order(id: &str) -> Order {
		Order {
			id: id.to_string(),
			code: format!("ORD-{}", id),
			status: OrderStatus::Prep,
			assigned_partner: None,
			customer: Customer::default(),
			items: vec![],
			total_amount: Decimal::new(1999, 2),
			created_at: 100,
			assigned_at: None,
			picked_at: None,
			on_route_at: None,
			delivered_at: None,
			cancelled_at: None,
		}
	}

	fn fallback() -> (Arc<StorageService>, PersistenceFallback) {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let fallback = PersistenceFallback::new(storage.clone(), "client-1");
		(storage, fallback)
	}

	#[tokio::test]
	async fn test_save_and_reload() {
		let (_, fallback) = fallback();
		assert_eq!(fallback.restore().await, CacheLoad::Empty);

		let snapshot = Snapshot::new(vec![order("o1"), order("o2")], 5_000);
		fallback.save(&snapshot).await.unwrap();

		assert_eq!(fallback.load().await, Some(snapshot));
	}

	#[tokio::test]
	async fn test_schema_mismatch_resets_cache() {
		let (storage, fallback) = fallback();
		let mut snapshot = Snapshot::new(vec![order("o1")], 5_000);
		snapshot.schema_version = SNAPSHOT_SCHEMA_VERSION + 1;
		fallback.save(&snapshot).await.unwrap();

		let outcome = fallback.restore().await;
		assert!(matches!(outcome, CacheLoad::Reset { ref reason } if reason.contains("schema version")));
		assert!(!storage
			.exists(StorageKey::Snapshot, "client-1")
			.await
			.unwrap());
		assert_eq!(fallback.restore().await, CacheLoad::Empty);
	}

	#[tokio::test]
	async fn test_undecodable_record_resets_cache() {
		let (storage, fallback) = fallback();
		let broken = serde_json::json!({
			"schema_version": SNAPSHOT_SCHEMA_VERSION,
			"orders": "not a list",
		});
		storage
			.store(StorageKey::Snapshot, "client-1", &broken)
			.await
			.unwrap();

		assert_eq!(fallback.load().await, None);
		assert!(!storage
			.exists(StorageKey::Snapshot, "client-1")
			.await
			.unwrap());
	}
}
