//! Order queries, transitions and submissions.
//!
//! Reads are answered from the latest published store view and never wait
//! on the engine. Writes go through the engine and return the order as the
//! backend confirmed it.

use dispatch_core::{EngineHandle, SyncError};
use dispatch_types::{truncate_id, NewOrder, Order, TransitionRequest};
use tracing::{info, warn};

/// Named partitions of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderListing {
	/// PREP orders without a partner.
	Available,
	/// Orders a partner is working on.
	Active,
	/// Delivered and cancelled orders.
	History,
}

pub fn list_orders(handle: &EngineHandle, listing: OrderListing) -> Vec<Order> {
	let view = handle.view();
	match listing {
		OrderListing::Available => view.available(),
		OrderListing::Active => view.active(),
		OrderListing::History => view.history(),
	}
}

pub fn get_order(handle: &EngineHandle, order_id: &str) -> Result<Order, SyncError> {
	handle
		.view()
		.get(order_id)
		.cloned()
		.ok_or_else(|| SyncError::NotFound(format!("Order {}", order_id)))
}

/// Orders currently or previously held by `partner_id`.
pub fn partner_orders(handle: &EngineHandle, partner_id: &str) -> Result<Vec<Order>, SyncError> {
	let view = handle.view();
	if view.partner(partner_id).is_none() && view.by_partner(partner_id).is_empty() {
		return Err(SyncError::NotFound(format!("Partner {}", partner_id)));
	}
	Ok(view.by_partner(partner_id))
}

pub async fn transition_order(
	handle: &EngineHandle,
	order_id: String,
	request: TransitionRequest,
) -> Result<Order, SyncError> {
	info!(
		order_id = %truncate_id(&order_id),
		status = %request.status,
		"Transition requested"
	);
	let result = handle.request_transition(order_id, request.status).await;
	if let Err(e) = &result {
		warn!(error = %e, "Transition failed");
	}
	result
}

pub async fn submit_order(handle: &EngineHandle, order: NewOrder) -> Result<Order, SyncError> {
	let created = handle.submit_order(order).await?;
	info!(order_id = %truncate_id(&created.id), code = %created.code, "Order submitted");
	Ok(created)
}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_backend::implementations::memory::{MemoryAuthority, MemoryBackend};
	use dispatch_config::ConfigBuilder;
	use dispatch_core::{SyncBuilder, SyncFactories};
	use dispatch_types::{Customer, LineItem, OrderStatus, Partner};
	use rust_decimal::Decimal;
	use std::sync::Arc;

	async fn start(authority: &Arc<MemoryAuthority>) -> EngineHandle {
		let registry = crate::factory_registry::get_registry();
		let factories = SyncFactories {
			storage_factories: registry.storage.clone(),
			backend_factories: registry.backend.clone(),
			channel_factories: registry.channel.clone(),
		};
		let (engine, handle) = SyncBuilder::new(ConfigBuilder::new().build())
			.with_backend(Box::new(MemoryBackend::new(authority.clone())))
			.build(factories)
			.unwrap();
		tokio::spawn(engine.run());
		handle.refresh().await.unwrap();
		handle
	}

	fn new_order() -> NewOrder {
		NewOrder {
			code: Some("ORD-7".into()),
			customer: Customer {
				name: "Ana".into(),
				phone: "555-0100".into(),
				address: "12 Main St".into(),
			},
			items: vec![LineItem {
				name: "Soup".into(),
				quantity: 1,
				unit_price: Decimal::new(900, 2),
			}],
		}
	}

	#[tokio::test]
	async fn test_submitted_order_is_listed_as_available() {
		let authority = Arc::new(MemoryAuthority::default());
		let handle = start(&authority).await;

		let created = submit_order(&handle, new_order()).await.unwrap();
		assert_eq!(get_order(&handle, &created.id).unwrap().code, "ORD-7");
		assert_eq!(list_orders(&handle, OrderListing::Available).len(), 1);
		assert!(list_orders(&handle, OrderListing::History).is_empty());
		assert!(matches!(
			get_order(&handle, "missing"),
			Err(SyncError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn test_cancel_moves_order_to_history() {
		let authority = Arc::new(MemoryAuthority::default());
		authority.register_partner(Partner::new("p1", "Bruno")).unwrap();
		let handle = start(&authority).await;
		let created = submit_order(&handle, new_order()).await.unwrap();

		let cancelled = transition_order(
			&handle,
			created.id.clone(),
			TransitionRequest {
				status: OrderStatus::Cancelled,
			},
		)
		.await
		.unwrap();
		assert_eq!(cancelled.status, OrderStatus::Cancelled);
		assert_eq!(list_orders(&handle, OrderListing::History).len(), 1);
		assert!(partner_orders(&handle, "p1").unwrap().is_empty());
		assert!(partner_orders(&handle, "p404").is_err());
	}
}
