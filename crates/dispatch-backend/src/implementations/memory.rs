//! In-process authority.
//!
//! Holds orders and partners behind a single lock and implements the
//! authoritative side of the protocol: compare-and-swap assignment with
//! idempotency tokens, the lifecycle state machine for transitions, and a
//! broadcast feed of typed events with per-order sequence numbers. Events
//! are sent before the lock is released, so the feed carries each order's
//! sequence numbers in increasing order. Several
//! clients can share one [`MemoryAuthority`] to exercise concurrent
//! assignment end to end.

use crate::{BackendError, BackendInterface, PullResponse};
use async_trait::async_trait;
use dispatch_types::{
	current_timestamp, truncate_id, AssignmentConfirmation, AssignmentIntent, ChannelEvent,
	ConfigSchema, Credentials, EventPayload, Field, FieldType, ImplementationRegistry, NewOrder,
	Order, OrderId, OrderStatus, Partner, PartnerId, Schema, ValidationError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct AuthorityState {
	orders: HashMap<OrderId, Order>,
	partners: HashMap<PartnerId, Partner>,
	/// Last change time per order, used for delta pulls.
	updated_at: HashMap<OrderId, u64>,
	/// Last emitted sequence number per order.
	sequences: HashMap<OrderId, u64>,
	/// Confirmations by idempotency token.
	confirmations: HashMap<String, AssignmentConfirmation>,
	next_code: u64,
}

impl AuthorityState {
	fn next_sequence(&mut self, order_id: &str) -> u64 {
		let sequence = self.sequences.entry(order_id.to_string()).or_insert(0);
		*sequence += 1;
		*sequence
	}

	fn touch(&mut self, order_id: &str, at: u64) {
		self.updated_at.insert(order_id.to_string(), at);
	}
}

/// Authoritative order state shared by every client attached to it.
pub struct MemoryAuthority {
	state: Mutex<AuthorityState>,
	events: broadcast::Sender<ChannelEvent>,
	/// Accepted bearer tokens; empty accepts any.
	accepted_tokens: HashSet<String>,
}

impl Default for MemoryAuthority {
	fn default() -> Self {
		Self::new(DEFAULT_EVENT_CAPACITY)
	}
}

impl MemoryAuthority {
	pub fn new(event_capacity: usize) -> Self {
		let (events, _) = broadcast::channel(event_capacity.max(1));
		Self {
			state: Mutex::new(AuthorityState::default()),
			events,
			accepted_tokens: HashSet::new(),
		}
	}

	/// Restricts access to the given bearer tokens.
	pub fn with_accepted_tokens<I, S>(mut self, tokens: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.accepted_tokens = tokens.into_iter().map(Into::into).collect();
		self
	}

	fn lock(&self) -> Result<MutexGuard<'_, AuthorityState>, BackendError> {
		self.state
			.lock()
			.map_err(|_| BackendError::Network("authority state poisoned".into()))
	}

	fn authorize(&self, credentials: &Credentials) -> Result<(), BackendError> {
		if self.accepted_tokens.is_empty()
			|| credentials
				.token
				.with_exposed(|t| self.accepted_tokens.contains(t))
		{
			Ok(())
		} else {
			Err(BackendError::Auth(format!(
				"token of {} refused",
				credentials.client_id
			)))
		}
	}

	fn publish(&self, event: ChannelEvent) {
		// No receivers is fine: nobody is connected.
		let _ = self.events.send(event);
	}

	/// Subscribes to the event feed.
	pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
		self.events.subscribe()
	}

	/// Registers or replaces a partner.
	pub fn register_partner(&self, partner: Partner) -> Result<(), BackendError> {
		self.lock()?.partners.insert(partner.id.clone(), partner);
		Ok(())
	}

	/// Inserts an order as-is, without emitting an event.
	pub fn insert_order(&self, order: Order) -> Result<(), BackendError> {
		let mut state = self.lock()?;
		state.touch(&order.id, current_timestamp());
		state.orders.insert(order.id.clone(), order);
		Ok(())
	}

	/// Removes an order without emitting an event.
	pub fn remove_order(&self, order_id: &str) -> Result<Option<Order>, BackendError> {
		Ok(self.lock()?.orders.remove(order_id))
	}

	pub fn order(&self, order_id: &str) -> Option<Order> {
		self.lock().ok()?.orders.get(order_id).cloned()
	}

	pub fn partner(&self, partner_id: &str) -> Option<Partner> {
		self.lock().ok()?.partners.get(partner_id).cloned()
	}

	/// Pushes a raw event to every subscriber, bypassing the state.
	pub fn emit(&self, event: ChannelEvent) {
		self.publish(event);
	}

	fn pull(&self, since: Option<u64>) -> Result<PullResponse, BackendError> {
		let state = self.lock()?;
		let orders = state
			.orders
			.values()
			.filter(|order| match since {
				None => true,
				Some(since) => state
					.updated_at
					.get(&order.id)
					.is_some_and(|changed| *changed >= since),
			})
			.cloned()
			.collect();

		Ok(PullResponse {
			orders,
			partners: state.partners.values().cloned().collect(),
			full: since.is_none(),
			server_time: current_timestamp(),
		})
	}

	fn create(&self, new_order: &NewOrder) -> Result<Order, BackendError> {
		if new_order.items.is_empty() {
			return Err(BackendError::Validation("order has no items".into()));
		}
		if new_order.customer.name.trim().is_empty() {
			return Err(BackendError::Validation("customer name is required".into()));
		}

		let now = current_timestamp();
		let mut state = self.lock()?;
		state.next_code += 1;
		let order = Order {
			id: uuid::Uuid::new_v4().to_string(),
			code: new_order
				.code
				.clone()
				.unwrap_or_else(|| format!("ORD-{:04}", state.next_code)),
			status: OrderStatus::Prep,
			assigned_partner: None,
			customer: new_order.customer.clone(),
			items: new_order.items.clone(),
			total_amount: new_order.total_amount(),
			created_at: now,
			assigned_at: None,
			picked_at: None,
			on_route_at: None,
			delivered_at: None,
			cancelled_at: None,
		};
		state.orders.insert(order.id.clone(), order.clone());
		state.touch(&order.id, now);
		let sequence = state.next_sequence(&order.id);
		self.publish(
			ChannelEvent::new(EventPayload::OrderCreated {
				order: order.clone(),
			})
			.with_sequence(sequence),
		);
		drop(state);

		tracing::info!(order_id = %truncate_id(&order.id), code = %order.code, "Order created");
		Ok(order)
	}

	fn transition(&self, order_id: &str, target: OrderStatus) -> Result<Order, BackendError> {
		let now = current_timestamp();
		let mut state = self.lock()?;
		let order = state
			.orders
			.get_mut(order_id)
			.ok_or_else(|| BackendError::NotFound(format!("order {}", order_id)))?;

		if order.status == target {
			return Ok(order.clone());
		}
		order
			.lifecycle()
			.check_transition(target)
			.map_err(|e| BackendError::InvalidTransition(e.to_string()))?;

		order.apply_status(target, now);
		let updated = order.clone();
		let mut events = Vec::new();

		let sequence = state.next_sequence(order_id);
		events.push(ChannelEvent::new(match target {
			OrderStatus::Delivered => EventPayload::OrderDelivered {
				order_id: order_id.to_string(),
			},
			status => EventPayload::OrderStatusChanged {
				order_id: order_id.to_string(),
				status,
			},
		})
		.with_sequence(sequence));

		if target.is_terminal() {
			if let Some(partner_id) = updated.assigned_partner.as_deref() {
				if let Some(partner) = state.partners.get_mut(partner_id) {
					if partner.release(order_id) {
						// Unsequenced: it is about the partner, not the order.
						events.push(ChannelEvent::new(EventPayload::PartnerAvailable {
							partner_id: partner_id.to_string(),
							order_id: Some(order_id.to_string()),
						}));
					}
				}
			}
		}
		state.touch(order_id, now);
		for event in events {
			self.publish(event);
		}
		drop(state);

		tracing::info!(order_id = %truncate_id(order_id), status = %target, "Order transitioned");
		Ok(updated)
	}

	fn assign(&self, intent: &AssignmentIntent) -> Result<AssignmentConfirmation, BackendError> {
		let now = current_timestamp();
		let mut state = self.lock()?;

		// Replayed intent: answer with the original confirmation.
		if let Some(confirmation) = state.confirmations.get(&intent.token) {
			if confirmation.order_id == intent.order_id
				&& confirmation.partner_id == intent.partner_id
			{
				return Ok(confirmation.clone());
			}
			return Err(BackendError::Validation(
				"token already used for another intent".into(),
			));
		}

		let partner = state
			.partners
			.get(&intent.partner_id)
			.ok_or_else(|| BackendError::Validation(format!("unknown partner {}", intent.partner_id)))?;
		if partner.current_order.is_some() {
			return Err(BackendError::Validation(format!(
				"partner {} is busy",
				intent.partner_id
			)));
		}

		let order = state
			.orders
			.get_mut(&intent.order_id)
			.ok_or_else(|| BackendError::NotFound(format!("order {}", intent.order_id)))?;

		// Compare-and-swap: only PREP and unassigned.
		if order.assigned_partner.is_some() {
			return Err(BackendError::AlreadyAssigned(intent.order_id.clone()));
		}
		if order.status != OrderStatus::Prep {
			return Err(BackendError::InvalidTransition(format!(
				"order {} is {}",
				intent.order_id, order.status
			)));
		}

		order.apply_assignment(&intent.partner_id, now);
		let confirmation = AssignmentConfirmation {
			order_id: intent.order_id.clone(),
			partner_id: intent.partner_id.clone(),
			token: Some(intent.token.clone()),
			assigned_at: now,
			order: Some(order.clone()),
		};
		if let Some(partner) = state.partners.get_mut(&intent.partner_id) {
			partner.occupy(&intent.order_id);
		}
		state
			.confirmations
			.insert(intent.token.clone(), confirmation.clone());
		state.touch(&intent.order_id, now);
		let sequence = state.next_sequence(&intent.order_id);
		self.publish(
			ChannelEvent::new(EventPayload::OrderAssigned {
				order_id: intent.order_id.clone(),
				partner_id: intent.partner_id.clone(),
				token: Some(intent.token.clone()),
				assigned_at: now,
			})
			.with_sequence(sequence),
		);
		drop(state);

		tracing::info!(
			order_id = %truncate_id(&intent.order_id),
			partner_id = %intent.partner_id,
			"Order assigned"
		);
		Ok(confirmation)
	}
}

/// Backend handle over a shared [`MemoryAuthority`].
pub struct MemoryBackend {
	authority: Arc<MemoryAuthority>,
}

impl MemoryBackend {
	pub fn new(authority: Arc<MemoryAuthority>) -> Self {
		Self { authority }
	}

	pub fn authority(&self) -> &Arc<MemoryAuthority> {
		&self.authority
	}
}

#[async_trait]
impl BackendInterface for MemoryBackend {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryBackendSchema)
	}

	async fn pull_orders(
		&self,
		credentials: &Credentials,
		since: Option<u64>,
	) -> Result<PullResponse, BackendError> {
		self.authority.authorize(credentials)?;
		self.authority.pull(since)
	}

	async fn create_order(
		&self,
		credentials: &Credentials,
		order: &NewOrder,
	) -> Result<Order, BackendError> {
		self.authority.authorize(credentials)?;
		self.authority.create(order)
	}

	async fn transition(
		&self,
		credentials: &Credentials,
		order_id: &str,
		status: OrderStatus,
	) -> Result<Order, BackendError> {
		self.authority.authorize(credentials)?;
		self.authority.transition(order_id, status)
	}

	async fn assign(
		&self,
		credentials: &Credentials,
		intent: &AssignmentIntent,
	) -> Result<AssignmentConfirmation, BackendError> {
		self.authority.authorize(credentials)?;
		self.authority.assign(intent)
	}

	fn event_feed(&self) -> Option<broadcast::Receiver<ChannelEvent>> {
		Some(self.authority.subscribe())
	}
}

/// Configuration schema for MemoryBackend.
pub struct MemoryBackendSchema;

impl ConfigSchema for MemoryBackendSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let partner = Schema::new(
			vec![
				Field::new("id", FieldType::String),
				Field::new("name", FieldType::String),
			],
			vec![Field::new("contact", FieldType::String)],
		);
		Schema::new(
			vec![],
			vec![
				Field::new(
					"event_capacity",
					FieldType::Integer {
						min: Some(1),
						max: Some(65536),
					},
				),
				Field::new(
					"accepted_tokens",
					FieldType::Array(Box::new(FieldType::String)),
				),
				Field::new("partners", FieldType::Array(Box::new(FieldType::Table(partner)))),
			],
		)
		.validate(config)
	}
}

/// Factory function to create a memory backend with a fresh authority.
///
/// Configuration parameters:
/// - `event_capacity`: broadcast buffer size (default: 256)
/// - `accepted_tokens`: bearer tokens to accept (default: any)
/// - `partners`: array of `{ id, name, contact? }` to register
pub fn create_backend(config: &toml::Value) -> Result<Box<dyn BackendInterface>, BackendError> {
	MemoryBackendSchema
		.validate(config)
		.map_err(|e| BackendError::Validation(format!("Invalid configuration: {}", e)))?;

	let capacity = config
		.get("event_capacity")
		.and_then(|v| v.as_integer())
		.map_or(DEFAULT_EVENT_CAPACITY, |v| v as usize);
	let tokens: Vec<String> = config
		.get("accepted_tokens")
		.and_then(|v| v.as_array())
		.map(|items| {
			items
				.iter()
				.filter_map(|t| t.as_str().map(str::to_string))
				.collect()
		})
		.unwrap_or_default();

	let authority = MemoryAuthority::new(capacity).with_accepted_tokens(tokens);
	for entry in config
		.get("partners")
		.and_then(|v| v.as_array())
		.into_iter()
		.flatten()
	{
		let (Some(id), Some(name)) = (
			entry.get("id").and_then(|v| v.as_str()),
			entry.get("name").and_then(|v| v.as_str()),
		) else {
			continue;
		};
		let mut partner = Partner::new(id, name);
		if let Some(contact) = entry.get("contact").and_then(|v| v.as_str()) {
			partner.contact = contact.to_string();
		}
		authority.register_partner(partner)?;
	}

	Ok(Box::new(MemoryBackend::new(Arc::new(authority))))
}

/// Registry for the memory backend implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = crate::BackendFactory;

	fn factory() -> Self::Factory {
		create_backend
	}
}

impl crate::BackendRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_types::{Availability, Customer, LineItem};
	use rust_decimal::Decimal;

	fn new_order() -> NewOrder {
		NewOrder {
			code: None,
			customer: Customer {
				name: "Ana".into(),
				phone: "555".into(),
				address: "Main St".into(),
			},
			items: vec![LineItem {
				name: "Pizza".into(),
				quantity: 2,
				unit_price: Decimal::new(1250, 2),
			}],
		}
	}

	fn authority_with_partners(ids: &[&str]) -> Arc<MemoryAuthority> {
		let authority = MemoryAuthority::default();
		for id in ids {
			authority.register_partner(Partner::new(*id, *id)).unwrap();
		}
		Arc::new(authority)
	}

	fn intent(order_id: &str, partner_id: &str, token: &str) -> AssignmentIntent {
		AssignmentIntent {
			order_id: order_id.into(),
			partner_id: partner_id.into(),
			token: token.into(),
		}
	}

	fn creds() -> Credentials {
		Credentials::new("c", "t")
	}

	#[tokio::test]
	async fn test_concurrent_intents_single_winner() {
		let ids: Vec<String> = (0..8).map(|i| format!("p{}", i)).collect();
		let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
		let authority = authority_with_partners(&refs);
		let order = authority.create(&new_order()).unwrap();

		let mut handles = Vec::new();
		for (i, partner) in ids.iter().enumerate() {
			let backend = MemoryBackend::new(authority.clone());
			let intent = intent(&order.id, partner, &format!("tok-{}", i));
			handles.push(tokio::spawn(async move {
				backend.assign(&creds(), &intent).await
			}));
		}

		let mut winners = Vec::new();
		for handle in handles {
			match handle.await.unwrap() {
				Ok(confirmation) => winners.push(confirmation.partner_id),
				Err(e) => assert_eq!(e, BackendError::AlreadyAssigned(order.id.clone())),
			}
		}
		assert_eq!(winners.len(), 1);

		let stored = authority.order(&order.id).unwrap();
		assert_eq!(stored.assigned_partner.as_ref(), Some(&winners[0]));
		assert_eq!(stored.status, OrderStatus::Prep);
		let partner = authority.partner(&winners[0]).unwrap();
		assert_eq!(partner.availability, Availability::Busy);
		assert_eq!(partner.current_order.as_deref(), Some(order.id.as_str()));
	}

	#[tokio::test]
	async fn test_replayed_token_returns_same_confirmation() {
		let authority = authority_with_partners(&["p1"]);
		let backend = MemoryBackend::new(authority.clone());
		let order = authority.create(&new_order()).unwrap();
		let mut feed = backend.event_feed().unwrap();

		let first = backend.assign(&creds(), &intent(&order.id, "p1", "t1")).await.unwrap();
		let again = backend.assign(&creds(), &intent(&order.id, "p1", "t1")).await.unwrap();
		assert_eq!(first, again);

		// Only one broadcast for the two calls.
		assert!(matches!(feed.recv().await.unwrap().payload, EventPayload::OrderAssigned { .. }));
		assert!(matches!(
			feed.try_recv(),
			Err(broadcast::error::TryRecvError::Empty)
		));
	}

	#[tokio::test]
	async fn test_transitions_follow_lifecycle() {
		let authority = authority_with_partners(&["p1"]);
		let backend = MemoryBackend::new(authority.clone());
		let order = authority.create(&new_order()).unwrap();

		let err = backend
			.transition(&creds(), &order.id, OrderStatus::Picked)
			.await
			.unwrap_err();
		assert!(matches!(err, BackendError::InvalidTransition(_)));
		assert_eq!(authority.order(&order.id).unwrap().status, OrderStatus::Prep);

		backend.assign(&creds(), &intent(&order.id, "p1", "t1")).await.unwrap();
		for status in [OrderStatus::Picked, OrderStatus::OnRoute, OrderStatus::Delivered] {
			let updated = backend.transition(&creds(), &order.id, status).await.unwrap();
			assert_eq!(updated.status, status);
		}
		// Idempotent repeat.
		assert!(backend
			.transition(&creds(), &order.id, OrderStatus::Delivered)
			.await
			.is_ok());
		assert!(matches!(
			backend.transition(&creds(), &order.id, OrderStatus::Cancelled).await,
			Err(BackendError::InvalidTransition(_))
		));

		let partner = authority.partner("p1").unwrap();
		assert_eq!(partner.availability, Availability::Available);
		assert!(partner.current_order.is_none());
	}

	#[tokio::test]
	async fn test_events_carry_increasing_sequence() {
		let authority = authority_with_partners(&["p1"]);
		let backend = MemoryBackend::new(authority.clone());
		let mut feed = backend.event_feed().unwrap();
		let order = authority.create(&new_order()).unwrap();
		backend.assign(&creds(), &intent(&order.id, "p1", "t1")).await.unwrap();
		backend
			.transition(&creds(), &order.id, OrderStatus::Picked)
			.await
			.unwrap();

		let mut sequences = Vec::new();
		while let Ok(event) = feed.try_recv() {
			assert_eq!(event.order_id(), Some(order.id.as_str()));
			sequences.push(event.sequence.unwrap());
		}
		assert_eq!(sequences, vec![1, 2, 3]);
	}

	#[test]
	fn test_racing_mutations_publish_in_sequence() {
		let authority = MemoryAuthority::new(1024);
		let mut feed = authority.subscribe();
		let mut ids = Vec::new();
		for round in 0..100 {
			let mut order = authority.create(&new_order()).unwrap();
			order.assigned_partner = Some(format!("p{}", round));
			order.assigned_at = Some(order.created_at);
			ids.push(order.id.clone());
			authority.insert_order(order).unwrap();
		}

		std::thread::scope(|scope| {
			for target in [OrderStatus::Picked, OrderStatus::Cancelled] {
				let authority = &authority;
				let ids = &ids;
				scope.spawn(move || {
					for id in ids {
						let _ = authority.transition(id, target);
					}
				});
			}
		});

		let mut highest: HashMap<String, u64> = HashMap::new();
		while let Ok(event) = feed.try_recv() {
			let (Some(order_id), Some(sequence)) = (event.order_id(), event.sequence) else {
				continue;
			};
			let last = highest.entry(order_id.to_string()).or_insert(0);
			assert!(sequence > *last, "sequence {} after {}", sequence, last);
			*last = sequence;
		}
		assert_eq!(highest.len(), ids.len());
	}

	#[tokio::test]
	async fn test_delta_pull_and_auth() {
		let authority = MemoryAuthority::default().with_accepted_tokens(["good"]);
		let backend = MemoryBackend::new(Arc::new(authority));
		let good = Credentials::new("c", "good");

		backend.create_order(&good, &new_order()).await.unwrap();
		let full = backend.pull_orders(&good, None).await.unwrap();
		assert!(full.full);
		assert_eq!(full.orders.len(), 1);

		let delta = backend
			.pull_orders(&good, Some(full.server_time + 3600))
			.await
			.unwrap();
		assert!(!delta.full);
		assert!(delta.orders.is_empty());

		assert!(matches!(
			backend.pull_orders(&Credentials::new("c", "bad"), None).await,
			Err(BackendError::Auth(_))
		));
	}

	#[test]
	fn test_factory_registers_partners() {
		let config: toml::Value = toml::from_str(
			r#"
			partners = [{ id = "p1", name = "Bruno" }, { id = "p2", name = "Carla", contact = "555" }]
			"#,
		)
		.unwrap();
		assert!(create_backend(&config).is_ok());

		let bad: toml::Value = toml::from_str("partners = [{ id = \"p1\" }]").unwrap();
		assert!(create_backend(&bad).is_err());
	}
}
