//! Canonical in-memory order store.
//!
//! The store is owned by the engine task and mutated only there. Readers get
//! an immutable [`StoreView`] published after every effective mutation.
//!
//! Updates go through [`OrderStateStore::upsert`], which enforces the
//! conflict policy: status never moves backwards by progression rank,
//! CANCELLED overrides anything but DELIVERED, and an assigned partner is
//! never replaced by another one. Authoritative pulls bypass the policy
//! through [`OrderStateStore::overwrite`], but only for records that have
//! not changed since the pull was issued (see [`OrderStateStore::changed_since`]).

use dispatch_types::{
	truncate_id, Availability, Order, OrderId, OrderStatus, Partner, PartnerId, Snapshot,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Whether the authority has vouched for a record since it was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
	Confirmed,
	/// Seeded from the cache, or missing from the latest full pull.
	Unconfirmed { since: u64 },
}

/// Why an update was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
	/// The incoming status ranks below the stored one.
	StaleStatus {
		stored: OrderStatus,
		incoming: OrderStatus,
	},
	/// The order already has a different partner.
	PartnerConflict { stored: PartnerId, incoming: PartnerId },
}

impl fmt::Display for RejectReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RejectReason::StaleStatus { stored, incoming } => {
				write!(f, "stale status {} over {}", incoming, stored)
			},
			RejectReason::PartnerConflict { stored, incoming } => {
				write!(f, "partner {} conflicts with {}", incoming, stored)
			},
		}
	}
}

/// Result of [`OrderStateStore::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
	Inserted,
	Updated,
	Unchanged,
	Rejected(RejectReason),
}

impl UpsertOutcome {
	/// True when the store changed.
	pub fn is_change(&self) -> bool {
		matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Updated)
	}
}

#[derive(Debug, Clone)]
struct Entry {
	order: Order,
	confirmation: Confirmation,
	/// Revision of the last change to `order`.
	touched: u64,
}

/// The canonical order and partner records of this client.
#[derive(Debug, Default)]
pub struct OrderStateStore {
	orders: HashMap<OrderId, Entry>,
	partners: HashMap<PartnerId, Partner>,
	/// Revision of the last change to each partner.
	partner_touched: HashMap<PartnerId, u64>,
	revision: u64,
}

impl OrderStateStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Loads cached orders; all of them start unconfirmed.
	pub fn seed(&mut self, orders: Vec<Order>, now: u64) {
		self.revision += 1;
		for order in orders {
			self.orders.insert(
				order.id.clone(),
				Entry {
					order,
					confirmation: Confirmation::Unconfirmed { since: now },
					touched: self.revision,
				},
			);
		}
	}

	/// Applies an update under the conflict policy.
	pub fn upsert(&mut self, incoming: Order) -> UpsertOutcome {
		let Some(entry) = self.orders.get_mut(&incoming.id) else {
			self.revision += 1;
			self.orders.insert(
				incoming.id.clone(),
				Entry {
					order: incoming,
					confirmation: Confirmation::Confirmed,
					touched: self.revision,
				},
			);
			return UpsertOutcome::Inserted;
		};

		let stored = &entry.order;
		if !OrderStatus::accepts_update(stored.status, incoming.status) {
			return UpsertOutcome::Rejected(RejectReason::StaleStatus {
				stored: stored.status,
				incoming: incoming.status,
			});
		}
		if let (Some(current), Some(other)) = (&stored.assigned_partner, &incoming.assigned_partner)
		{
			if current != other {
				return UpsertOutcome::Rejected(RejectReason::PartnerConflict {
					stored: current.clone(),
					incoming: other.clone(),
				});
			}
		}

		let merged = merge(stored, incoming);
		if merged == *stored {
			return UpsertOutcome::Unchanged;
		}
		self.revision += 1;
		entry.order = merged;
		entry.touched = self.revision;
		UpsertOutcome::Updated
	}

	/// Replaces a record with the authoritative value and confirms it.
	///
	/// Returns whether the order itself changed.
	pub fn overwrite(&mut self, order: Order) -> bool {
		match self.orders.get_mut(&order.id) {
			Some(entry) => {
				let changed = entry.order != order;
				let promoted = entry.confirmation != Confirmation::Confirmed;
				if changed {
					entry.order = order;
				}
				entry.confirmation = Confirmation::Confirmed;
				if changed || promoted {
					self.revision += 1;
				}
				if changed {
					entry.touched = self.revision;
				}
				changed
			},
			None => {
				self.upsert(order);
				true
			},
		}
	}

	/// Drops a record.
	pub fn evict(&mut self, order_id: &str) -> Option<Order> {
		let entry = self.orders.remove(order_id)?;
		tracing::debug!(order_id = %truncate_id(order_id), "Evicted order");
		self.revision += 1;
		Some(entry.order)
	}

	/// True when the stored order changed after `revision`.
	pub fn changed_since(&self, order_id: &str, revision: u64) -> bool {
		self.orders
			.get(order_id)
			.is_some_and(|entry| entry.touched > revision)
	}

	/// True when the partner changed after `revision`.
	pub fn partner_changed_since(&self, partner_id: &str, revision: u64) -> bool {
		self.partner_touched
			.get(partner_id)
			.is_some_and(|touched| *touched > revision)
	}

	pub fn confirm(&mut self, order_id: &str) {
		if let Some(entry) = self.orders.get_mut(order_id) {
			entry.confirmation = Confirmation::Confirmed;
		}
	}

	/// Marks every record unconfirmed as of `now`.
	pub fn mark_all_unconfirmed(&mut self, now: u64) {
		for entry in self.orders.values_mut() {
			entry.confirmation = Confirmation::Unconfirmed { since: now };
		}
	}

	/// Marks one record unconfirmed unless it already is.
	pub fn mark_unconfirmed(&mut self, order_id: &str, now: u64) {
		if let Some(entry) = self.orders.get_mut(order_id) {
			if entry.confirmation == Confirmation::Confirmed {
				entry.confirmation = Confirmation::Unconfirmed { since: now };
			}
		}
	}

	pub fn confirmation(&self, order_id: &str) -> Option<Confirmation> {
		self.orders.get(order_id).map(|e| e.confirmation)
	}

	/// Time since which a record has been unconfirmed.
	pub fn unconfirmed_since(&self, order_id: &str) -> Option<u64> {
		match self.confirmation(order_id)? {
			Confirmation::Unconfirmed { since } => Some(since),
			Confirmation::Confirmed => None,
		}
	}

	pub fn has_unconfirmed(&self) -> bool {
		self.orders
			.values()
			.any(|e| e.confirmation != Confirmation::Confirmed)
	}

	pub fn get(&self, order_id: &str) -> Option<&Order> {
		self.orders.get(order_id).map(|e| &e.order)
	}

	pub fn contains(&self, order_id: &str) -> bool {
		self.orders.contains_key(order_id)
	}

	pub fn orders(&self) -> impl Iterator<Item = &Order> {
		self.orders.values().map(|e| &e.order)
	}

	pub fn order_ids(&self) -> Vec<OrderId> {
		self.orders.keys().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.orders.len()
	}

	pub fn is_empty(&self) -> bool {
		self.orders.is_empty()
	}

	/// PREP and unassigned.
	pub fn available(&self) -> Vec<&Order> {
		sorted(self.orders().filter(|o| o.is_available()))
	}

	/// Assigned and not yet terminal.
	pub fn active(&self) -> Vec<&Order> {
		sorted(self.orders().filter(|o| o.is_active()))
	}

	/// Orders held by `partner_id`, terminal ones included.
	pub fn by_partner(&self, partner_id: &str) -> Vec<&Order> {
		sorted(
			self.orders()
				.filter(|o| o.assigned_partner.as_deref() == Some(partner_id)),
		)
	}

	/// DELIVERED or CANCELLED.
	pub fn history(&self) -> Vec<&Order> {
		sorted(self.orders().filter(|o| o.status.is_terminal()))
	}

	/// Inserts or replaces a partner. Returns whether anything changed.
	pub fn upsert_partner(&mut self, partner: Partner) -> bool {
		if self.partners.get(&partner.id) == Some(&partner) {
			return false;
		}
		self.revision += 1;
		self.partner_touched.insert(partner.id.clone(), self.revision);
		self.partners.insert(partner.id.clone(), partner);
		true
	}

	pub fn partner(&self, partner_id: &str) -> Option<&Partner> {
		self.partners.get(partner_id)
	}

	pub fn partners(&self) -> impl Iterator<Item = &Partner> {
		self.partners.values()
	}

	/// Marks a known partner busy with `order_id`.
	pub fn set_partner_busy(&mut self, partner_id: &str, order_id: &str) -> bool {
		let Some(partner) = self.partners.get_mut(partner_id) else {
			return false;
		};
		if partner.current_order.as_deref() == Some(order_id) {
			return false;
		}
		partner.occupy(order_id);
		self.revision += 1;
		self.partner_touched.insert(partner_id.to_string(), self.revision);
		true
	}

	/// Frees a partner holding `order_id`; any order when `None`.
	pub fn release_partner(&mut self, partner_id: &str, order_id: Option<&str>) -> bool {
		let Some(partner) = self.partners.get_mut(partner_id) else {
			return false;
		};
		let released = match order_id {
			Some(order_id) => partner.release(order_id),
			None => {
				let was_busy = partner.current_order.is_some()
					|| partner.availability != Availability::Available;
				partner.current_order = None;
				partner.availability = Availability::Available;
				was_busy
			},
		};
		if released {
			self.revision += 1;
			self.partner_touched.insert(partner_id.to_string(), self.revision);
		}
		released
	}

	/// Monotonic counter bumped on every effective mutation.
	pub fn revision(&self) -> u64 {
		self.revision
	}

	/// Persistable record of all orders.
	pub fn snapshot(&self, saved_at: u64) -> Snapshot {
		Snapshot::new(
			sorted(self.orders()).into_iter().cloned().collect(),
			saved_at,
		)
	}

	/// Immutable copy for readers.
	pub fn view(&self) -> StoreView {
		let mut partners: Vec<Partner> = self.partners.values().cloned().collect();
		partners.sort_by(|a, b| a.id.cmp(&b.id));
		StoreView {
			revision: self.revision,
			orders: sorted(self.orders()).into_iter().cloned().collect(),
			partners,
		}
	}
}

/// Incoming values win; timestamps and the partner are only ever filled in.
fn merge(stored: &Order, incoming: Order) -> Order {
	Order {
		assigned_partner: incoming
			.assigned_partner
			.or_else(|| stored.assigned_partner.clone()),
		assigned_at: incoming.assigned_at.or(stored.assigned_at),
		picked_at: incoming.picked_at.or(stored.picked_at),
		on_route_at: incoming.on_route_at.or(stored.on_route_at),
		delivered_at: incoming.delivered_at.or(stored.delivered_at),
		cancelled_at: incoming.cancelled_at.or(stored.cancelled_at),
		created_at: if incoming.created_at == 0 {
			stored.created_at
		} else {
			incoming.created_at
		},
		..incoming
	}
}

fn sorted<'a>(orders: impl Iterator<Item = &'a Order>) -> Vec<&'a Order> {
	let mut orders: Vec<&Order> = orders.collect();
	orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
	orders
}

/// Read-only copy of the store at one revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreView {
	pub revision: u64,
	/// Ordered by creation time.
	pub orders: Vec<Order>,
	pub partners: Vec<Partner>,
}

impl StoreView {
	pub fn get(&self, order_id: &str) -> Option<&Order> {
		self.orders.iter().find(|o| o.id == order_id)
	}

	pub fn available(&self) -> Vec<Order> {
		self.filtered(Order::is_available)
	}

	pub fn active(&self) -> Vec<Order> {
		self.filtered(Order::is_active)
	}

	pub fn history(&self) -> Vec<Order> {
		self.filtered(|o| o.status.is_terminal())
	}

	pub fn by_partner(&self, partner_id: &str) -> Vec<Order> {
		self.filtered(|o| o.assigned_partner.as_deref() == Some(partner_id))
	}

	pub fn partner(&self, partner_id: &str) -> Option<&Partner> {
		self.partners.iter().find(|p| p.id == partner_id)
	}

	fn filtered(&self, keep: impl Fn(&Order) -> bool) -> Vec<Order> {
		self.orders.iter().filter(|o| keep(o)).cloned().collect()
	}
}

#[cfg(test)]
pub(crate) mod fixtures {
	use dispatch_types::{Customer, LineItem, Order, OrderStatus};
	use rust_decimal::Decimal;

	pub fn order(id: &str, status: OrderStatus) -> Order {
		Order {
			id: id.to_string(),
			code: format!("ORD-{}", id),
			status,
			assigned_partner: None,
			customer: Customer {
				name: "Ana".to_string(),
				phone: "555-0100".to_string(),
				address: "12 Main St".to_string(),
			},
			items: vec![LineItem {
				name: "Pizza".to_string(),
				quantity: 2,
				unit_price: Decimal::new(1250, 2),
			}],
			total_amount: Decimal::new(2500, 2),
			created_at: 1_000,
			assigned_at: None,
			picked_at: None,
			on_route_at: None,
			delivered_at: None,
			cancelled_at: None,
		}
	}

	pub fn assigned(id: &str, partner: &str, status: OrderStatus) -> Order {
		let mut order = order(id, status);
		order.assigned_partner = Some(partner.to_string());
		order.assigned_at = Some(1_100);
		order
	}
}

#[cfg(test)]
mod tests {
	use super::fixtures::{assigned, order};
	use super::*;

	#[test]
	fn test_status_never_regresses() {
		let mut store = OrderStateStore::new();
		assert_eq!(
			store.upsert(assigned("o1", "p1", OrderStatus::OnRoute)),
			UpsertOutcome::Inserted
		);

		let outcome = store.upsert(assigned("o1", "p1", OrderStatus::Picked));
		assert!(matches!(
			outcome,
			UpsertOutcome::Rejected(RejectReason::StaleStatus { .. })
		));
		assert_eq!(store.get("o1").unwrap().status, OrderStatus::OnRoute);

		assert_eq!(
			store.upsert(assigned("o1", "p1", OrderStatus::Delivered)),
			UpsertOutcome::Updated
		);
		assert!(matches!(
			store.upsert(assigned("o1", "p1", OrderStatus::Cancelled)),
			UpsertOutcome::Rejected(_)
		));
	}

	#[test]
	fn test_cancel_overrides_and_sticks() {
		let mut store = OrderStateStore::new();
		store.upsert(assigned("o1", "p1", OrderStatus::Picked));
		assert_eq!(
			store.upsert(assigned("o1", "p1", OrderStatus::Cancelled)),
			UpsertOutcome::Updated
		);
		assert!(matches!(
			store.upsert(assigned("o1", "p1", OrderStatus::OnRoute)),
			UpsertOutcome::Rejected(_)
		));
		assert_eq!(store.history().len(), 1);
	}

	#[test]
	fn test_partner_is_set_once() {
		let mut store = OrderStateStore::new();
		store.upsert(order("o1", OrderStatus::Prep));
		assert_eq!(store.available().len(), 1);

		assert_eq!(
			store.upsert(assigned("o1", "p1", OrderStatus::Prep)),
			UpsertOutcome::Updated
		);
		assert!(store.available().is_empty());
		assert_eq!(store.active().len(), 1);

		assert!(matches!(
			store.upsert(assigned("o1", "p2", OrderStatus::Prep)),
			UpsertOutcome::Rejected(RejectReason::PartnerConflict { .. })
		));
		// A stale unassigned copy keeps the partner.
		assert_eq!(
			store.upsert(order("o1", OrderStatus::Prep)),
			UpsertOutcome::Unchanged
		);
		assert_eq!(store.by_partner("p1").len(), 1);
	}

	#[test]
	fn test_details_overwritten_and_timestamps_merged() {
		let mut store = OrderStateStore::new();
		let mut first = assigned("o1", "p1", OrderStatus::Picked);
		first.picked_at = Some(1_200);
		store.upsert(first);

		let mut update = assigned("o1", "p1", OrderStatus::Picked);
		update.customer.address = "14 Main St".to_string();
		update.assigned_at = None;
		assert_eq!(store.upsert(update), UpsertOutcome::Updated);

		let stored = store.get("o1").unwrap();
		assert_eq!(stored.customer.address, "14 Main St");
		assert_eq!(stored.picked_at, Some(1_200));
		assert_eq!(stored.assigned_at, Some(1_100));
	}

	#[test]
	fn test_revision_tracks_effective_changes() {
		let mut store = OrderStateStore::new();
		store.upsert(order("o1", OrderStatus::Prep));
		let revision = store.revision();

		store.upsert(order("o1", OrderStatus::Prep));
		assert_eq!(store.revision(), revision);

		store.upsert_partner(Partner::new("p1", "Bruno"));
		assert!(store.set_partner_busy("p1", "o1"));
		assert!(!store.set_partner_busy("p1", "o1"));
		assert_eq!(store.revision(), revision + 2);
	}

	#[test]
	fn test_seeded_orders_need_confirmation() {
		let mut store = OrderStateStore::new();
		store.seed(vec![order("o1", OrderStatus::Prep)], 500);
		assert_eq!(store.unconfirmed_since("o1"), Some(500));
		assert!(store.has_unconfirmed());

		assert!(!store.overwrite(order("o1", OrderStatus::Prep)));
		assert_eq!(store.confirmation("o1"), Some(Confirmation::Confirmed));
	}

	#[test]
	fn test_view_and_snapshot_are_ordered() {
		let mut store = OrderStateStore::new();
		let mut later = order("a", OrderStatus::Prep);
		later.created_at = 2_000;
		store.upsert(later);
		store.upsert(order("b", OrderStatus::Prep));

		let view = store.view();
		let ids: Vec<&str> = view.orders.iter().map(|o| o.id.as_str()).collect();
		assert_eq!(ids, vec!["b", "a"]);
		assert_eq!(view.available().len(), 2);
		assert_eq!(store.snapshot(9).orders.len(), 2);
	}

	#[test]
	fn test_release_partner() {
		let mut store = OrderStateStore::new();
		store.upsert_partner(Partner::new("p1", "Bruno"));
		store.set_partner_busy("p1", "o1");
		assert!(!store.release_partner("p1", Some("o2")));
		assert!(store.release_partner("p1", Some("o1")));
		assert!(!store.partner("p1").unwrap().is_busy());
	}
}
