//! Order types and the order lifecycle state machine.
//!
//! An order moves PREP -> PICKED -> ON_ROUTE -> DELIVERED, or to CANCELLED
//! from any non-terminal state. The PREP stage is split in two lifecycle
//! states depending on whether a partner has been assigned, which is what
//! the available pool and the assignment protocol key on.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable internal order identifier.
pub type OrderId = String;
/// Stable partner identifier.
pub type PartnerId = String;

/// Status of an order as carried on the wire and in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
	/// Being prepared by the restaurant.
	Prep,
	/// Picked up by the assigned partner.
	Picked,
	/// On the way to the customer.
	OnRoute,
	/// Delivered to the customer.
	Delivered,
	/// Cancelled before delivery.
	Cancelled,
}

impl OrderStatus {
	/// Fixed progression rank used to reject stale updates.
	///
	/// Cancelled has no rank: it overrides any non-terminal status instead of
	/// being ordered against them.
	pub fn progression_rank(&self) -> Option<u8> {
		match self {
			OrderStatus::Prep => Some(0),
			OrderStatus::Picked => Some(1),
			OrderStatus::OnRoute => Some(2),
			OrderStatus::Delivered => Some(3),
			OrderStatus::Cancelled => None,
		}
	}

	/// Returns true for DELIVERED and CANCELLED.
	pub fn is_terminal(&self) -> bool {
		matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
	}

	/// Decides whether an incoming status may replace the stored one.
	///
	/// Equal or higher rank wins; CANCELLED wins unless the order was already
	/// delivered; nothing but another CANCELLED replaces a cancelled order.
	pub fn accepts_update(stored: OrderStatus, incoming: OrderStatus) -> bool {
		match (stored, incoming) {
			(OrderStatus::Cancelled, incoming) => incoming == OrderStatus::Cancelled,
			(OrderStatus::Delivered, OrderStatus::Cancelled) => false,
			(_, OrderStatus::Cancelled) => true,
			(stored, incoming) => incoming.progression_rank() >= stored.progression_rank(),
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			OrderStatus::Prep => "prep",
			OrderStatus::Picked => "picked",
			OrderStatus::OnRoute => "on_route",
			OrderStatus::Delivered => "delivered",
			OrderStatus::Cancelled => "cancelled",
		}
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Lifecycle state derived from status and assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
	PrepUnassigned,
	PrepAssigned,
	Picked,
	OnRoute,
	Delivered,
	Cancelled,
}

impl LifecycleState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, LifecycleState::Delivered | LifecycleState::Cancelled)
	}

	/// Checks a status transition request against the state machine.
	///
	/// PREP-unassigned only leaves the pool through assignment, which is not a
	/// status transition, so the only status it accepts is CANCELLED.
	pub fn can_transition_to(&self, target: OrderStatus) -> bool {
		match (self, target) {
			(state, OrderStatus::Cancelled) => !state.is_terminal(),
			(LifecycleState::PrepAssigned, OrderStatus::Picked) => true,
			(LifecycleState::Picked, OrderStatus::OnRoute) => true,
			(LifecycleState::OnRoute, OrderStatus::Delivered) => true,
			_ => false,
		}
	}

	/// Validates a transition, returning the typed error on refusal.
	pub fn check_transition(&self, target: OrderStatus) -> Result<(), TransitionError> {
		if self.can_transition_to(target) {
			Ok(())
		} else {
			Err(TransitionError {
				from: *self,
				to: target,
			})
		}
	}
}

impl fmt::Display for LifecycleState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			LifecycleState::PrepUnassigned => "prep-unassigned",
			LifecycleState::PrepAssigned => "prep-assigned",
			LifecycleState::Picked => "picked",
			LifecycleState::OnRoute => "on_route",
			LifecycleState::Delivered => "delivered",
			LifecycleState::Cancelled => "cancelled",
		};
		f.write_str(name)
	}
}

/// A refused lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition from {from} to {to}")]
pub struct TransitionError {
	pub from: LifecycleState,
	pub to: OrderStatus,
}

/// Customer contact details attached to an order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Customer {
	pub name: String,
	pub phone: String,
	pub address: String,
}

/// A single line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
	pub name: String,
	pub quantity: u32,
	pub unit_price: Decimal,
}

impl LineItem {
	pub fn subtotal(&self) -> Decimal {
		self.unit_price * Decimal::from(self.quantity)
	}
}

/// A delivery order as held by every client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
	/// Stable internal identifier.
	pub id: OrderId,
	/// Human readable code shown to managers and partners.
	pub code: String,
	pub status: OrderStatus,
	/// Partner holding this order, if it has left the available pool.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub assigned_partner: Option<PartnerId>,
	pub customer: Customer,
	#[serde(default)]
	pub items: Vec<LineItem>,
	pub total_amount: Decimal,
	/// Unix seconds.
	pub created_at: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub assigned_at: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub picked_at: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub on_route_at: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub delivered_at: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cancelled_at: Option<u64>,
}

impl Order {
	/// Lifecycle state derived from status and assignment.
	pub fn lifecycle(&self) -> LifecycleState {
		match (self.status, self.assigned_partner.is_some()) {
			(OrderStatus::Prep, false) => LifecycleState::PrepUnassigned,
			(OrderStatus::Prep, true) => LifecycleState::PrepAssigned,
			(OrderStatus::Picked, _) => LifecycleState::Picked,
			(OrderStatus::OnRoute, _) => LifecycleState::OnRoute,
			(OrderStatus::Delivered, _) => LifecycleState::Delivered,
			(OrderStatus::Cancelled, _) => LifecycleState::Cancelled,
		}
	}

	/// Whether the order sits in the available pool.
	pub fn is_available(&self) -> bool {
		self.lifecycle() == LifecycleState::PrepUnassigned
	}

	/// Whether the order is assigned and still in flight.
	pub fn is_active(&self) -> bool {
		matches!(
			self.lifecycle(),
			LifecycleState::PrepAssigned | LifecycleState::Picked | LifecycleState::OnRoute
		)
	}

	/// Sets the status and stamps the matching transition timestamp.
	pub fn apply_status(&mut self, status: OrderStatus, at: u64) {
		self.status = status;
		let slot = match status {
			OrderStatus::Prep => return,
			OrderStatus::Picked => &mut self.picked_at,
			OrderStatus::OnRoute => &mut self.on_route_at,
			OrderStatus::Delivered => &mut self.delivered_at,
			OrderStatus::Cancelled => &mut self.cancelled_at,
		};
		slot.get_or_insert(at);
	}

	/// Records the assignment of a partner.
	pub fn apply_assignment(&mut self, partner_id: &str, at: u64) {
		self.assigned_partner = Some(partner_id.to_string());
		self.assigned_at.get_or_insert(at);
	}

	/// Minutes between creation and delivery, when both are known.
	pub fn delivery_minutes(&self) -> Option<f64> {
		let delivered_at = self.delivered_at?;
		if self.created_at == 0 || delivered_at < self.created_at {
			return None;
		}
		Some((delivered_at - self.created_at) as f64 / 60.0)
	}
}

/// Payload for creating an order through the manager-side authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
	/// Optional human readable code; the authority generates one when absent.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
	pub customer: Customer,
	pub items: Vec<LineItem>,
}

impl NewOrder {
	/// Sum of all line subtotals.
	pub fn total_amount(&self) -> Decimal {
		self.items.iter().map(LineItem::subtotal).sum()
	}
}

/// An assignment intent issued by a partner client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentIntent {
	pub order_id: OrderId,
	pub partner_id: PartnerId,
	/// Client generated idempotency token.
	pub token: String,
}

/// Authoritative confirmation of a successful assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentConfirmation {
	pub order_id: OrderId,
	pub partner_id: PartnerId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
	pub assigned_at: u64,
	/// The order as the authority holds it after the swap, when provided.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub order: Option<Order>,
}


#[cfg(test)]
mod tests {
	use super::fixtures::order;
	use super::*;

	#[test]
	fn test_rank_rejects_regression() {
		assert!(OrderStatus::accepts_update(OrderStatus::Picked, OrderStatus::OnRoute));
		assert!(OrderStatus::accepts_update(OrderStatus::Picked, OrderStatus::Picked));
		assert!(!OrderStatus::accepts_update(OrderStatus::OnRoute, OrderStatus::Prep));
		assert!(!OrderStatus::accepts_update(OrderStatus::Delivered, OrderStatus::OnRoute));
	}

	#[test]
	fn test_cancel_overrides_until_delivered() {
		assert!(OrderStatus::accepts_update(OrderStatus::OnRoute, OrderStatus::Cancelled));
		assert!(!OrderStatus::accepts_update(OrderStatus::Delivered, OrderStatus::Cancelled));
		assert!(!OrderStatus::accepts_update(OrderStatus::Cancelled, OrderStatus::Delivered));
		assert!(OrderStatus::accepts_update(OrderStatus::Cancelled, OrderStatus::Cancelled));
	}

	#[test]
	fn test_lifecycle_transitions() {
		use LifecycleState::*;

		assert!(PrepAssigned.can_transition_to(OrderStatus::Picked));
		assert!(Picked.can_transition_to(OrderStatus::OnRoute));
		assert!(OnRoute.can_transition_to(OrderStatus::Delivered));
		assert!(PrepUnassigned.can_transition_to(OrderStatus::Cancelled));

		assert!(!PrepUnassigned.can_transition_to(OrderStatus::Picked));
		assert!(!PrepUnassigned.can_transition_to(OrderStatus::Delivered));
		assert!(!PrepAssigned.can_transition_to(OrderStatus::OnRoute));
		assert!(!Delivered.can_transition_to(OrderStatus::Cancelled));
		assert!(!Cancelled.can_transition_to(OrderStatus::Prep));
	}

	#[test]
	fn test_check_transition_reports_states() {
		let err = LifecycleState::PrepUnassigned
			.check_transition(OrderStatus::Delivered)
			.unwrap_err();
		assert_eq!(err.from, LifecycleState::PrepUnassigned);
		assert_eq!(err.to, OrderStatus::Delivered);
		assert_eq!(
			err.to_string(),
			"Invalid transition from prep-unassigned to delivered"
		);
	}

	#[test]
	fn test_lifecycle_and_pools() {
		let mut o = order("o1", OrderStatus::Prep);
		assert!(o.is_available());
		assert!(!o.is_active());

		o.apply_assignment("p1", 1_100);
		assert_eq!(o.lifecycle(), LifecycleState::PrepAssigned);
		assert!(!o.is_available());
		assert!(o.is_active());

		o.apply_status(OrderStatus::Delivered, 2_800);
		assert!(!o.is_active());
		assert_eq!(o.delivered_at, Some(2_800));
		assert_eq!(o.delivery_minutes(), Some(30.0));
	}

	#[test]
	fn test_apply_status_keeps_first_timestamp() {
		let mut o = order("o1", OrderStatus::Prep);
		o.apply_status(OrderStatus::Picked, 1_200);
		o.apply_status(OrderStatus::Picked, 1_500);
		assert_eq!(o.picked_at, Some(1_200));
	}

	#[test]
	fn test_status_wire_format() {
		let json = serde_json::to_string(&OrderStatus::OnRoute).unwrap();
		assert_eq!(json, "\"on_route\"");
		let parsed: OrderStatus = serde_json::from_str("\"cancelled\"").unwrap();
		assert_eq!(parsed, OrderStatus::Cancelled);
	}

	#[test]
	fn test_new_order_total() {
		let new_order = NewOrder {
			code: None,
			customer: Customer::default(),
			items: vec![
				LineItem {
					name: "Soup".to_string(),
					quantity: 3,
					unit_price: Decimal::new(400, 2),
				},
				LineItem {
					name: "Bread".to_string(),
					quantity: 1,
					unit_price: Decimal::new(150, 2),
				},
			],
		};
		assert_eq!(new_order.total_amount(), Decimal::new(1350, 2));
	}
}
