//! Assignment coordination and optimistic overlays.
//!
//! A partner claims an order by issuing an intent carrying an idempotency
//! token. The backend performs the compare-and-swap; this side only prepares
//! intents, keeps a pending overlay per token while the intent is in flight,
//! and applies confirmations. The broadcast `order_assigned` event and the
//! backend's direct response both land in [`AssignmentCoordinator::apply_confirmation`],
//! so whichever arrives second is a no-op.
//!
//! Overlays never touch the store. They are dropped on confirmation, on
//! rejection, or once the overlay timeout elapses.

use crate::store::{OrderStateStore, RejectReason, UpsertOutcome};
use crate::SyncError;
use dispatch_types::{
	new_token, truncate_id, AssignmentConfirmation, AssignmentIntent, OrderId, OrderStatus,
	PartnerId,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// An intent forwarded to the backend and not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOverlay {
	pub order_id: OrderId,
	pub partner_id: PartnerId,
	pub token: String,
	pub issued_at: Instant,
}

/// Consumer-facing copy of a pending overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayView {
	pub order_id: OrderId,
	pub partner_id: PartnerId,
	pub token: String,
	pub age_ms: u64,
}

/// Result of applying an assignment confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
	/// The store now records the assignment.
	Applied,
	/// The same partner was already recorded.
	Duplicate,
	/// A different partner is already recorded; the confirmation is ignored.
	Conflict { stored: PartnerId },
	/// The store refused the update, e.g. the order was cancelled meanwhile.
	Rejected(RejectReason),
	/// Nothing is known about the order and the confirmation carries no record.
	UnknownOrder,
}

/// Prepares intents, tracks overlays and applies confirmations.
#[derive(Debug)]
pub struct AssignmentCoordinator {
	/// Partner this client acts for; `None` for manager clients.
	identity: Option<PartnerId>,
	overlay_timeout: Duration,
	overlays: HashMap<String, PendingOverlay>,
}

impl AssignmentCoordinator {
	pub fn new(identity: Option<PartnerId>, overlay_timeout: Duration) -> Self {
		Self {
			identity,
			overlay_timeout,
			overlays: HashMap::new(),
		}
	}

	pub fn identity(&self) -> Option<&str> {
		self.identity.as_deref()
	}

	/// Validates a claim and builds the intent to forward.
	///
	/// A pending overlay for the same order and partner lends its token, so a
	/// repeated click is recognised by the backend as the same intent.
	pub fn prepare_intent(
		&self,
		order_id: &str,
		partner_id: &str,
		token: Option<String>,
	) -> Result<AssignmentIntent, SyncError> {
		if order_id.trim().is_empty() {
			return Err(SyncError::Validation("order id is empty".into()));
		}
		if partner_id.trim().is_empty() {
			return Err(SyncError::Validation("partner id is empty".into()));
		}
		if let Some(identity) = &self.identity {
			if identity != partner_id {
				return Err(SyncError::Validation(format!(
					"client acts for partner {}, not {}",
					identity, partner_id
				)));
			}
		}
		if matches!(&token, Some(t) if t.trim().is_empty()) {
			return Err(SyncError::Validation("token is empty".into()));
		}

		let token = token
			.or_else(|| {
				self.overlays
					.values()
					.find(|o| o.order_id == order_id && o.partner_id == partner_id)
					.map(|o| o.token.clone())
			})
			.unwrap_or_else(new_token);

		Ok(AssignmentIntent {
			order_id: order_id.to_string(),
			partner_id: partner_id.to_string(),
			token,
		})
	}

	/// Opens or refreshes the overlay for a forwarded intent.
	///
	/// Returns false when an overlay for the token was already pending.
	pub fn begin(&mut self, intent: &AssignmentIntent, now: Instant) -> bool {
		let fresh = !self.overlays.contains_key(&intent.token);
		self.overlays.insert(
			intent.token.clone(),
			PendingOverlay {
				order_id: intent.order_id.clone(),
				partner_id: intent.partner_id.clone(),
				token: intent.token.clone(),
				issued_at: now,
			},
		);
		fresh
	}

	pub fn is_pending(&self, token: &str) -> bool {
		self.overlays.contains_key(token)
	}

	/// Drops the overlay of a refused intent.
	pub fn reject(&mut self, token: &str) -> Option<PendingOverlay> {
		self.overlays.remove(token)
	}

	/// Applies an authoritative confirmation. Idempotent.
	pub fn apply_confirmation(
		&mut self,
		store: &mut OrderStateStore,
		confirmation: &AssignmentConfirmation,
	) -> ConfirmationOutcome {
		self.settle(confirmation);

		let order_id = &confirmation.order_id;
		let partner_id = &confirmation.partner_id;
		let Some(stored) = store.get(order_id) else {
			return match &confirmation.order {
				Some(order) if order.assigned_partner.as_deref() == Some(partner_id.as_str()) => {
					store.upsert(order.clone());
					store.set_partner_busy(partner_id, order_id);
					ConfirmationOutcome::Applied
				},
				_ => ConfirmationOutcome::UnknownOrder,
			};
		};

		match stored.assigned_partner.as_deref() {
			Some(current) if current == partner_id => {
				store.set_partner_busy(partner_id, order_id);
				return ConfirmationOutcome::Duplicate;
			},
			Some(current) => {
				tracing::warn!(
					order_id = %truncate_id(order_id),
					stored = %current,
					confirmed = %partner_id,
					"Ignoring conflicting assignment confirmation"
				);
				return ConfirmationOutcome::Conflict {
					stored: current.to_string(),
				};
			},
			None => {},
		}
		// Assignment is a PREP-stage event; it cannot reopen a closed order.
		if stored.status.is_terminal() {
			return ConfirmationOutcome::Rejected(RejectReason::StaleStatus {
				stored: stored.status,
				incoming: OrderStatus::Prep,
			});
		}

		let candidate = match &confirmation.order {
			Some(order) if order.assigned_partner.as_deref() == Some(partner_id.as_str()) => {
				order.clone()
			},
			_ => {
				let mut order = stored.clone();
				order.apply_assignment(partner_id, confirmation.assigned_at);
				order
			},
		};

		match store.upsert(candidate) {
			UpsertOutcome::Inserted | UpsertOutcome::Updated => {
				store.set_partner_busy(partner_id, order_id);
				tracing::info!(
					order_id = %truncate_id(order_id),
					partner_id = %partner_id,
					"Assignment confirmed"
				);
				ConfirmationOutcome::Applied
			},
			UpsertOutcome::Unchanged => ConfirmationOutcome::Duplicate,
			UpsertOutcome::Rejected(reason) => {
				tracing::warn!(
					order_id = %truncate_id(order_id),
					reason = %reason,
					"Assignment confirmation rejected by store"
				);
				ConfirmationOutcome::Rejected(reason)
			},
		}
	}

	/// Removes and returns overlays older than the overlay timeout.
	pub fn expire(&mut self, now: Instant) -> Vec<PendingOverlay> {
		let timeout = self.overlay_timeout;
		let expired: Vec<String> = self
			.overlays
			.values()
			.filter(|o| now.saturating_duration_since(o.issued_at) >= timeout)
			.map(|o| o.token.clone())
			.collect();

		let mut removed: Vec<PendingOverlay> = expired
			.iter()
			.filter_map(|token| self.overlays.remove(token))
			.collect();
		removed.sort_by_key(|o| o.issued_at);
		removed
	}

	/// When the oldest overlay expires.
	pub fn next_deadline(&self) -> Option<Instant> {
		self.overlays
			.values()
			.map(|o| o.issued_at + self.overlay_timeout)
			.min()
	}

	/// Pending overlays, oldest first.
	pub fn overlays(&self, now: Instant) -> Vec<OverlayView> {
		let mut pending: Vec<&PendingOverlay> = self.overlays.values().collect();
		pending.sort_by_key(|o| o.issued_at);
		pending
			.into_iter()
			.map(|o| OverlayView {
				order_id: o.order_id.clone(),
				partner_id: o.partner_id.clone(),
				token: o.token.clone(),
				age_ms: now.saturating_duration_since(o.issued_at).as_millis() as u64,
			})
			.collect()
	}

	/// Checks a status transition against local state before forwarding it.
	///
	/// Unknown orders and same-status requests are left to the backend.
	pub fn check_transition(
		&self,
		store: &OrderStateStore,
		order_id: &str,
		target: OrderStatus,
	) -> Result<(), SyncError> {
		if order_id.trim().is_empty() {
			return Err(SyncError::Validation("order id is empty".into()));
		}
		let Some(order) = store.get(order_id) else {
			return Ok(());
		};

		if let (Some(identity), Some(holder)) = (&self.identity, &order.assigned_partner) {
			if identity != holder {
				return Err(SyncError::Validation(format!(
					"order {} is assigned to another partner",
					truncate_id(order_id)
				)));
			}
		}
		if order.status == target {
			return Ok(());
		}
		order
			.lifecycle()
			.check_transition(target)
			.map_err(|e| SyncError::InvalidTransition(e.to_string()))
	}

	/// Clears the overlays a confirmation resolves.
	fn settle(&mut self, confirmation: &AssignmentConfirmation) {
		if let Some(token) = &confirmation.token {
			self.overlays.remove(token);
		}
		self.overlays.retain(|_, o| {
			!(o.order_id == confirmation.order_id && o.partner_id == confirmation.partner_id)
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::fixtures::{assigned, order};
	use dispatch_types::Partner;

	fn coordinator(identity: Option<&str>) -> AssignmentCoordinator {
		AssignmentCoordinator::new(identity.map(String::from), Duration::from_secs(5))
	}

	fn confirmation(order_id: &str, partner_id: &str, token: &str) -> AssignmentConfirmation {
		AssignmentConfirmation {
			order_id: order_id.into(),
			partner_id: partner_id.into(),
			token: Some(token.into()),
			assigned_at: 1_200,
			order: None,
		}
	}

	fn store_with(order: dispatch_types::Order) -> OrderStateStore {
		let mut store = OrderStateStore::new();
		store.upsert_partner(Partner::new("p1", "Bruno"));
		store.upsert_partner(Partner::new("p2", "Carla"));
		store.upsert(order);
		store
	}

	#[test]
	fn test_prepare_intent_validation() {
		let partner = coordinator(Some("p1"));
		assert!(matches!(
			partner.prepare_intent("", "p1", None),
			Err(SyncError::Validation(_))
		));
		assert!(matches!(
			partner.prepare_intent("o1", " ", None),
			Err(SyncError::Validation(_))
		));
		assert!(matches!(
			partner.prepare_intent("o1", "p2", None),
			Err(SyncError::Validation(_))
		));

		let intent = partner.prepare_intent("o1", "p1", None).unwrap();
		assert!(!intent.token.is_empty());

		// Managers may act for any partner.
		assert!(coordinator(None).prepare_intent("o1", "p2", None).is_ok());
	}

	#[tokio::test(start_paused = true)]
	async fn test_pending_overlay_lends_its_token() {
		let mut coordinator = coordinator(Some("p1"));
		let first = coordinator.prepare_intent("o1", "p1", None).unwrap();
		assert!(coordinator.begin(&first, Instant::now()));

		let second = coordinator.prepare_intent("o1", "p1", None).unwrap();
		assert_eq!(second.token, first.token);
		assert!(!coordinator.begin(&second, Instant::now()));
		assert_eq!(coordinator.overlays(Instant::now()).len(), 1);
	}

	#[test]
	fn test_confirmation_is_idempotent() {
		let mut store = store_with(order("o1", OrderStatus::Prep));
		let mut coordinator = coordinator(Some("p1"));
		let confirmation = confirmation("o1", "p1", "t1");

		assert_eq!(
			coordinator.apply_confirmation(&mut store, &confirmation),
			ConfirmationOutcome::Applied
		);
		let revision = store.revision();
		assert!(store.available().is_empty());
		assert_eq!(store.partner("p1").unwrap().current_order.as_deref(), Some("o1"));

		assert_eq!(
			coordinator.apply_confirmation(&mut store, &confirmation),
			ConfirmationOutcome::Duplicate
		);
		assert_eq!(store.revision(), revision);
	}

	#[test]
	fn test_conflicting_confirmation_is_ignored() {
		let mut store = store_with(assigned("o1", "p1", OrderStatus::Prep));
		let mut coordinator = coordinator(None);

		let outcome = coordinator.apply_confirmation(&mut store, &confirmation("o1", "p2", "t2"));
		assert_eq!(
			outcome,
			ConfirmationOutcome::Conflict {
				stored: "p1".into()
			}
		);
		assert_eq!(store.get("o1").unwrap().assigned_partner.as_deref(), Some("p1"));
		assert!(!store.partner("p2").unwrap().is_busy());
	}

	#[test]
	fn test_confirmation_for_cancelled_order_is_rejected() {
		let mut store = store_with(order("o1", OrderStatus::Cancelled));
		let mut coordinator = coordinator(Some("p1"));
		let outcome = coordinator.apply_confirmation(&mut store, &confirmation("o1", "p1", "t1"));
		assert!(matches!(outcome, ConfirmationOutcome::Rejected(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn test_confirmation_clears_overlay() {
		let mut store = store_with(order("o1", OrderStatus::Prep));
		let mut coordinator = coordinator(Some("p1"));
		let intent = coordinator.prepare_intent("o1", "p1", None).unwrap();
		coordinator.begin(&intent, Instant::now());

		// The broadcast may carry no token; the (order, partner) pair still matches.
		let mut broadcast = confirmation("o1", "p1", "ignored");
		broadcast.token = None;
		coordinator.apply_confirmation(&mut store, &broadcast);
		assert!(!coordinator.is_pending(&intent.token));
		assert!(coordinator.next_deadline().is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn test_overlay_expires_after_timeout() {
		let mut coordinator = coordinator(Some("p1"));
		let intent = coordinator.prepare_intent("o1", "p1", None).unwrap();
		let started = Instant::now();
		coordinator.begin(&intent, started);
		assert_eq!(coordinator.next_deadline(), Some(started + Duration::from_secs(5)));

		tokio::time::advance(Duration::from_secs(4)).await;
		assert!(coordinator.expire(Instant::now()).is_empty());
		assert_eq!(coordinator.overlays(Instant::now())[0].age_ms, 4_000);

		tokio::time::advance(Duration::from_secs(1)).await;
		let expired = coordinator.expire(Instant::now());
		assert_eq!(expired.len(), 1);
		assert_eq!(expired[0].token, intent.token);
		assert!(coordinator.overlays(Instant::now()).is_empty());
	}

	#[test]
	fn test_check_transition() {
		let mut store = store_with(order("o1", OrderStatus::Prep));
		store.upsert(assigned("o2", "p2", OrderStatus::Picked));
		let partner = coordinator(Some("p1"));

		assert!(matches!(
			partner.check_transition(&store, "o1", OrderStatus::Delivered),
			Err(SyncError::InvalidTransition(_))
		));
		assert!(matches!(
			partner.check_transition(&store, "o2", OrderStatus::OnRoute),
			Err(SyncError::Validation(_))
		));
		assert!(coordinator(None)
			.check_transition(&store, "o2", OrderStatus::OnRoute)
			.is_ok());
		assert!(partner
			.check_transition(&store, "unknown", OrderStatus::Picked)
			.is_ok());
		assert!(partner
			.check_transition(&store, "o1", OrderStatus::Prep)
			.is_ok());
	}
}
