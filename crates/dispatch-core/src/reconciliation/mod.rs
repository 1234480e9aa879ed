//! Folds channel events and authoritative pulls into the order store.
//!
//! Events are best effort: they are deduplicated within a trailing window,
//! dropped when their per-order sequence went backwards, and never allowed to
//! fabricate a record. Pulls are authoritative for everything that was
//! already stored when the pull was issued: such orders are overwritten and
//! confirmed. Records that changed while the pull was in flight hold newer
//! confirmed state than the pull, so the pulled copy only goes through the
//! regular conflict policy. Unconfirmed orders a full pull no longer lists
//! are evicted once they have waited out the confirmation timeout.

pub mod dedup;

use crate::store::{OrderStateStore, UpsertOutcome};
use dedup::{DedupKey, DedupWindow};
use dispatch_backend::PullResponse;
use dispatch_types::{
	truncate_id, AssignmentConfirmation, ChannelEvent, EventPayload, OrderId, OrderStatus,
	ReconcileReport,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// What applying one channel event did.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
	/// A store update was attempted.
	Applied(UpsertOutcome),
	/// A partner record was touched; true when it changed.
	PartnerUpdated(bool),
	/// An assignment confirmation to route through the coordinator.
	Assignment(AssignmentConfirmation),
	/// Seen within the dedup window.
	Duplicate,
	/// Older than the newest sequence applied for the order.
	OutOfSequence { sequence: u64, highest: u64 },
	/// Written in a payload schema this build cannot read.
	UnsupportedSchema { version: u16 },
	/// The event cannot be applied against local state; pull instead.
	ResyncNeeded { order_id: OrderId, reason: String },
}

impl EventOutcome {
	pub fn changed_store(&self) -> bool {
		match self {
			EventOutcome::Applied(outcome) => outcome.is_change(),
			EventOutcome::PartnerUpdated(changed) => *changed,
			_ => false,
		}
	}
}

/// Event and pull reconciliation state.
#[derive(Debug)]
pub struct ReconciliationEngine {
	dedup: DedupWindow,
	sequences: HashMap<OrderId, u64>,
	confirmation_timeout: Duration,
}

impl ReconciliationEngine {
	pub fn new(dedup_window: Duration, confirmation_timeout: Duration) -> Self {
		Self {
			dedup: DedupWindow::new(dedup_window),
			sequences: HashMap::new(),
			confirmation_timeout,
		}
	}

	/// Applies one channel event to the store.
	pub fn apply_event(
		&mut self,
		store: &mut OrderStateStore,
		event: &ChannelEvent,
		now: Instant,
	) -> EventOutcome {
		if !event.is_supported_version() {
			return EventOutcome::UnsupportedSchema {
				version: event.schema_version,
			};
		}
		if let (Some(sequence), Some(order_id)) = (event.sequence, event.order_id()) {
			if let Some(&highest) = self.sequences.get(order_id) {
				if sequence < highest {
					return EventOutcome::OutOfSequence { sequence, highest };
				}
			}
		}
		if !self.dedup.admit(DedupKey::of(event), now) {
			return EventOutcome::Duplicate;
		}

		let outcome = match &event.payload {
			EventPayload::OrderCreated { order } => EventOutcome::Applied(store.upsert(order.clone())),
			EventPayload::OrderAssigned {
				order_id,
				partner_id,
				token,
				assigned_at,
			} => {
				if !store.contains(order_id) {
					return unknown(order_id);
				}
				EventOutcome::Assignment(AssignmentConfirmation {
					order_id: order_id.clone(),
					partner_id: partner_id.clone(),
					token: token.clone(),
					assigned_at: *assigned_at,
					order: None,
				})
			},
			EventPayload::OrderStatusChanged { order_id, status } => {
				apply_status(store, order_id, *status, event.timestamp)
			},
			EventPayload::OrderDelivered { order_id } => {
				apply_status(store, order_id, OrderStatus::Delivered, event.timestamp)
			},
			EventPayload::PartnerAvailable {
				partner_id,
				order_id,
			} => EventOutcome::PartnerUpdated(store.release_partner(partner_id, order_id.as_deref())),
		};

		if let (Some(sequence), Some(order_id)) = (event.sequence, event.order_id()) {
			let highest = self.sequences.entry(order_id.to_string()).or_insert(0);
			*highest = (*highest).max(sequence);
		}
		outcome
	}

	/// Folds an authoritative pull into the store.
	///
	/// `issued_at` is the store revision at the time the pull was sent.
	pub fn reconcile(
		&mut self,
		store: &mut OrderStateStore,
		pull: PullResponse,
		issued_at: u64,
		now: u64,
	) -> ReconcileReport {
		let mut report = ReconcileReport {
			pulled: pull.orders.len(),
			..Default::default()
		};

		for partner in pull.partners {
			if store.partner_changed_since(&partner.id, issued_at) {
				report.superseded += 1;
				continue;
			}
			store.upsert_partner(partner);
		}

		let mut present = HashSet::with_capacity(pull.orders.len());
		for order in pull.orders {
			present.insert(order.id.clone());
			let was_unconfirmed = store.unconfirmed_since(&order.id).is_some();
			if store.changed_since(&order.id, issued_at) {
				let order_id = order.id.clone();
				if let UpsertOutcome::Rejected(reason) = store.upsert(order) {
					tracing::debug!(
						order_id = %truncate_id(&order_id),
						reason = %reason,
						"Pulled copy is older than local state"
					);
				}
				store.confirm(&order_id);
				report.superseded += 1;
			} else if store.overwrite(order) {
				report.overwritten += 1;
			}
			if was_unconfirmed {
				report.confirmed += 1;
			}
		}

		if pull.full {
			let timeout = self.confirmation_timeout.as_secs();
			for order_id in store.order_ids() {
				if present.contains(&order_id) || store.changed_since(&order_id, issued_at) {
					continue;
				}
				match store.unconfirmed_since(&order_id) {
					Some(since) if now.saturating_sub(since) >= timeout => {
						tracing::info!(
							order_id = %truncate_id(&order_id),
							unconfirmed_for = now.saturating_sub(since),
							"Evicting stale unconfirmed order"
						);
						store.evict(&order_id);
						self.sequences.remove(&order_id);
						report.evicted += 1;
					},
					Some(_) => {},
					None => store.mark_unconfirmed(&order_id, now),
				}
			}
		}

		tracing::debug!(
			pulled = report.pulled,
			overwritten = report.overwritten,
			confirmed = report.confirmed,
			evicted = report.evicted,
			superseded = report.superseded,
			full = pull.full,
			"Reconciled pull"
		);
		report
	}
}

fn unknown(order_id: &str) -> EventOutcome {
	EventOutcome::ResyncNeeded {
		order_id: order_id.to_string(),
		reason: format!("event for unknown order {}", truncate_id(order_id)),
	}
}

fn apply_status(
	store: &mut OrderStateStore,
	order_id: &str,
	status: OrderStatus,
	at: u64,
) -> EventOutcome {
	let Some(stored) = store.get(order_id) else {
		return unknown(order_id);
	};

	// Leaving PREP needs a partner we have not heard about yet.
	if stored.assigned_partner.is_none()
		&& status != OrderStatus::Cancelled
		&& status != OrderStatus::Prep
		&& OrderStatus::accepts_update(stored.status, status)
	{
		return EventOutcome::ResyncNeeded {
			order_id: order_id.to_string(),
			reason: format!(
				"order {} moved to {} without a known assignment",
				truncate_id(order_id),
				status
			),
		};
	}

	let mut candidate = stored.clone();
	candidate.apply_status(status, at);
	let partner = candidate.assigned_partner.clone();
	let outcome = store.upsert(candidate);

	if outcome.is_change() && status.is_terminal() {
		if let Some(partner) = partner {
			store.release_partner(&partner, Some(order_id));
		}
	}
	EventOutcome::Applied(outcome)
}
