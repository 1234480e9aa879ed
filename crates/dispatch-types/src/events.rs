//! Event types for synchronization.
//!
//! Two families live here. [`ChannelEvent`] is the typed, versioned unit the
//! backend pushes over the sync channel; it never outlives processing.
//! [`EngineEvent`] is what the engine publishes on its internal bus so that
//! consumers can react to confirmations, rejections and resyncs.

use crate::{current_timestamp, Order, OrderId, OrderStatus, PartnerId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Payload schema version written by this crate.
pub const EVENT_SCHEMA_VERSION: u16 = 1;

fn default_schema_version() -> u16 {
	EVENT_SCHEMA_VERSION
}

/// Kinds of events delivered by the sync channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	OrderCreated,
	OrderAssigned,
	OrderStatusChanged,
	OrderDelivered,
	PartnerAvailable,
}

impl EventKind {
	/// Returns an iterator over all event kinds.
	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::OrderCreated,
			Self::OrderAssigned,
			Self::OrderStatusChanged,
			Self::OrderDelivered,
			Self::PartnerAvailable,
		]
		.into_iter()
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			EventKind::OrderCreated => "order_created",
			EventKind::OrderAssigned => "order_assigned",
			EventKind::OrderStatusChanged => "order_status_changed",
			EventKind::OrderDelivered => "order_delivered",
			EventKind::PartnerAvailable => "partner_available",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Payload of a channel event, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
	/// A manager created a new order.
	OrderCreated { order: Order },
	/// The authority confirmed an assignment.
	OrderAssigned {
		order_id: OrderId,
		partner_id: PartnerId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		token: Option<String>,
		assigned_at: u64,
	},
	/// The order moved to a new status.
	OrderStatusChanged {
		order_id: OrderId,
		status: OrderStatus,
	},
	/// The order was delivered.
	OrderDelivered { order_id: OrderId },
	/// A partner became available again, optionally releasing an order.
	PartnerAvailable {
		partner_id: PartnerId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		order_id: Option<OrderId>,
	},
}

/// A typed event as pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEvent {
	#[serde(default = "default_schema_version")]
	pub schema_version: u16,
	/// Per-order sequence number, when the backend provides one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sequence: Option<u64>,
	/// Unix seconds at which the change happened on the authority.
	pub timestamp: u64,
	#[serde(flatten)]
	pub payload: EventPayload,
}

impl ChannelEvent {
	/// Wraps a payload stamped with the current time and no sequence.
	pub fn new(payload: EventPayload) -> Self {
		Self {
			schema_version: EVENT_SCHEMA_VERSION,
			sequence: None,
			timestamp: current_timestamp(),
			payload,
		}
	}

	pub fn with_sequence(mut self, sequence: u64) -> Self {
		self.sequence = Some(sequence);
		self
	}

	pub fn kind(&self) -> EventKind {
		match &self.payload {
			EventPayload::OrderCreated { .. } => EventKind::OrderCreated,
			EventPayload::OrderAssigned { .. } => EventKind::OrderAssigned,
			EventPayload::OrderStatusChanged { .. } => EventKind::OrderStatusChanged,
			EventPayload::OrderDelivered { .. } => EventKind::OrderDelivered,
			EventPayload::PartnerAvailable { .. } => EventKind::PartnerAvailable,
		}
	}

	/// The order this event is about, if any.
	pub fn order_id(&self) -> Option<&str> {
		match &self.payload {
			EventPayload::OrderCreated { order } => Some(&order.id),
			EventPayload::OrderAssigned { order_id, .. }
			| EventPayload::OrderStatusChanged { order_id, .. }
			| EventPayload::OrderDelivered { order_id } => Some(order_id),
			EventPayload::PartnerAvailable { order_id, .. } => order_id.as_deref(),
		}
	}

	/// True when this build can interpret the payload schema.
	pub fn is_supported_version(&self) -> bool {
		(1..=EVENT_SCHEMA_VERSION).contains(&self.schema_version)
	}
}

/// Connection-level signals raised by a channel implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChannelStatus {
	Connected,
	Disconnected { reason: String },
	/// Events may have been missed; the consumer must pull.
	ResyncRequired,
	/// Credentials were refused; the channel will not retry.
	Unauthorized { reason: String },
}

/// Everything a channel implementation hands to the sync channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
	Event(ChannelEvent),
	Status(ChannelStatus),
}

/// Outcome counters of one authoritative pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
	/// Orders returned by the authority.
	pub pulled: usize,
	/// Local records replaced because they differed from the authority.
	pub overwritten: usize,
	/// Records promoted from unconfirmed to confirmed.
	pub confirmed: usize,
	/// Unconfirmed records dropped because the authority no longer knows them.
	pub evicted: usize,
	/// Pulled records older than a local change made while the pull ran.
	#[serde(default)]
	pub superseded: usize,
}

/// Events published on the engine's internal bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
	/// The canonical store changed.
	StoreChanged { revision: u64 },
	/// An assignment intent was forwarded and an overlay is shown.
	AssignmentPending {
		order_id: OrderId,
		partner_id: PartnerId,
		token: String,
	},
	/// An assignment was confirmed and applied.
	AssignmentAccepted {
		order_id: OrderId,
		partner_id: PartnerId,
		token: Option<String>,
	},
	/// An assignment intent was refused.
	AssignmentRejected {
		order_id: OrderId,
		token: String,
		reason: String,
	},
	/// An optimistic overlay timed out without confirmation.
	OverlayExpired { order_id: OrderId, token: String },
	/// A status transition was confirmed and applied.
	TransitionApplied {
		order_id: OrderId,
		status: OrderStatus,
	},
	/// A status transition was refused.
	TransitionRejected {
		order_id: OrderId,
		status: OrderStatus,
		reason: String,
	},
	/// A pull was folded into the store.
	Reconciled(ReconcileReport),
	/// The engine scheduled a full pull.
	ResyncRequested { reason: String },
	/// The channel changed connection state.
	Channel(ChannelStatus),
	/// The backend refused the credentials.
	AuthFailed { reason: String },
	/// The persisted cache was discarded.
	CacheReset { reason: String },
}
