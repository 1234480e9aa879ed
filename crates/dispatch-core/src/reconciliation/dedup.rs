//! Trailing-window deduplication of channel events.

use dispatch_types::{ChannelEvent, EventPayload, OrderId, OrderStatus, PartnerId};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Identity of an event for deduplication purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
	Created(OrderId),
	Status(OrderId, OrderStatus),
	Assignment(OrderId, PartnerId),
	PartnerFreed(PartnerId, Option<OrderId>),
}

impl DedupKey {
	pub fn of(event: &ChannelEvent) -> Self {
		match &event.payload {
			EventPayload::OrderCreated { order } => DedupKey::Created(order.id.clone()),
			EventPayload::OrderAssigned {
				order_id,
				partner_id,
				..
			} => DedupKey::Assignment(order_id.clone(), partner_id.clone()),
			EventPayload::OrderStatusChanged { order_id, status } => {
				DedupKey::Status(order_id.clone(), *status)
			},
			EventPayload::OrderDelivered { order_id } => {
				DedupKey::Status(order_id.clone(), OrderStatus::Delivered)
			},
			EventPayload::PartnerAvailable {
				partner_id,
				order_id,
			} => DedupKey::PartnerFreed(partner_id.clone(), order_id.clone()),
		}
	}
}

/// Remembers event keys for a fixed window.
#[derive(Debug)]
pub struct DedupWindow {
	window: Duration,
	seen: HashMap<DedupKey, Instant>,
	expiry: VecDeque<(Instant, DedupKey)>,
}

impl DedupWindow {
	pub fn new(window: Duration) -> Self {
		Self {
			window,
			seen: HashMap::new(),
			expiry: VecDeque::new(),
		}
	}

	/// Records `key` and returns true unless it was seen within the window.
	pub fn admit(&mut self, key: DedupKey, now: Instant) -> bool {
		self.prune(now);
		if self.seen.contains_key(&key) {
			return false;
		}
		self.seen.insert(key.clone(), now);
		self.expiry.push_back((now, key));
		true
	}

	pub fn len(&self) -> usize {
		self.seen.len()
	}

	pub fn is_empty(&self) -> bool {
		self.seen.is_empty()
	}

	fn prune(&mut self, now: Instant) {
		while let Some((at, _)) = self.expiry.front() {
			if now.saturating_duration_since(*at) < self.window {
				break;
			}
			if let Some((at, key)) = self.expiry.pop_front() {
				if self.seen.get(&key) == Some(&at) {
					self.seen.remove(&key);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn test_replay_inside_window_is_dropped() {
		let mut window = DedupWindow::new(Duration::from_secs(5));
		let key = DedupKey::Status("o1".into(), OrderStatus::Picked);

		assert!(window.admit(key.clone(), Instant::now()));
		tokio::time::advance(Duration::from_secs(2)).await;
		assert!(!window.admit(key.clone(), Instant::now()));
		assert!(window.admit(
			DedupKey::Status("o1".into(), OrderStatus::OnRoute),
			Instant::now()
		));

		tokio::time::advance(Duration::from_secs(4)).await;
		assert!(window.admit(key, Instant::now()));
		assert_eq!(window.len(), 2);
	}
}
