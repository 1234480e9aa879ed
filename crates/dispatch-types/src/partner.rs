//! Delivery partner records.

use crate::{OrderId, PartnerId};
use serde::{Deserialize, Serialize};

/// Availability of a delivery partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
	Available,
	Busy,
	Offline,
}

/// A delivery partner as seen by the engine.
///
/// Registration data (name, contact) is owned by an external collaborator;
/// the engine only touches `availability` and `current_order`, and keeps
/// `current_order` set exactly when the partner is busy with that order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
	pub id: PartnerId,
	pub name: String,
	#[serde(default)]
	pub contact: String,
	pub availability: Availability,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub current_order: Option<OrderId>,
}

impl Partner {
	/// Creates an available partner with no current order.
	pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			contact: String::new(),
			availability: Availability::Available,
			current_order: None,
		}
	}

	/// Marks the partner busy with the given order.
	pub fn occupy(&mut self, order_id: &str) {
		self.availability = Availability::Busy;
		self.current_order = Some(order_id.to_string());
	}

	/// Releases the partner if it is currently holding `order_id`.
	///
	/// Returns whether anything changed.
	pub fn release(&mut self, order_id: &str) -> bool {
		if self.current_order.as_deref() != Some(order_id) {
			return false;
		}
		self.current_order = None;
		self.availability = Availability::Available;
		true
	}

	pub fn is_busy(&self) -> bool {
		self.availability == Availability::Busy
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_occupy_and_release() {
		let mut partner = Partner::new("p1", "Bruno");
		partner.occupy("o1");
		assert!(partner.is_busy());
		assert_eq!(partner.current_order.as_deref(), Some("o1"));

		assert!(!partner.release("o2"));
		assert!(partner.is_busy());

		assert!(partner.release("o1"));
		assert_eq!(partner.availability, Availability::Available);
		assert!(partner.current_order.is_none());
	}
}
