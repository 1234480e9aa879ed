//! Dashboard metrics record.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Live counters derived from the order store.
///
/// Every field is a pure function of the current order and partner sets,
/// so recomputing without new events yields an identical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardMetrics {
	/// Distinct orders ever seen by this client.
	pub total_orders: usize,
	/// Assigned orders still in flight.
	pub active_orders: usize,
	pub delivered_orders: usize,
	/// Sum of totals over delivered orders.
	pub total_revenue: Decimal,
	/// Revenue divided by all orders seen.
	pub average_order_value: Decimal,
	/// Delivered over total, as a percentage.
	pub success_rate: f64,
	/// Mean creation-to-delivery time in minutes.
	pub average_delivery_minutes: f64,
	/// Busy partners over all partners, as a percentage.
	pub partner_utilization: f64,
}

impl DashboardMetrics {
	/// Metrics for a client that has not seen any order yet.
	pub fn empty(fallback_delivery_minutes: f64) -> Self {
		Self {
			total_orders: 0,
			active_orders: 0,
			delivered_orders: 0,
			total_revenue: Decimal::ZERO,
			average_order_value: Decimal::ZERO,
			success_rate: 100.0,
			average_delivery_minutes: fallback_delivery_minutes,
			partner_utilization: 0.0,
		}
	}
}
