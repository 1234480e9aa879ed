//! Dashboard metrics derived from the order store.

use crate::store::OrderStateStore;
use dispatch_types::{DashboardMetrics, OrderId, OrderStatus};
use rust_decimal::Decimal;
use std::collections::HashSet;

/// Recomputes [`DashboardMetrics`] from scratch after every store change.
///
/// The only state carried between recomputes is the set of order ids seen,
/// so that orders evicted by a resync still count towards the total.
#[derive(Debug)]
pub struct MetricsAggregator {
	fallback_delivery_minutes: f64,
	seen: HashSet<OrderId>,
}

impl MetricsAggregator {
	pub fn new(fallback_delivery_minutes: f64) -> Self {
		Self {
			fallback_delivery_minutes,
			seen: HashSet::new(),
		}
	}

	pub fn recompute(&mut self, store: &OrderStateStore) -> DashboardMetrics {
		self.seen.extend(store.orders().map(|o| o.id.clone()));
		let total_orders = self.seen.len();
		if total_orders == 0 {
			return DashboardMetrics::empty(self.fallback_delivery_minutes);
		}

		let active_orders = store.orders().filter(|o| o.is_active()).count();
		let delivered: Vec<_> = store
			.orders()
			.filter(|o| o.status == OrderStatus::Delivered)
			.collect();
		let total_revenue: Decimal = delivered.iter().map(|o| o.total_amount).sum();
		let average_order_value = (total_revenue / Decimal::from(total_orders)).round_dp(2);
		let success_rate = delivered.len() as f64 / total_orders as f64 * 100.0;

		let durations: Vec<f64> = delivered.iter().filter_map(|o| o.delivery_minutes()).collect();
		let average_delivery_minutes = if durations.is_empty() {
			self.fallback_delivery_minutes
		} else {
			durations.iter().sum::<f64>() / durations.len() as f64
		};

		let (busy, partners) = store
			.partners()
			.fold((0usize, 0usize), |(busy, all), p| (busy + p.is_busy() as usize, all + 1));
		let partner_utilization = if partners == 0 {
			0.0
		} else {
			busy as f64 / partners as f64 * 100.0
		};

		DashboardMetrics {
			total_orders,
			active_orders,
			delivered_orders: delivered.len(),
			total_revenue,
			average_order_value,
			success_rate,
			average_delivery_minutes,
			partner_utilization,
		}
	}
}
