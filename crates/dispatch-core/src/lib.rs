//! Core synchronization engine for dispatch clients.
//!
//! This crate owns the canonical order store of one client and keeps it
//! consistent with the authoritative backend. Channel events and periodic
//! pulls are folded in by the reconciliation engine, partner claims go
//! through the assignment coordinator, and derived dashboard metrics are
//! recomputed after every change. All of it runs on a single writer task,
//! [`SyncEngine`], which consumers drive through an [`EngineHandle`].

use dispatch_backend::BackendError;
use dispatch_types::OrderId;
use thiserror::Error;

pub mod assignment;
pub mod builder;
pub mod engine;
pub mod metrics;
pub mod reconciliation;
pub mod store;

pub use assignment::{AssignmentCoordinator, ConfirmationOutcome, OverlayView, PendingOverlay};
pub use builder::{BuilderError, SyncBuilder, SyncFactories};
pub use engine::event_bus::EventBus;
pub use engine::{EngineHandle, Selection, SyncEngine};
pub use metrics::MetricsAggregator;
pub use reconciliation::{EventOutcome, ReconciliationEngine};
pub use store::{OrderStateStore, StoreView, UpsertOutcome};

/// Errors surfaced at the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
	/// The backend could not be reached, after retries.
	#[error("Network error: {0}")]
	Network(String),
	/// Credentials were refused and have been invalidated.
	#[error("Authentication failed: {0}")]
	Auth(String),
	/// Another partner won the assignment.
	#[error("Order {0} is already assigned")]
	AlreadyAssigned(OrderId),
	#[error("Invalid transition: {0}")]
	InvalidTransition(String),
	#[error("Not found: {0}")]
	NotFound(String),
	/// The request was rejected before reaching the backend.
	#[error("Validation error: {0}")]
	Validation(String),
	/// The engine task is no longer running.
	#[error("Engine stopped")]
	EngineStopped,
}

impl From<BackendError> for SyncError {
	fn from(err: BackendError) -> Self {
		match err {
			BackendError::Network(msg) => SyncError::Network(msg),
			BackendError::Auth(msg) => SyncError::Auth(msg),
			BackendError::AlreadyAssigned(order_id) => SyncError::AlreadyAssigned(order_id),
			BackendError::InvalidTransition(msg) => SyncError::InvalidTransition(msg),
			BackendError::NotFound(msg) => SyncError::NotFound(msg),
			BackendError::Validation(msg) => SyncError::Validation(msg),
			// An unreadable answer is retried by the next pull like a network fault.
			BackendError::Protocol(msg) => SyncError::Network(msg),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_backend_errors_keep_their_category() {
		let cases = [
			(BackendError::Network("down".into()), SyncError::Network("down".into())),
			(BackendError::Auth("refused".into()), SyncError::Auth("refused".into())),
			(
				BackendError::AlreadyAssigned("o1".into()),
				SyncError::AlreadyAssigned("o1".into()),
			),
			(
				BackendError::InvalidTransition("picked".into()),
				SyncError::InvalidTransition("picked".into()),
			),
			(BackendError::NotFound("o1".into()), SyncError::NotFound("o1".into())),
			(BackendError::Validation("busy".into()), SyncError::Validation("busy".into())),
			(BackendError::Protocol("bad json".into()), SyncError::Network("bad json".into())),
		];
		for (backend, expected) in cases {
			assert_eq!(SyncError::from(backend), expected);
		}
	}
}
