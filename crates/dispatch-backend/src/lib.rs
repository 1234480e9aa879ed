//! Backend access module for the dispatch sync engine.
//!
//! The backend is the single authority for order state and partner
//! assignment. This crate abstracts how it is reached: an `http`
//! implementation talks JSON to a remote service, a `memory` implementation
//! runs the same contract in-process. [`BackendService`] wraps the primary
//! implementation with the client's credentials and retries transient
//! failures with bounded exponential backoff.

use async_trait::async_trait;
use dispatch_types::{
	AssignmentConfirmation, AssignmentIntent, ChannelEvent, ConfigSchema, Credentials,
	ImplementationRegistry, NewOrder, Order, OrderId, OrderStatus, Partner,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod implementations {
	pub mod http;
	pub mod memory;
}

/// Errors that can occur while talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
	/// Transport failure or unavailable backend; safe to retry.
	#[error("Network error: {0}")]
	Network(String),
	/// Credentials were refused.
	#[error("Authentication failed: {0}")]
	Auth(String),
	/// Compare-and-swap lost: the order already has a partner.
	#[error("Order {0} is already assigned")]
	AlreadyAssigned(OrderId),
	/// The requested lifecycle move is not allowed.
	#[error("Invalid transition: {0}")]
	InvalidTransition(String),
	#[error("Not found: {0}")]
	NotFound(String),
	/// The request was malformed or violates a business rule.
	#[error("Validation error: {0}")]
	Validation(String),
	/// The backend answered with something this client cannot read.
	#[error("Protocol error: {0}")]
	Protocol(String),
}

impl BackendError {
	/// Only network failures are retried.
	pub fn is_transient(&self) -> bool {
		matches!(self, BackendError::Network(_))
	}
}

/// Result of an authoritative pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
	pub orders: Vec<Order>,
	#[serde(default)]
	pub partners: Vec<Partner>,
	/// True when `orders` is the complete set, not a delta since a timestamp.
	pub full: bool,
	/// Authority clock at the time of the pull, unix seconds.
	pub server_time: u64,
}

/// Interface every backend implementation provides.
#[async_trait]
pub trait BackendInterface: Send + Sync {
	/// Returns the configuration schema for this implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Fetches orders changed since `since`, or all orders when `None`.
	async fn pull_orders(
		&self,
		credentials: &Credentials,
		since: Option<u64>,
	) -> Result<PullResponse, BackendError>;

	/// Creates an order on the authority.
	async fn create_order(
		&self,
		credentials: &Credentials,
		order: &NewOrder,
	) -> Result<Order, BackendError>;

	/// Moves an order to `status`. Idempotent on `(order_id, status)`.
	async fn transition(
		&self,
		credentials: &Credentials,
		order_id: &str,
		status: OrderStatus,
	) -> Result<Order, BackendError>;

	/// Forwards an assignment intent; the authority performs the swap.
	async fn assign(
		&self,
		credentials: &Credentials,
		intent: &AssignmentIntent,
	) -> Result<AssignmentConfirmation, BackendError>;

	/// In-process event feed, for implementations that have one.
	fn event_feed(&self) -> Option<broadcast::Receiver<ChannelEvent>> {
		None
	}
}

/// Type alias for backend factory functions.
pub type BackendFactory = fn(&toml::Value) -> Result<Box<dyn BackendInterface>, BackendError>;

/// Registry trait for backend implementations.
pub trait BackendRegistry: ImplementationRegistry<Factory = BackendFactory> {}

/// Get all registered backend implementations as (name, factory) pairs.
pub fn get_all_implementations() -> Vec<(&'static str, BackendFactory)> {
	use implementations::{http, memory};

	vec![
		(http::Registry::NAME, http::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Total attempts including the first one.
	pub max_attempts: u32,
	pub initial_interval: Duration,
	pub max_interval: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			initial_interval: Duration::from_millis(200),
			max_interval: Duration::from_secs(2),
		}
	}
}

impl RetryPolicy {
	fn backoff(&self) -> backoff::ExponentialBackoff {
		backoff::ExponentialBackoffBuilder::new()
			.with_initial_interval(self.initial_interval)
			.with_max_interval(self.max_interval)
			.with_max_elapsed_time(None)
			.build()
	}
}

/// Primary backend plus the client's cached credentials.
///
/// An authentication failure invalidates the cached credentials; every later
/// call fails fast with [`BackendError::Auth`] until new ones are installed.
pub struct BackendService {
	backend: Box<dyn BackendInterface>,
	credentials: RwLock<Option<Credentials>>,
	retry: RetryPolicy,
}

impl BackendService {
	pub fn new(backend: Box<dyn BackendInterface>, credentials: Credentials, retry: RetryPolicy) -> Self {
		Self {
			backend,
			credentials: RwLock::new(Some(credentials)),
			retry,
		}
	}

	/// Cached credentials, if still valid.
	pub fn credentials(&self) -> Option<Credentials> {
		self.credentials.read().ok().and_then(|guard| guard.clone())
	}

	/// Installs new credentials after an authentication failure.
	pub fn set_credentials(&self, credentials: Credentials) {
		if let Ok(mut guard) = self.credentials.write() {
			*guard = Some(credentials);
		}
	}

	/// Drops the cached credentials.
	pub fn invalidate_credentials(&self) {
		if let Ok(mut guard) = self.credentials.write() {
			if guard.take().is_some() {
				tracing::warn!("Backend credentials invalidated");
			}
		}
	}

	pub fn event_feed(&self) -> Option<broadcast::Receiver<ChannelEvent>> {
		self.backend.event_feed()
	}

	pub async fn pull_orders(&self, since: Option<u64>) -> Result<PullResponse, BackendError> {
		let credentials = self.require_credentials()?;
		self.with_retry("pull_orders", || {
			self.backend.pull_orders(&credentials, since)
		})
		.await
	}

	pub async fn create_order(&self, order: &NewOrder) -> Result<Order, BackendError> {
		let credentials = self.require_credentials()?;
		self.with_retry("create_order", || {
			self.backend.create_order(&credentials, order)
		})
		.await
	}

	pub async fn transition(
		&self,
		order_id: &str,
		status: OrderStatus,
	) -> Result<Order, BackendError> {
		let credentials = self.require_credentials()?;
		self.with_retry("transition", || {
			self.backend.transition(&credentials, order_id, status)
		})
		.await
	}

	/// Forwards an intent. Retries reuse the intent's token so the authority
	/// can recognise them.
	pub async fn assign(
		&self,
		intent: &AssignmentIntent,
	) -> Result<AssignmentConfirmation, BackendError> {
		let credentials = self.require_credentials()?;
		self.with_retry("assign", || self.backend.assign(&credentials, intent))
			.await
	}

	fn require_credentials(&self) -> Result<Credentials, BackendError> {
		self.credentials()
			.ok_or_else(|| BackendError::Auth("credentials invalidated".into()))
	}

	async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, BackendError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, BackendError>>,
	{
		let max_attempts = self.retry.max_attempts.max(1);
		let mut attempt = 0u32;

		let result = backoff::future::retry(self.retry.backoff(), || {
			attempt += 1;
			let current = attempt;
			let fut = call();
			async move {
				match fut.await {
					Ok(value) => Ok(value),
					Err(e) if e.is_transient() && current < max_attempts => {
						tracing::warn!(operation, attempt = current, error = %e, "Backend call failed, retrying");
						Err(backoff::Error::transient(e))
					},
					Err(e) => Err(backoff::Error::permanent(e)),
				}
			}
		})
		.await;

		if let Err(BackendError::Auth(_)) = &result {
			self.invalidate_credentials();
		}
		result
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_types::{Schema, ValidationError};
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::Arc;

	struct NoSchema;

	impl ConfigSchema for NoSchema {
		fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
			Schema::new(vec![], vec![]).validate(config)
		}
	}

	/// Fails `failures` times with the given error, then succeeds.
	struct Flaky {
		calls: Arc<AtomicU32>,
		failures: u32,
		error: BackendError,
	}

	#[async_trait]
	impl BackendInterface for Flaky {
		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			Box::new(NoSchema)
		}

		async fn pull_orders(
			&self,
			_credentials: &Credentials,
			_since: Option<u64>,
		) -> Result<PullResponse, BackendError> {
			let call = self.calls.fetch_add(1, Ordering::SeqCst);
			if call < self.failures {
				return Err(self.error.clone());
			}
			Ok(PullResponse {
				orders: vec![],
				partners: vec![],
				full: true,
				server_time: 1,
			})
		}

		async fn create_order(
			&self,
			_credentials: &Credentials,
			_order: &NewOrder,
		) -> Result<Order, BackendError> {
			Err(BackendError::Validation("unsupported".into()))
		}

		async fn transition(
			&self,
			_credentials: &Credentials,
			order_id: &str,
			_status: OrderStatus,
		) -> Result<Order, BackendError> {
			Err(BackendError::NotFound(order_id.to_string()))
		}

		async fn assign(
			&self,
			_credentials: &Credentials,
			intent: &AssignmentIntent,
		) -> Result<AssignmentConfirmation, BackendError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			Err(BackendError::AlreadyAssigned(intent.order_id.clone()))
		}
	}

	fn service(failures: u32, error: BackendError) -> (BackendService, Arc<AtomicU32>) {
		let calls = Arc::new(AtomicU32::new(0));
		let backend = Flaky {
			calls: calls.clone(),
			failures,
			error,
		};
		let policy = RetryPolicy {
			max_attempts: 3,
			initial_interval: Duration::from_millis(10),
			max_interval: Duration::from_millis(20),
		};
		(
			BackendService::new(Box::new(backend), Credentials::new("c1", "t"), policy),
			calls,
		)
	}

	#[tokio::test(start_paused = true)]
	async fn test_network_errors_are_retried() {
		let (service, calls) = service(2, BackendError::Network("reset".into()));
		assert!(service.pull_orders(None).await.is_ok());
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_retries_are_bounded() {
		let (service, calls) = service(10, BackendError::Network("down".into()));
		let err = service.pull_orders(None).await.unwrap_err();
		assert!(err.is_transient());
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn test_business_errors_are_not_retried() {
		let (service, calls) = service(0, BackendError::Network("unused".into()));
		let intent = AssignmentIntent {
			order_id: "o1".into(),
			partner_id: "p1".into(),
			token: "t1".into(),
		};
		let err = service.assign(&intent).await.unwrap_err();
		assert_eq!(err, BackendError::AlreadyAssigned("o1".into()));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_auth_failure_invalidates_credentials() {
		let (service, calls) = service(1, BackendError::Auth("expired".into()));
		assert!(matches!(
			service.pull_orders(None).await,
			Err(BackendError::Auth(_))
		));
		assert!(service.credentials().is_none());

		// Fails fast without reaching the backend.
		assert!(matches!(
			service.pull_orders(None).await,
			Err(BackendError::Auth(_))
		));
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		service.set_credentials(Credentials::new("c1", "fresh"));
		assert!(service.pull_orders(None).await.is_ok());
	}
}
