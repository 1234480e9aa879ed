//! Real-time event channel for the dispatch sync engine.
//!
//! The channel is best effort: delivery is at-least-once, nothing is
//! buffered while disconnected, and a reconnect is announced with
//! [`ChannelStatus::ResyncRequired`] instead of a replay. Implementations
//! only push [`ChannelSignal`]s into a sender; [`SyncChannel`] fans them out
//! to typed subscriptions that are removed as soon as their [`Subscription`]
//! handle is dropped.

use async_trait::async_trait;
use dispatch_backend::BackendService;
use dispatch_types::{
	ChannelEvent, ChannelSignal, ChannelStatus, ConfigSchema, Credentials, EventKind,
	ImplementationRegistry,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Re-export implementations
pub mod implementations {
	pub mod local;
	pub mod stream;
}

/// Errors that can occur while operating the channel.
#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Connection error: {0}")]
	Connection(String),
	#[error("Already connected")]
	AlreadyConnected,
	#[error("Validation error: {0}")]
	Validation(String),
}

/// Interface every channel implementation provides.
#[async_trait]
pub trait ChannelInterface: Send + Sync {
	/// Returns the configuration schema for this implementation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Opens the channel. Events and connection changes are sent through
	/// `sender` until [`ChannelInterface::disconnect`] is called or the
	/// credentials are refused.
	async fn connect(
		&self,
		credentials: &Credentials,
		sender: mpsc::UnboundedSender<ChannelSignal>,
	) -> Result<(), ChannelError>;

	/// Closes the channel and stops any reconnect attempts.
	async fn disconnect(&self) -> Result<(), ChannelError>;
}

/// Type alias for channel factory functions.
///
/// The backend is passed so in-process implementations can attach to its
/// event feed.
pub type ChannelFactory =
	fn(&toml::Value, &BackendService) -> Result<Box<dyn ChannelInterface>, ChannelError>;

/// Registry trait for channel implementations.
pub trait ChannelRegistry: ImplementationRegistry<Factory = ChannelFactory> {}

/// Get all registered channel implementations as (name, factory) pairs.
pub fn get_all_implementations() -> Vec<(&'static str, ChannelFactory)> {
	use implementations::{local, stream};

	vec![
		(stream::Registry::NAME, stream::Registry::factory()),
		(local::Registry::NAME, local::Registry::factory()),
	]
}

type EventHandler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;
type StatusHandler = Arc<dyn Fn(&ChannelStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
	Event(EventKind),
	Status,
}

#[derive(Default)]
struct Handlers {
	next_id: u64,
	events: HashMap<EventKind, Vec<(u64, EventHandler)>>,
	status: Vec<(u64, StatusHandler)>,
}

impl Handlers {
	fn allocate(&mut self) -> u64 {
		self.next_id += 1;
		self.next_id
	}

	fn remove(&mut self, id: u64, slot: Slot) {
		match slot {
			Slot::Event(kind) => {
				if let Some(handlers) = self.events.get_mut(&kind) {
					handlers.retain(|(handler_id, _)| *handler_id != id);
				}
			},
			Slot::Status => self.status.retain(|(handler_id, _)| *handler_id != id),
		}
	}

	fn len(&self) -> usize {
		self.events.values().map(Vec::len).sum::<usize>() + self.status.len()
	}
}

/// Handle to a registered handler. Dropping it unsubscribes.
#[must_use = "dropping a subscription removes the handler"]
pub struct Subscription {
	id: u64,
	slot: Slot,
	handlers: Weak<Mutex<Handlers>>,
}

impl Subscription {
	/// Removes the handler now.
	pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(handlers) = self.handlers.upgrade() {
			if let Ok(mut handlers) = handlers.lock() {
				handlers.remove(self.id, self.slot);
			}
		}
	}
}

/// Typed fan-out over the primary channel implementation.
pub struct SyncChannel {
	implementation: Box<dyn ChannelInterface>,
	handlers: Arc<Mutex<Handlers>>,
	pump: Mutex<Option<JoinHandle<()>>>,
}

impl SyncChannel {
	pub fn new(implementation: Box<dyn ChannelInterface>) -> Self {
		Self {
			implementation,
			handlers: Arc::new(Mutex::new(Handlers::default())),
			pump: Mutex::new(None),
		}
	}

	/// Registers `handler` for events of `kind`.
	pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
	where
		F: Fn(&ChannelEvent) + Send + Sync + 'static,
	{
		let mut id = 0;
		if let Ok(mut handlers) = self.handlers.lock() {
			id = handlers.allocate();
			handlers
				.events
				.entry(kind)
				.or_default()
				.push((id, Arc::new(handler)));
		}
		Subscription {
			id,
			slot: Slot::Event(kind),
			handlers: Arc::downgrade(&self.handlers),
		}
	}

	/// Registers `handler` for connection status changes.
	pub fn subscribe_status<F>(&self, handler: F) -> Subscription
	where
		F: Fn(&ChannelStatus) + Send + Sync + 'static,
	{
		let mut id = 0;
		if let Ok(mut handlers) = self.handlers.lock() {
			id = handlers.allocate();
			handlers.status.push((id, Arc::new(handler)));
		}
		Subscription {
			id,
			slot: Slot::Status,
			handlers: Arc::downgrade(&self.handlers),
		}
	}

	/// Number of live subscriptions.
	pub fn subscriber_count(&self) -> usize {
		self.handlers.lock().map(|h| h.len()).unwrap_or(0)
	}

	/// Opens the channel and starts dispatching to subscribers.
	pub async fn connect(&self, credentials: &Credentials) -> Result<(), ChannelError> {
		let (sender, mut receiver) = mpsc::unbounded_channel();
		self.implementation.connect(credentials, sender).await?;

		let handlers = self.handlers.clone();
		let pump = tokio::spawn(async move {
			while let Some(signal) = receiver.recv().await {
				dispatch(&handlers, &signal);
			}
		});

		if let Ok(mut slot) = self.pump.lock() {
			if let Some(previous) = slot.replace(pump) {
				previous.abort();
			}
		}
		Ok(())
	}

	/// Closes the channel. Undelivered signals are dropped.
	pub async fn disconnect(&self) -> Result<(), ChannelError> {
		let result = self.implementation.disconnect().await;
		if let Ok(mut slot) = self.pump.lock() {
			if let Some(pump) = slot.take() {
				pump.abort();
			}
		}
		result
	}
}

impl Drop for SyncChannel {
	fn drop(&mut self) {
		if let Ok(mut slot) = self.pump.lock() {
			if let Some(pump) = slot.take() {
				pump.abort();
			}
		}
	}
}

fn dispatch(handlers: &Mutex<Handlers>, signal: &ChannelSignal) {
	// Handlers run outside the lock so they may (un)subscribe.
	match signal {
		ChannelSignal::Event(event) => {
			let targets: Vec<EventHandler> = match handlers.lock() {
				Ok(h) => h
					.events
					.get(&event.kind())
					.map(|list| list.iter().map(|(_, f)| f.clone()).collect())
					.unwrap_or_default(),
				Err(_) => return,
			};
			tracing::trace!(kind = %event.kind(), handlers = targets.len(), "Dispatching event");
			for handler in targets {
				handler(event);
			}
		},
		ChannelSignal::Status(status) => {
			tracing::debug!(?status, "Channel status changed");
			let targets: Vec<StatusHandler> = match handlers.lock() {
				Ok(h) => h.status.iter().map(|(_, f)| f.clone()).collect(),
				Err(_) => return,
			};
			for handler in targets {
				handler(status);
			}
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_types::{EventPayload, Schema, ValidationError};
	use std::time::Duration;

	struct NoSchema;

	impl ConfigSchema for NoSchema {
		fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
			Schema::new(vec![], vec![]).validate(config)
		}
	}

	/// Sends a fixed script of signals on connect.
	struct Scripted(Vec<ChannelSignal>);

	#[async_trait]
	impl ChannelInterface for Scripted {
		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			Box::new(NoSchema)
		}

		async fn connect(
			&self,
			_credentials: &Credentials,
			sender: mpsc::UnboundedSender<ChannelSignal>,
		) -> Result<(), ChannelError> {
			for signal in &self.0 {
				let _ = sender.send(signal.clone());
			}
			Ok(())
		}

		async fn disconnect(&self) -> Result<(), ChannelError> {
			Ok(())
		}
	}

	fn delivered(order_id: &str) -> ChannelSignal {
		ChannelSignal::Event(ChannelEvent::new(EventPayload::OrderDelivered {
			order_id: order_id.to_string(),
		}))
	}

	fn status_changed(order_id: &str) -> ChannelSignal {
		ChannelSignal::Event(ChannelEvent::new(EventPayload::OrderStatusChanged {
			order_id: order_id.to_string(),
			status: dispatch_types::OrderStatus::Picked,
		}))
	}

	async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
		tokio::time::timeout(Duration::from_secs(1), rx.recv())
			.await
			.ok()
			.flatten()
	}

	#[tokio::test]
	async fn test_handlers_receive_only_their_kind() {
		let channel = SyncChannel::new(Box::new(Scripted(vec![
			ChannelSignal::Status(ChannelStatus::Connected),
			status_changed("o1"),
			delivered("o2"),
		])));

		let (tx, mut rx) = mpsc::unbounded_channel();
		let _delivered = channel.subscribe(EventKind::OrderDelivered, move |event| {
			let _ = tx.send(event.order_id().map(str::to_string));
		});
		let (status_tx, mut status_rx) = mpsc::unbounded_channel();
		let _status = channel.subscribe_status(move |status| {
			let _ = status_tx.send(status.clone());
		});

		channel.connect(&Credentials::new("c", "t")).await.unwrap();

		assert_eq!(next(&mut status_rx).await, Some(ChannelStatus::Connected));
		assert_eq!(next(&mut rx).await, Some(Some("o2".to_string())));
		channel.disconnect().await.unwrap();
	}

	#[tokio::test]
	async fn test_dropped_subscription_is_removed() {
		let channel = SyncChannel::new(Box::new(Scripted(vec![delivered("o1")])));

		let (tx, mut rx) = mpsc::unbounded_channel::<()>();
		let kept_tx = tx.clone();
		let dropped = channel.subscribe(EventKind::OrderDelivered, move |_| {
			let _ = tx.send(());
		});
		let unsubscribed = channel.subscribe(EventKind::OrderDelivered, |_| {});
		let _kept = channel.subscribe(EventKind::OrderDelivered, move |_| {
			let _ = kept_tx.send(());
		});
		assert_eq!(channel.subscriber_count(), 3);

		drop(dropped);
		unsubscribed.unsubscribe();
		assert_eq!(channel.subscriber_count(), 1);

		channel.connect(&Credentials::new("c", "t")).await.unwrap();
		assert_eq!(next(&mut rx).await, Some(()));
		// The dropped handler's sender is gone; only the kept one fired.
		assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
			.await
			.is_err());
	}

	#[tokio::test]
	async fn test_subscription_outliving_channel_is_harmless() {
		let channel = SyncChannel::new(Box::new(Scripted(vec![])));
		let subscription = channel.subscribe(EventKind::OrderCreated, |_| {});
		drop(channel);
		drop(subscription);
	}
}
