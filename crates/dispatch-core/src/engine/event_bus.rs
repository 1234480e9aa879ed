//! Event bus for the engine's internal notifications.
//!
//! A thin wrapper over a tokio broadcast channel. Consumers that fall behind
//! lose the oldest events; the store and metrics watches are the source of
//! truth, the bus only tells them something happened.

use dispatch_types::EngineEvent;
use tokio::sync::broadcast;

/// Broadcast bus for [`EngineEvent`]s.
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
	/// Creates a bus retaining up to `capacity` undelivered events.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self { sender }
	}

	/// Subscribes to events published from now on.
	pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
		self.sender.subscribe()
	}

	/// Publishes an event; fails only when nobody is listening.
	pub fn publish(
		&self,
		event: EngineEvent,
	) -> Result<(), broadcast::error::SendError<EngineEvent>> {
		self.sender.send(event)?;
		Ok(())
	}
}
