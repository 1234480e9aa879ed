//! In-process channel bridged to the memory authority's broadcast feed.
//!
//! A receiver that falls behind the broadcast buffer has lost events; that
//! is reported like a dropped connection followed by a resync request.

use crate::{ChannelError, ChannelInterface};
use async_trait::async_trait;
use dispatch_backend::BackendService;
use dispatch_types::{
	ChannelEvent, ChannelSignal, ChannelStatus, ConfigSchema, Credentials,
	ImplementationRegistry, Schema, ValidationError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Channel fed by an in-process broadcast sender.
pub struct LocalChannel {
	/// Template receiver; every connect resubscribes from the live tail.
	feed: Mutex<broadcast::Receiver<ChannelEvent>>,
	is_connected: Arc<AtomicBool>,
	stop_signal: Mutex<Option<mpsc::Sender<()>>>,
}

impl LocalChannel {
	pub fn new(feed: broadcast::Receiver<ChannelEvent>) -> Self {
		Self {
			feed: Mutex::new(feed),
			is_connected: Arc::new(AtomicBool::new(false)),
			stop_signal: Mutex::new(None),
		}
	}

	async fn forward_loop(
		mut feed: broadcast::Receiver<ChannelEvent>,
		sender: mpsc::UnboundedSender<ChannelSignal>,
		mut stop_rx: mpsc::Receiver<()>,
		is_connected: Arc<AtomicBool>,
	) {
		let _ = sender.send(ChannelSignal::Status(ChannelStatus::Connected));

		loop {
			tokio::select! {
				received = feed.recv() => match received {
					Ok(event) => {
						if sender.send(ChannelSignal::Event(event)).is_err() {
							break;
						}
					},
					Err(broadcast::error::RecvError::Lagged(missed)) => {
						tracing::warn!(missed, "Local channel lagged behind the feed");
						let _ = sender.send(ChannelSignal::Status(ChannelStatus::Disconnected {
							reason: format!("lagged by {} events", missed),
						}));
						let _ = sender.send(ChannelSignal::Status(ChannelStatus::ResyncRequired));
					},
					Err(broadcast::error::RecvError::Closed) => {
						let _ = sender.send(ChannelSignal::Status(ChannelStatus::Disconnected {
							reason: "feed closed".to_string(),
						}));
						break;
					},
				},
				// Stopped by disconnect, which owns the flag.
				_ = stop_rx.recv() => return,
			}
		}
		is_connected.store(false, Ordering::SeqCst);
	}
}

#[async_trait]
impl ChannelInterface for LocalChannel {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LocalChannelSchema)
	}

	async fn connect(
		&self,
		_credentials: &Credentials,
		sender: mpsc::UnboundedSender<ChannelSignal>,
	) -> Result<(), ChannelError> {
		if self.is_connected.swap(true, Ordering::SeqCst) {
			return Err(ChannelError::AlreadyConnected);
		}

		let feed = self.feed.lock().await.resubscribe();
		let (stop_tx, stop_rx) = mpsc::channel(1);
		*self.stop_signal.lock().await = Some(stop_tx);

		tokio::spawn(Self::forward_loop(
			feed,
			sender,
			stop_rx,
			self.is_connected.clone(),
		));
		Ok(())
	}

	async fn disconnect(&self) -> Result<(), ChannelError> {
		if let Some(stop_tx) = self.stop_signal.lock().await.take() {
			let _ = stop_tx.send(()).await;
		}
		self.is_connected.store(false, Ordering::SeqCst);
		Ok(())
	}
}

/// Configuration schema for LocalChannel; it takes no options.
pub struct LocalChannelSchema;

impl ConfigSchema for LocalChannelSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Factory function attaching to the backend's in-process feed.
///
/// Only backends that run in-process (the `memory` backend) have one.
pub fn create_channel(
	config: &toml::Value,
	backend: &BackendService,
) -> Result<Box<dyn ChannelInterface>, ChannelError> {
	LocalChannelSchema
		.validate(config)
		.map_err(|e| ChannelError::Validation(format!("Invalid configuration: {}", e)))?;

	let feed = backend.event_feed().ok_or_else(|| {
		ChannelError::Validation("local channel requires an in-process backend".into())
	})?;
	Ok(Box::new(LocalChannel::new(feed)))
}

/// Registry for the local channel implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "local";
	type Factory = crate::ChannelFactory;

	fn factory() -> Self::Factory {
		create_channel
	}
}

impl crate::ChannelRegistry for Registry {}
