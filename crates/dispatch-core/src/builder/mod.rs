//! Builder pattern for constructing sync engines.
//!
//! Composes a [`SyncEngine`] from storage, backend and channel
//! implementations created by factory functions keyed by implementation
//! name. Pre-built storage or backend instances can be injected instead,
//! which is how tests share one in-process authority between clients.

use crate::engine::{event_bus::EventBus, EngineHandle, SyncEngine};
use dispatch_backend::{BackendError, BackendInterface, BackendService, RetryPolicy};
use dispatch_channel::{ChannelError, ChannelInterface, SyncChannel};
use dispatch_config::Config;
use dispatch_storage::{StorageError, StorageInterface, StorageService};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Capacity of the engine event bus.
const EVENT_BUS_CAPACITY: usize = 1000;

/// Errors that can occur during engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Factory functions for each pluggable component, keyed by name.
pub struct SyncFactories<SF, BF, CF> {
	pub storage_factories: HashMap<String, SF>,
	pub backend_factories: HashMap<String, BF>,
	pub channel_factories: HashMap<String, CF>,
}

/// Builder for a [`SyncEngine`] with pluggable implementations.
pub struct SyncBuilder {
	config: Config,
	storage: Option<Arc<StorageService>>,
	backend: Option<Box<dyn BackendInterface>>,
}

impl SyncBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			storage: None,
			backend: None,
		}
	}

	/// Uses an existing storage service instead of the configured one.
	pub fn with_storage(mut self, storage: Arc<StorageService>) -> Self {
		self.storage = Some(storage);
		self
	}

	/// Uses an existing backend instead of the configured one.
	pub fn with_backend(mut self, backend: Box<dyn BackendInterface>) -> Self {
		self.backend = Some(backend);
		self
	}

	/// Builds the engine and its handle.
	pub fn build<SF, BF, CF>(
		self,
		factories: SyncFactories<SF, BF, CF>,
	) -> Result<(SyncEngine, EngineHandle), BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>,
		BF: Fn(&toml::Value) -> Result<Box<dyn BackendInterface>, BackendError>,
		CF: Fn(&toml::Value, &BackendService) -> Result<Box<dyn ChannelInterface>, ChannelError>,
	{
		let config = self.config;

		let storage = match self.storage {
			Some(storage) => storage,
			None => {
				let implementation = load_primary(
					"storage",
					&config.storage.primary,
					&config.storage.implementations,
					&factories.storage_factories,
					|factory, table| factory(table),
				)?;
				Arc::new(StorageService::new(implementation))
			},
		};

		let backend_impl = match self.backend {
			Some(backend) => {
				tracing::info!(component = "backend", implementation = "injected", "Loaded");
				backend
			},
			None => load_primary(
				"backend",
				&config.backend.primary,
				&config.backend.implementations,
				&factories.backend_factories,
				|factory, table| factory(table),
			)?,
		};

		let retry = RetryPolicy {
			max_attempts: config.backend.retry.max_attempts,
			initial_interval: Duration::from_millis(config.backend.retry.initial_interval_ms),
			max_interval: Duration::from_millis(config.backend.retry.max_interval_ms),
		};
		let backend = Arc::new(BackendService::new(
			backend_impl,
			config.client.credentials(),
			retry,
		));

		let channel_impl = load_primary(
			"channel",
			&config.channel.primary,
			&config.channel.implementations,
			&factories.channel_factories,
			|factory, table| factory(table, backend.as_ref()),
		)?;
		let channel = SyncChannel::new(channel_impl);

		let bus = EventBus::new(EVENT_BUS_CAPACITY);
		Ok(SyncEngine::new(&config, storage, backend, channel, bus))
	}
}

/// Creates every configured implementation that has a factory and returns
/// the primary one.
fn load_primary<F, T, E>(
	component: &'static str,
	primary: &str,
	implementations: &HashMap<String, toml::Value>,
	factories: &HashMap<String, F>,
	create: impl Fn(&F, &toml::Value) -> Result<T, E>,
) -> Result<T, BuilderError>
where
	E: std::fmt::Display,
{
	let mut loaded = HashMap::new();
	for (name, table) in implementations {
		let Some(factory) = factories.get(name) else {
			tracing::warn!(component, implementation = %name, "No factory registered, skipping");
			continue;
		};
		match create(factory, table) {
			Ok(implementation) => {
				let is_primary = primary == name;
				tracing::info!(component, implementation = %name, enabled = %is_primary, "Loaded");
				loaded.insert(name.clone(), implementation);
			},
			Err(e) => {
				tracing::error!(
					component,
					implementation = %name,
					error = %e,
					"Failed to create implementation"
				);
				return Err(BuilderError::Config(format!(
					"Failed to create {} implementation '{}': {}",
					component, name, e
				)));
			},
		}
	}

	if loaded.is_empty() {
		return Err(BuilderError::MissingComponent(format!(
			"no valid {} implementations available",
			component
		)));
	}

	loaded.remove(primary).ok_or_else(|| {
		BuilderError::Config(format!(
			"Primary {} '{}' failed to load or has invalid configuration",
			component, primary
		))
	})
}
