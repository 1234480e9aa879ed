//! Dynamic factory registry for dispatch implementations.
//!
//! Collects the factory functions of every storage, backend and channel
//! implementation once, and picks the ones a configuration names when the
//! engine is built.

use dispatch_backend::BackendFactory;
use dispatch_channel::ChannelFactory;
use dispatch_config::Config;
use dispatch_core::{EngineHandle, SyncBuilder, SyncEngine, SyncFactories};
use dispatch_storage::StorageFactory;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Global registry for all implementation factories
pub struct FactoryRegistry {
	pub storage: HashMap<String, StorageFactory>,
	pub backend: HashMap<String, BackendFactory>,
	pub channel: HashMap<String, ChannelFactory>,
}

impl FactoryRegistry {
	pub fn new() -> Self {
		Self {
			storage: HashMap::new(),
			backend: HashMap::new(),
			channel: HashMap::new(),
		}
	}

	pub fn register_storage(&mut self, name: impl Into<String>, factory: StorageFactory) {
		self.storage.insert(name.into(), factory);
	}

	pub fn register_backend(&mut self, name: impl Into<String>, factory: BackendFactory) {
		self.backend.insert(name.into(), factory);
	}

	pub fn register_channel(&mut self, name: impl Into<String>, factory: ChannelFactory) {
		self.channel.insert(name.into(), factory);
	}
}

static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Returns the global registry, filling it on first use.
pub fn get_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();

		for (name, factory) in dispatch_storage::get_all_implementations() {
			tracing::debug!("Registering storage implementation: {}", name);
			registry.register_storage(name, factory);
		}

		for (name, factory) in dispatch_backend::get_all_implementations() {
			tracing::debug!("Registering backend implementation: {}", name);
			registry.register_backend(name, factory);
		}

		for (name, factory) in dispatch_channel::get_all_implementations() {
			tracing::debug!("Registering channel implementation: {}", name);
			registry.register_channel(name, factory);
		}

		registry
	})
}

/// Picks the factories named by a config section, failing on unknown names.
macro_rules! build_factories {
	($registry:expr, $config_impls:expr, $registry_field:ident, $type_name:literal) => {{
		let mut factories = HashMap::new();
		for name in $config_impls.keys() {
			if let Some(factory) = $registry.$registry_field.get(name) {
				factories.insert(name.clone(), *factory);
			} else {
				let mut available: Vec<_> = $registry.$registry_field.keys().cloned().collect();
				available.sort();
				return Err(format!(
					"Unknown {} implementation '{}'. Available: [{}]",
					$type_name,
					name,
					available.join(", ")
				)
				.into());
			}
		}
		factories
	}};
}

/// Builds the sync engine for `config` from the registered implementations.
pub fn build_engine_from_config(
	config: Config,
) -> Result<(SyncEngine, EngineHandle), Box<dyn std::error::Error>> {
	let registry = get_registry();

	let storage_factories =
		build_factories!(registry, config.storage.implementations, storage, "storage");
	let backend_factories =
		build_factories!(registry, config.backend.implementations, backend, "backend");
	let channel_factories =
		build_factories!(registry, config.channel.implementations, channel, "channel");

	let factories = SyncFactories {
		storage_factories,
		backend_factories,
		channel_factories,
	};

	Ok(SyncBuilder::new(config).build(factories)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use dispatch_config::ConfigBuilder;

	#[test]
	fn test_registry_knows_every_implementation() {
		let registry = get_registry();
		assert!(registry.storage.contains_key("file"));
		assert!(registry.storage.contains_key("memory"));
		assert!(registry.backend.contains_key("http"));
		assert!(registry.backend.contains_key("memory"));
		assert!(registry.channel.contains_key("local"));
		assert!(registry.channel.contains_key("stream"));
	}

	#[tokio::test]
	async fn test_build_engine_with_in_process_stack() {
		let config = ConfigBuilder::new().build();
		let (_engine, handle) = build_engine_from_config(config).unwrap();
		assert!(handle.view().orders.is_empty());
	}

	#[test]
	fn test_unknown_implementation_is_reported() {
		let mut config = ConfigBuilder::new().build();
		config
			.channel
			.implementations
			.insert("smoke-signals".into(), toml::Value::Table(toml::Table::new()));

		let err = build_engine_from_config(config).err().unwrap();
		assert!(err.to_string().contains("Unknown channel implementation 'smoke-signals'"));
	}
}
