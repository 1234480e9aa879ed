//! Configuration builder for tests and embedded use.
//!
//! Produces a `Config` wired to the in-process `memory` backend and `local`
//! channel with memory storage, so an engine can run without any network.

use crate::{
	ApiConfig, BackendConfig, ChannelConfig, ClientConfig, ClientRole, Config, MetricsConfig,
	RetryConfig, StorageConfig, SyncConfig,
};
use dispatch_types::SecretString;
use std::collections::HashMap;

/// Builder for creating `Config` instances with a fluent API.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	client_id: String,
	role: ClientRole,
	partner_id: Option<String>,
	token: SecretString,
	storage_primary: String,
	backend_primary: String,
	channel_primary: String,
	retry: RetryConfig,
	sync: SyncConfig,
	metrics: MetricsConfig,
	api: Option<ApiConfig>,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigBuilder {
	/// Manager-side defaults on in-process implementations.
	pub fn new() -> Self {
		Self {
			client_id: "test-client".to_string(),
			role: ClientRole::Manager,
			partner_id: None,
			token: SecretString::from("test-token"),
			storage_primary: "memory".to_string(),
			backend_primary: "memory".to_string(),
			channel_primary: "local".to_string(),
			retry: RetryConfig::default(),
			sync: SyncConfig::default(),
			metrics: MetricsConfig::default(),
			api: None,
		}
	}

	pub fn client_id(mut self, id: impl Into<String>) -> Self {
		self.client_id = id.into();
		self
	}

	/// Switches to the partner role acting for `partner_id`.
	pub fn partner(mut self, partner_id: impl Into<String>) -> Self {
		self.role = ClientRole::Partner;
		self.partner_id = Some(partner_id.into());
		self
	}

	pub fn token(mut self, token: impl Into<SecretString>) -> Self {
		self.token = token.into();
		self
	}

	pub fn storage_primary(mut self, primary: impl Into<String>) -> Self {
		self.storage_primary = primary.into();
		self
	}

	pub fn backend_primary(mut self, primary: impl Into<String>) -> Self {
		self.backend_primary = primary.into();
		self
	}

	pub fn channel_primary(mut self, primary: impl Into<String>) -> Self {
		self.channel_primary = primary.into();
		self
	}

	pub fn retry(mut self, retry: RetryConfig) -> Self {
		self.retry = retry;
		self
	}

	pub fn sync(mut self, sync: SyncConfig) -> Self {
		self.sync = sync;
		self
	}

	pub fn fallback_delivery_minutes(mut self, minutes: f64) -> Self {
		self.metrics.fallback_delivery_minutes = minutes;
		self
	}

	pub fn api(mut self, api: Option<ApiConfig>) -> Self {
		self.api = api;
		self
	}

	/// Builds the `Config`, registering an empty table for each primary.
	pub fn build(self) -> Config {
		let single = |name: &str| {
			HashMap::from([(name.to_string(), toml::Value::Table(toml::Table::new()))])
		};

		Config {
			client: ClientConfig {
				id: self.client_id,
				role: self.role,
				partner_id: self.partner_id,
				token: self.token,
			},
			storage: StorageConfig {
				implementations: single(&self.storage_primary),
				primary: self.storage_primary,
			},
			backend: BackendConfig {
				implementations: single(&self.backend_primary),
				primary: self.backend_primary,
				retry: self.retry,
			},
			channel: ChannelConfig {
				implementations: single(&self.channel_primary),
				primary: self.channel_primary,
			},
			sync: self.sync,
			metrics: self.metrics,
			api: self.api,
		}
	}
}
