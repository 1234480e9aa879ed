//! Configuration module for the dispatch sync engine.
//!
//! This module provides structures and utilities for managing client
//! configuration. It supports loading configuration from TOML files and
//! validates that identity, implementations and sync timings are usable
//! before the engine starts.
//!
//! ## Modular Configuration Support
//!
//! Configurations can be split into multiple files:
//! - Use `include = ["file1.toml", "file2.toml"]` to include other config files
//! - Each top-level section must be unique across all files (no duplicates allowed)

pub mod builders;
mod loader;

pub use builders::config::ConfigBuilder;

use dispatch_types::{Credentials, SecretString};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Keep the message only, not the echoed input
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure of a dispatch client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity of this client.
	pub client: ClientConfig,
	/// Local cache backing the persistence fallback.
	pub storage: StorageConfig,
	/// Authoritative backend.
	pub backend: BackendConfig,
	/// Real-time event channel.
	pub channel: ChannelConfig,
	/// Reconciliation and overlay timings.
	#[serde(default)]
	pub sync: SyncConfig,
	/// Dashboard metrics settings.
	#[serde(default)]
	pub metrics: MetricsConfig,
	/// Configuration for the HTTP API server.
	pub api: Option<ApiConfig>,
}

/// Which side of the dispatch flow this client runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
	/// Restaurant manager: creates orders, sees every partner.
	Manager,
	/// Delivery partner: claims orders for a single partner id.
	Partner,
}

/// Identity of this client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
	/// Unique identifier for this client instance.
	pub id: String,
	pub role: ClientRole,
	/// Partner this client acts for. Required for the partner role.
	pub partner_id: Option<String>,
	/// Bearer token presented to the backend and the channel.
	pub token: SecretString,
}

impl ClientConfig {
	pub fn credentials(&self) -> Credentials {
		Credentials::new(self.id.clone(), self.token.clone())
	}
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Configuration for the authoritative backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of backend implementation names to their configurations.
	/// Each implementation has its own configuration format stored as raw TOML values.
	pub implementations: HashMap<String, toml::Value>,
	/// Retry policy for transient network failures.
	#[serde(default)]
	pub retry: RetryConfig,
}

/// Bounded exponential backoff applied to transient backend failures.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
	/// Total attempts including the first one.
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	#[serde(default = "default_initial_interval_ms")]
	pub initial_interval_ms: u64,
	#[serde(default = "default_max_interval_ms")]
	pub max_interval_ms: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: default_max_attempts(),
			initial_interval_ms: default_initial_interval_ms(),
			max_interval_ms: default_max_interval_ms(),
		}
	}
}

fn default_max_attempts() -> u32 {
	3
}

fn default_initial_interval_ms() -> u64 {
	200
}

fn default_max_interval_ms() -> u64 {
	2000
}

/// Configuration for the real-time event channel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of channel implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Reconciliation and overlay timings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
	/// Seconds between authoritative pulls.
	#[serde(default = "default_pull_interval_seconds")]
	pub pull_interval_seconds: u64,
	/// Seconds an order may stay unconfirmed before a full pull evicts it.
	#[serde(default = "default_confirmation_timeout_seconds")]
	pub confirmation_timeout_seconds: u64,
	/// Trailing window in which replayed events are ignored.
	#[serde(default = "default_dedup_window_ms")]
	pub dedup_window_ms: u64,
	/// Lifetime of an optimistic overlay without confirmation.
	#[serde(default = "default_overlay_timeout_ms")]
	pub overlay_timeout_ms: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			pull_interval_seconds: default_pull_interval_seconds(),
			confirmation_timeout_seconds: default_confirmation_timeout_seconds(),
			dedup_window_ms: default_dedup_window_ms(),
			overlay_timeout_ms: default_overlay_timeout_ms(),
		}
	}
}

impl SyncConfig {
	pub fn pull_interval(&self) -> Duration {
		Duration::from_secs(self.pull_interval_seconds)
	}

	pub fn confirmation_timeout(&self) -> Duration {
		Duration::from_secs(self.confirmation_timeout_seconds)
	}

	pub fn dedup_window(&self) -> Duration {
		Duration::from_millis(self.dedup_window_ms)
	}

	pub fn overlay_timeout(&self) -> Duration {
		Duration::from_millis(self.overlay_timeout_ms)
	}
}

fn default_pull_interval_seconds() -> u64 {
	30
}

fn default_confirmation_timeout_seconds() -> u64 {
	90
}

fn default_dedup_window_ms() -> u64 {
	5000
}

fn default_overlay_timeout_ms() -> u64 {
	5000
}

/// Dashboard metrics settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
	/// Average delivery time reported before any delivery has timestamps.
	#[serde(default = "default_fallback_delivery_minutes")]
	pub fallback_delivery_minutes: f64,
}

impl Default for MetricsConfig {
	fn default() -> Self {
		Self {
			fallback_delivery_minutes: default_fallback_delivery_minutes(),
		}
	}
}

fn default_fallback_delivery_minutes() -> f64 {
	30.0
}

/// Configuration for the HTTP API server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	/// Whether the API server is enabled.
	#[serde(default)]
	pub enabled: bool,
	/// Host address to bind the server to.
	#[serde(default = "default_api_host")]
	pub host: String,
	/// Port to bind the server to.
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Request timeout in seconds.
	#[serde(default = "default_api_timeout")]
	pub timeout_seconds: u64,
	/// Maximum request size in bytes.
	#[serde(default = "default_max_request_size")]
	pub max_request_size: usize,
	/// CORS configuration.
	pub cors: Option<CorsConfig>,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
	/// Allowed origins for CORS.
	pub allowed_origins: Vec<String>,
	/// Allowed headers for CORS.
	pub allowed_headers: Vec<String>,
	/// Allowed methods for CORS.
	pub allowed_methods: Vec<String>,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	3000
}

fn default_api_timeout() -> u64 {
	30
}

fn default_max_request_size() -> usize {
	64 * 1024
}

/// Resolves environment variables in a string.
///
/// Replaces ${VAR_NAME} with the value of the environment variable VAR_NAME.
/// Supports default values with ${VAR_NAME:-default_value}.
///
/// Input strings are limited to 1MB.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut output = String::with_capacity(input.len());
	let mut last = 0;

	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match std::env::var(var_name.as_str()) {
			Ok(v) => v,
			Err(_) => match cap.get(2) {
				Some(default) => default.as_str().to_string(),
				None => {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{}' not found",
						var_name.as_str()
					)))
				},
			},
		};

		output.push_str(&input[last..full_match.start()]);
		output.push_str(&value);
		last = full_match.end();
	}
	output.push_str(&input[last..]);

	Ok(output)
}

fn validate_implementations(
	section: &str,
	primary: &str,
	implementations: &HashMap<String, toml::Value>,
) -> Result<(), ConfigError> {
	if implementations.is_empty() {
		return Err(ConfigError::Validation(format!(
			"At least one {} implementation must be configured",
			section
		)));
	}
	if primary.is_empty() {
		return Err(ConfigError::Validation(format!(
			"{} primary implementation cannot be empty",
			section
		)));
	}
	if !implementations.contains_key(primary) {
		return Err(ConfigError::Validation(format!(
			"Primary {} '{}' not found in implementations",
			section, primary
		)));
	}
	Ok(())
}

impl Config {
	/// Loads configuration from a file with environment variable resolution.
	///
	/// `include = ["file1.toml", "file2.toml"]` pulls other files in; each
	/// top-level section must be unique across all of them.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = loader::ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Validates identity, implementation tables and timing bounds.
	pub(crate) fn validate(&self) -> Result<(), ConfigError> {
		if self.client.id.is_empty() {
			return Err(ConfigError::Validation("Client ID cannot be empty".into()));
		}
		if self.client.token.is_empty() {
			return Err(ConfigError::Validation(
				"Client token cannot be empty".into(),
			));
		}
		match (self.client.role, self.client.partner_id.as_deref()) {
			(ClientRole::Partner, None) | (ClientRole::Partner, Some("")) => {
				return Err(ConfigError::Validation(
					"Partner clients must set client.partner_id".into(),
				));
			},
			(ClientRole::Manager, Some(_)) => {
				return Err(ConfigError::Validation(
					"Manager clients must not set client.partner_id".into(),
				));
			},
			_ => {},
		}

		validate_implementations(
			"storage",
			&self.storage.primary,
			&self.storage.implementations,
		)?;

		validate_implementations(
			"backend",
			&self.backend.primary,
			&self.backend.implementations,
		)?;
		let retry = &self.backend.retry;
		if retry.max_attempts == 0 || retry.max_attempts > 10 {
			return Err(ConfigError::Validation(
				"backend.retry.max_attempts must be between 1 and 10".into(),
			));
		}
		if retry.initial_interval_ms == 0 || retry.initial_interval_ms > retry.max_interval_ms {
			return Err(ConfigError::Validation(
				"backend.retry.initial_interval_ms must be positive and not exceed max_interval_ms"
					.into(),
			));
		}

		validate_implementations(
			"channel",
			&self.channel.primary,
			&self.channel.implementations,
		)?;

		let sync = &self.sync;
		if sync.pull_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"sync.pull_interval_seconds must be greater than 0".into(),
			));
		}
		if sync.confirmation_timeout_seconds < sync.pull_interval_seconds {
			return Err(ConfigError::Validation(
				"sync.confirmation_timeout_seconds must be at least pull_interval_seconds".into(),
			));
		}
		if sync.overlay_timeout_ms == 0 {
			return Err(ConfigError::Validation(
				"sync.overlay_timeout_ms must be greater than 0".into(),
			));
		}

		if !self.metrics.fallback_delivery_minutes.is_finite()
			|| self.metrics.fallback_delivery_minutes < 0.0
		{
			return Err(ConfigError::Validation(
				"metrics.fallback_delivery_minutes must be a non-negative number".into(),
			));
		}

		if let Some(api) = self.api.as_ref().filter(|api| api.enabled) {
			if api.port == 0 {
				return Err(ConfigError::Validation("API port cannot be 0".into()));
			}
		}

		Ok(())
	}

	/// Partner id the client acts for, if it runs as a partner.
	pub fn partner_id(&self) -> Option<&str> {
		match self.client.role {
			ClientRole::Partner => self.client.partner_id.as_deref(),
			ClientRole::Manager => None,
		}
	}
}

/// Parses, resolves environment variables, then validates.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}

#[cfg(test)]
pub(crate) mod test_fixtures {
	/// A complete partner-side configuration.
	pub const PARTNER_CONFIG: &str = r#"
[client]
id = "rider-app-7"
role = "partner"
partner_id = "p7"
token = "${DISPATCH_TEST_TOKEN:-dev-token}"

[storage]
primary = "memory"
[storage.implementations.memory]

[backend]
primary = "http"
[backend.implementations.http]
base_url = "http://localhost:8080"

[channel]
primary = "stream"
[channel.implementations.stream]
base_url = "http://localhost:8080"
"#;
}
