//! Main entry point for the dispatch sync client.
//!
//! Runs one client of the dispatch flow, either a restaurant manager or a
//! delivery partner, keeping its local order cache in sync with the backend
//! and serving it to local consumers over HTTP.

use clap::Parser;
use dispatch_config::Config;
use std::path::PathBuf;

mod apis;
mod factory_registry;
mod server;

/// Command-line arguments for the dispatch client.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

/// Main entry point for the dispatch client.
///
/// This function:
/// 1. Parses command-line arguments
/// 2. Initializes logging infrastructure
/// 3. Loads configuration from file
/// 4. Builds the sync engine with all implementations
/// 5. Runs the engine, and the API server when enabled, until interrupted
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started dispatch client");

	let config_path = args
		.config
		.to_str()
		.ok_or("Configuration path is not valid UTF-8")?;
	let config = Config::from_file(config_path).await?;
	tracing::info!(
		role = ?config.client.role,
		"Loaded configuration [{}]",
		config.client.id
	);

	let api_config = config.api.clone().filter(|api| api.enabled);
	let (engine, handle) = factory_registry::build_engine_from_config(config)?;
	let mut engine_task = tokio::spawn(engine.run());

	let api_task = async {
		match api_config {
			Some(api_config) => server::start_server(api_config, handle.clone()).await,
			None => {
				tracing::info!("Starting sync engine only");
				std::future::pending().await
			},
		}
	};

	tokio::select! {
		result = &mut engine_task => {
			tracing::info!("Sync engine finished");
			result??;
			return Ok(());
		}
		result = api_task => {
			tracing::info!("API server finished");
			result?;
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("Interrupted");
		}
	}

	// Let the engine flush its snapshot before exiting.
	handle.shutdown().await?;
	engine_task.await??;

	tracing::info!("Stopped dispatch client");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_args_default_values() {
		let args = Args::parse_from(["dispatch"]);
		assert_eq!(args.config, PathBuf::from("config.toml"));
		assert_eq!(args.log_level, "info");
	}

	#[test]
	fn test_args_custom_values() {
		let args = Args::parse_from(["dispatch", "--config", "rider.toml", "-l", "debug"]);
		assert_eq!(args.config, PathBuf::from("rider.toml"));
		assert_eq!(args.log_level, "debug");
	}

	#[tokio::test]
	async fn test_config_file_builds_engine() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("manager.toml");
		let cache = dir.path().join("cache");
		std::fs::write(
			&path,
			format!(
				r#"
[client]
id = "kitchen-1"
role = "manager"
token = "secret"

[storage]
primary = "file"
[storage.implementations.file]
storage_path = "{}"

[backend]
primary = "memory"
[backend.implementations.memory]

[channel]
primary = "local"
[channel.implementations.local]
"#,
				cache.display()
			),
		)
		.unwrap();

		let config = Config::from_file(path.to_str().unwrap()).await.unwrap();
		assert_eq!(config.client.id, "kitchen-1");

		let (engine, handle) = factory_registry::build_engine_from_config(config).unwrap();
		let task = tokio::spawn(engine.run());
		let report = handle.refresh().await.unwrap();
		assert_eq!(report.pulled, 0);
		handle.shutdown().await.unwrap();
		task.await.unwrap().unwrap();
	}
}
