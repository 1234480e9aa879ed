//! Event stream over a long-lived HTTP response.
//!
//! `GET {base_url}/events` with the bearer token returns newline-delimited
//! JSON, one [`ChannelEvent`] per line. When the response ends or fails the
//! channel reports `Disconnected`, waits with bounded exponential backoff and
//! reconnects; every reconnect is followed by `ResyncRequired` since events
//! sent in between are gone. A 401/403 answer stops the channel for good.

use crate::{ChannelError, ChannelInterface};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dispatch_backend::BackendService;
use dispatch_types::{
	http_url, ChannelEvent, ChannelSignal, ChannelStatus, ConfigSchema, Credentials, Field,
	FieldType, ImplementationRegistry, Schema, ValidationError,
};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Why a single streaming session ended.
enum SessionEnd {
	Closed(String),
	Unauthorized(String),
	/// The consumer went away.
	Abandoned,
}

/// Reconnect delays.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
	pub initial: Duration,
	pub max: Duration,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			initial: Duration::from_millis(500),
			max: Duration::from_secs(30),
		}
	}
}

impl ReconnectPolicy {
	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.initial)
			.with_max_interval(self.max)
			.with_max_elapsed_time(None)
			.build()
	}
}

/// Channel reading newline-delimited JSON events from the backend.
pub struct StreamChannel {
	client: Client,
	events_url: String,
	reconnect: ReconnectPolicy,
	is_connected: Arc<AtomicBool>,
	stop_signal: Mutex<Option<mpsc::Sender<()>>>,
}

impl StreamChannel {
	pub fn new(
		base_url: &str,
		connect_timeout: Duration,
		reconnect: ReconnectPolicy,
	) -> Result<Self, ChannelError> {
		let client = Client::builder()
			.connect_timeout(connect_timeout)
			.build()
			.map_err(|e| ChannelError::Connection(format!("Failed to build HTTP client: {}", e)))?;
		Ok(Self {
			client,
			events_url: format!("{}/events", base_url.trim_end_matches('/')),
			reconnect,
			is_connected: Arc::new(AtomicBool::new(false)),
			stop_signal: Mutex::new(None),
		})
	}

	/// Connect, stream until the session ends, reconnect; until stopped.
	async fn run(
		client: Client,
		url: String,
		credentials: Credentials,
		sender: mpsc::UnboundedSender<ChannelSignal>,
		mut stop_rx: mpsc::Receiver<()>,
		reconnect: ReconnectPolicy,
		is_connected: Arc<AtomicBool>,
	) {
		let mut backoff = reconnect.backoff();
		let mut reconnecting = false;

		loop {
			let session = Self::session(
				&client,
				&url,
				&credentials,
				&sender,
				reconnecting,
				&mut backoff,
			);
			let end = tokio::select! {
				end = session => end,
				_ = stop_rx.recv() => return,
			};

			match end {
				SessionEnd::Closed(reason) => {
					tracing::warn!(%reason, "Event stream disconnected");
					let _ = sender.send(ChannelSignal::Status(ChannelStatus::Disconnected { reason }));
				},
				SessionEnd::Unauthorized(reason) => {
					tracing::error!(%reason, "Event stream refused credentials");
					let _ = sender.send(ChannelSignal::Status(ChannelStatus::Unauthorized { reason }));
					break;
				},
				SessionEnd::Abandoned => break,
			}
			reconnecting = true;

			let delay = backoff.next_backoff().unwrap_or(reconnect.max);
			tracing::debug!(delay_ms = delay.as_millis() as u64, "Reconnecting event stream");
			tokio::select! {
				_ = tokio::time::sleep(delay) => {},
				_ = stop_rx.recv() => return,
			}
		}
		is_connected.store(false, Ordering::SeqCst);
	}

	async fn session(
		client: &Client,
		url: &str,
		credentials: &Credentials,
		sender: &mpsc::UnboundedSender<ChannelSignal>,
		reconnecting: bool,
		backoff: &mut ExponentialBackoff,
	) -> SessionEnd {
		let response = match client
			.get(url)
			.header(reqwest::header::AUTHORIZATION, credentials.bearer())
			.header(reqwest::header::ACCEPT, "application/x-ndjson")
			.send()
			.await
		{
			Ok(response) => response,
			Err(e) => return SessionEnd::Closed(e.to_string()),
		};

		match response.status() {
			StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
				return SessionEnd::Unauthorized(response.status().to_string());
			},
			status if !status.is_success() => {
				return SessionEnd::Closed(format!("unexpected status {}", status));
			},
			_ => {},
		}

		backoff.reset();
		tracing::info!(url, "Event stream connected");
		if sender
			.send(ChannelSignal::Status(ChannelStatus::Connected))
			.is_err()
		{
			return SessionEnd::Abandoned;
		}
		if reconnecting
			&& sender
				.send(ChannelSignal::Status(ChannelStatus::ResyncRequired))
				.is_err()
		{
			return SessionEnd::Abandoned;
		}

		let mut body = response.bytes_stream();
		let mut buffer: Vec<u8> = Vec::new();
		while let Some(chunk) = body.next().await {
			let chunk = match chunk {
				Ok(chunk) => chunk,
				Err(e) => return SessionEnd::Closed(e.to_string()),
			};
			buffer.extend_from_slice(&chunk);

			while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
				let line: Vec<u8> = buffer.drain(..=newline).collect();
				if let Some(event) = parse_line(&line) {
					if sender.send(ChannelSignal::Event(event)).is_err() {
						return SessionEnd::Abandoned;
					}
				}
			}
		}
		SessionEnd::Closed("stream ended".to_string())
	}
}

/// Decodes one line; blank lines are keep-alives, bad lines are skipped.
fn parse_line(line: &[u8]) -> Option<ChannelEvent> {
	let trimmed = line.trim_ascii();
	if trimmed.is_empty() {
		return None;
	}
	match serde_json::from_slice::<ChannelEvent>(trimmed) {
		Ok(event) => Some(event),
		Err(e) => {
			tracing::warn!(error = %e, "Skipping undecodable event");
			None
		},
	}
}

#[async_trait]
impl ChannelInterface for StreamChannel {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(StreamChannelSchema)
	}

	async fn connect(
		&self,
		credentials: &Credentials,
		sender: mpsc::UnboundedSender<ChannelSignal>,
	) -> Result<(), ChannelError> {
		if self.is_connected.swap(true, Ordering::SeqCst) {
			return Err(ChannelError::AlreadyConnected);
		}

		let (stop_tx, stop_rx) = mpsc::channel(1);
		*self.stop_signal.lock().await = Some(stop_tx);

		tokio::spawn(Self::run(
			self.client.clone(),
			self.events_url.clone(),
			credentials.clone(),
			sender,
			stop_rx,
			self.reconnect,
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

/// Configuration schema for StreamChannel.
pub struct StreamChannelSchema;

impl ConfigSchema for StreamChannelSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![Field::new("base_url", FieldType::String).with_validator(http_url)],
			vec![
				Field::new(
					"connect_timeout_seconds",
					FieldType::Integer {
						min: Some(1),
						max: Some(120),
					},
				),
				Field::new(
					"reconnect_initial_ms",
					FieldType::Integer {
						min: Some(10),
						max: None,
					},
				),
				Field::new(
					"reconnect_max_ms",
					FieldType::Integer {
						min: Some(10),
						max: None,
					},
				),
			],
		)
		.validate(config)
	}
}

/// Factory function to create a stream channel.
///
/// Configuration parameters:
/// - `base_url` (required): root URL of the backend
/// - `connect_timeout_seconds`: TCP connect timeout (default: 10)
/// - `reconnect_initial_ms` / `reconnect_max_ms`: reconnect backoff bounds
///   (default: 500 / 30000)
pub fn create_channel(
	config: &toml::Value,
	_backend: &BackendService,
) -> Result<Box<dyn ChannelInterface>, ChannelError> {
	StreamChannelSchema
		.validate(config)
		.map_err(|e| ChannelError::Validation(format!("Invalid configuration: {}", e)))?;

	let base_url = config
		.get("base_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| ChannelError::Validation("base_url is required".into()))?;
	let int = |key: &str| config.get(key).and_then(|v| v.as_integer()).map(|v| v as u64);

	let defaults = ReconnectPolicy::default();
	let reconnect = ReconnectPolicy {
		initial: int("reconnect_initial_ms").map_or(defaults.initial, Duration::from_millis),
		max: int("reconnect_max_ms").map_or(defaults.max, Duration::from_millis),
	};
	if reconnect.initial > reconnect.max {
		return Err(ChannelError::Validation(
			"reconnect_initial_ms must not exceed reconnect_max_ms".into(),
		));
	}

	Ok(Box::new(StreamChannel::new(
		base_url,
		Duration::from_secs(int("connect_timeout_seconds").unwrap_or(10)),
		reconnect,
	)?))
}

/// Registry for the stream channel implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "stream";
	type Factory = crate::ChannelFactory;

	fn factory() -> Self::Factory {
		create_channel
	}
}

impl crate::ChannelRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::{http::HeaderMap, http::StatusCode as AxumStatus, routing::get, Router};
	use std::sync::atomic::AtomicU32;

	async fn serve(router: Router) -> String {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			axum::serve(listener, router).await.unwrap();
		});
		format!("http://{}", addr)
	}

	fn fast_reconnect() -> ReconnectPolicy {
		ReconnectPolicy {
			initial: Duration::from_millis(10),
			max: Duration::from_millis(20),
		}
	}

	async fn next(rx: &mut mpsc::UnboundedReceiver<ChannelSignal>) -> ChannelSignal {
		tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.unwrap()
			.unwrap()
	}

	#[test]
	fn test_parse_line_skips_noise() {
		assert!(parse_line(b"\n").is_none());
		assert!(parse_line(b"{not json}\n").is_none());
		let event =
			parse_line(br#"{"type":"order_delivered","order_id":"o1","timestamp":3}"#).unwrap();
		assert_eq!(event.order_id(), Some("o1"));
	}

	#[tokio::test]
	async fn test_reconnect_requests_resync() {
		let hits = Arc::new(AtomicU32::new(0));
		let counter = hits.clone();
		let router = Router::new().route(
			"/events",
			get(move || {
				let counter = counter.clone();
				async move {
					let n = counter.fetch_add(1, Ordering::SeqCst);
					format!(
						"{{\"type\":\"order_delivered\",\"order_id\":\"o{}\",\"timestamp\":1}}\n\n",
						n
					)
				}
			}),
		);
		let channel =
			StreamChannel::new(&serve(router).await, Duration::from_secs(5), fast_reconnect())
				.unwrap();
		let (tx, mut rx) = mpsc::unbounded_channel();
		channel.connect(&Credentials::new("c", "t"), tx).await.unwrap();

		assert_eq!(next(&mut rx).await, ChannelSignal::Status(ChannelStatus::Connected));
		match next(&mut rx).await {
			ChannelSignal::Event(event) => assert_eq!(event.order_id(), Some("o0")),
			other => panic!("unexpected signal {:?}", other),
		}
		assert!(matches!(
			next(&mut rx).await,
			ChannelSignal::Status(ChannelStatus::Disconnected { .. })
		));
		assert_eq!(next(&mut rx).await, ChannelSignal::Status(ChannelStatus::Connected));
		assert_eq!(next(&mut rx).await, ChannelSignal::Status(ChannelStatus::ResyncRequired));

		channel.disconnect().await.unwrap();
		assert!(hits.load(Ordering::SeqCst) >= 2);
	}

	#[tokio::test]
	async fn test_unauthorized_stops_channel() {
		let router = Router::new().route(
			"/events",
			get(|headers: HeaderMap| async move {
				match headers.get("authorization").and_then(|v| v.to_str().ok()) {
					Some("Bearer good") => (AxumStatus::OK, String::new()),
					_ => (AxumStatus::UNAUTHORIZED, String::new()),
				}
			}),
		);
		let channel =
			StreamChannel::new(&serve(router).await, Duration::from_secs(5), fast_reconnect())
				.unwrap();
		let (tx, mut rx) = mpsc::unbounded_channel();
		channel.connect(&Credentials::new("c", "bad"), tx).await.unwrap();

		assert!(matches!(
			next(&mut rx).await,
			ChannelSignal::Status(ChannelStatus::Unauthorized { .. })
		));
		// The task exits and drops its sender.
		assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.unwrap()
			.is_none());
	}

	#[test]
	fn test_factory_validates_backoff_bounds() {
		let config: toml::Value = toml::from_str(
			r#"
			base_url = "http://localhost:8080"
			reconnect_initial_ms = 5000
			reconnect_max_ms = 100
			"#,
		)
		.unwrap();
		assert!(StreamChannelSchema.validate(&config).is_ok());
		let backend = BackendService::new(
			dispatch_backend::implementations::http::create_backend(&config).unwrap(),
			Credentials::new("c", "t"),
			Default::default(),
		);
		assert!(matches!(
			create_channel(&config, &backend),
			Err(ChannelError::Validation(_))
		));
	}
}
