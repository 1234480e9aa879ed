//! HTTP backend implementation.
//!
//! Speaks JSON to the authority:
//! - `GET {base}/orders[?since=ts]`
//! - `POST {base}/orders`
//! - `POST {base}/orders/{id}/transitions`
//! - `POST {base}/orders/{id}/assignments`
//!
//! Business-rule conflicts come back as `409` with an `error` code in the
//! body (`ALREADY_ASSIGNED`, `INVALID_TRANSITION`).

use crate::{BackendError, BackendInterface, PullResponse};
use async_trait::async_trait;
use dispatch_types::{
	http_url, truncate_id, AssignmentConfirmation, AssignmentIntent, ConfigSchema, Credentials,
	ErrorResponse, Field, FieldType, ImplementationRegistry, NewOrder, Order, OrderStatus, Schema,
	ValidationError,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Backend reached over HTTP.
pub struct HttpBackend {
	client: Client,
	base_url: String,
}

#[derive(Serialize)]
struct TransitionBody {
	status: OrderStatus,
}

#[derive(Serialize)]
struct AssignmentBody<'a> {
	partner_id: &'a str,
	token: &'a str,
}

impl HttpBackend {
	pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
		let client = Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| BackendError::Network(format!("Failed to build HTTP client: {}", e)))?;
		Ok(Self {
			client,
			base_url: base_url.trim_end_matches('/').to_string(),
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	async fn send<T: DeserializeOwned>(
		&self,
		request: RequestBuilder,
		credentials: &Credentials,
	) -> Result<T, BackendError> {
		let response = request
			.header(reqwest::header::AUTHORIZATION, credentials.bearer())
			.send()
			.await
			.map_err(|e| BackendError::Network(e.to_string()))?;

		if response.status().is_success() {
			return response
				.json::<T>()
				.await
				.map_err(|e| BackendError::Protocol(format!("Invalid response body: {}", e)));
		}
		Err(error_from_response(response).await)
	}
}

/// Maps a non-success response to a typed error.
async fn error_from_response(response: Response) -> BackendError {
	let status = response.status();
	let body = response.json::<ErrorResponse>().await.ok();
	let message = body
		.as_ref()
		.map(|b| b.message.clone())
		.unwrap_or_else(|| status.to_string());

	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Auth(message),
		StatusCode::NOT_FOUND => BackendError::NotFound(message),
		StatusCode::CONFLICT => match body.as_ref().map(|b| b.error.as_str()) {
			Some("ALREADY_ASSIGNED") => BackendError::AlreadyAssigned(message),
			Some("INVALID_TRANSITION") => BackendError::InvalidTransition(message),
			_ => BackendError::Protocol(format!("Unexpected conflict: {}", message)),
		},
		StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
			BackendError::Validation(message)
		},
		StatusCode::TOO_MANY_REQUESTS => BackendError::Network(message),
		s if s.is_server_error() => BackendError::Network(message),
		_ => BackendError::Protocol(format!("Unexpected status {}: {}", status, message)),
	}
}

#[async_trait]
impl BackendInterface for HttpBackend {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(HttpBackendSchema)
	}

	async fn pull_orders(
		&self,
		credentials: &Credentials,
		since: Option<u64>,
	) -> Result<PullResponse, BackendError> {
		let mut request = self.client.get(self.url("/orders"));
		if let Some(since) = since {
			request = request.query(&[("since", since)]);
		}
		let response: PullResponse = self.send(request, credentials).await?;
		tracing::debug!(
			orders = response.orders.len(),
			full = response.full,
			"Pulled orders"
		);
		Ok(response)
	}

	async fn create_order(
		&self,
		credentials: &Credentials,
		order: &NewOrder,
	) -> Result<Order, BackendError> {
		let request = self.client.post(self.url("/orders")).json(order);
		self.send(request, credentials).await
	}

	async fn transition(
		&self,
		credentials: &Credentials,
		order_id: &str,
		status: OrderStatus,
	) -> Result<Order, BackendError> {
		let request = self
			.client
			.post(self.url(&format!("/orders/{}/transitions", order_id)))
			.json(&TransitionBody { status });
		self.send(request, credentials).await
	}

	async fn assign(
		&self,
		credentials: &Credentials,
		intent: &AssignmentIntent,
	) -> Result<AssignmentConfirmation, BackendError> {
		tracing::debug!(
			order_id = %truncate_id(&intent.order_id),
			partner_id = %intent.partner_id,
			"Forwarding assignment intent"
		);
		let request = self
			.client
			.post(self.url(&format!("/orders/{}/assignments", intent.order_id)))
			.json(&AssignmentBody {
				partner_id: &intent.partner_id,
				token: &intent.token,
			});
		self.send(request, credentials)
			.await
			.map_err(|e| match e {
				BackendError::AlreadyAssigned(_) => {
					BackendError::AlreadyAssigned(intent.order_id.clone())
				},
				other => other,
			})
	}
}

/// Configuration schema for HttpBackend.
pub struct HttpBackendSchema;

impl ConfigSchema for HttpBackendSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(
			vec![Field::new("base_url", FieldType::String).with_validator(http_url)],
			vec![Field::new(
				"timeout_seconds",
				FieldType::Integer {
					min: Some(1),
					max: Some(300),
				},
			)],
		)
		.validate(config)
	}
}

/// Factory function to create an HTTP backend.
///
/// Configuration parameters:
/// - `base_url` (required): root URL of the authority
/// - `timeout_seconds`: per-request timeout (default: 10)
pub fn create_backend(config: &toml::Value) -> Result<Box<dyn BackendInterface>, BackendError> {
	HttpBackendSchema
		.validate(config)
		.map_err(|e| BackendError::Validation(format!("Invalid configuration: {}", e)))?;

	let base_url = config
		.get("base_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| BackendError::Validation("base_url is required".into()))?;
	let timeout = config
		.get("timeout_seconds")
		.and_then(|v| v.as_integer())
		.unwrap_or(10) as u64;

	Ok(Box::new(HttpBackend::new(
		base_url,
		Duration::from_secs(timeout),
	)?))
}

/// Registry for the HTTP backend implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "http";
	type Factory = crate::BackendFactory;

	fn factory() -> Self::Factory {
		create_backend
	}
}

impl crate::BackendRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::{
		extract::Path,
		http::{HeaderMap, StatusCode as AxumStatus},
		routing::{get, post},
		Json, Router,
	};
	use serde_json::json;

	async fn serve(router: Router) -> String {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			axum::serve(listener, router).await.unwrap();
		});
		format!("http://{}", addr)
	}

	fn credentials() -> Credentials {
		Credentials::new("c1", "secret")
	}

	#[tokio::test]
	async fn test_pull_sends_bearer_and_since() {
		let router = Router::new().route(
			"/orders",
			get(|headers: HeaderMap, query: axum::extract::RawQuery| async move {
				let auth = headers
					.get("authorization")
					.and_then(|v| v.to_str().ok())
					.unwrap_or_default()
					.to_string();
				if auth != "Bearer secret" || query.0.as_deref() != Some("since=42") {
					return (AxumStatus::UNAUTHORIZED, Json(json!({"error": "UNAUTHORIZED", "message": "no"})));
				}
				(
					AxumStatus::OK,
					Json(json!({"orders": [], "partners": [], "full": false, "server_time": 50})),
				)
			}),
		);
		let backend = HttpBackend::new(&serve(router).await, Duration::from_secs(5)).unwrap();

		let pulled = backend.pull_orders(&credentials(), Some(42)).await.unwrap();
		assert!(!pulled.full);
		assert_eq!(pulled.server_time, 50);

		let err = backend
			.pull_orders(&Credentials::new("c1", "wrong"), Some(42))
			.await
			.unwrap_err();
		assert!(matches!(err, BackendError::Auth(_)));
	}

	#[tokio::test]
	async fn test_conflict_codes_are_typed() {
		let router = Router::new()
			.route(
				"/orders/{id}/assignments",
				post(|Path(id): Path<String>| async move {
					(
						AxumStatus::CONFLICT,
						Json(json!({"error": "ALREADY_ASSIGNED", "message": format!("{} is taken", id)})),
					)
				}),
			)
			.route(
				"/orders/{id}/transitions",
				post(|| async {
					(
						AxumStatus::CONFLICT,
						Json(json!({"error": "INVALID_TRANSITION", "message": "prep-unassigned to delivered"})),
					)
				}),
			);
		let backend = HttpBackend::new(&serve(router).await, Duration::from_secs(5)).unwrap();

		let intent = AssignmentIntent {
			order_id: "o1".into(),
			partner_id: "p1".into(),
			token: "t1".into(),
		};
		assert_eq!(
			backend.assign(&credentials(), &intent).await.unwrap_err(),
			BackendError::AlreadyAssigned("o1".into())
		);
		assert!(matches!(
			backend
				.transition(&credentials(), "o1", OrderStatus::Delivered)
				.await,
			Err(BackendError::InvalidTransition(_))
		));
	}

	#[tokio::test]
	async fn test_server_errors_are_transient() {
		let router = Router::new().route(
			"/orders",
			get(|| async { AxumStatus::SERVICE_UNAVAILABLE }),
		);
		let backend = HttpBackend::new(&serve(router).await, Duration::from_secs(5)).unwrap();
		let err = backend.pull_orders(&credentials(), None).await.unwrap_err();
		assert!(err.is_transient());
	}

	#[test]
	fn test_factory_requires_http_url() {
		let config: toml::Value = toml::from_str("base_url = \"localhost\"").unwrap();
		assert!(matches!(
			create_backend(&config),
			Err(BackendError::Validation(_))
		));
	}
}
