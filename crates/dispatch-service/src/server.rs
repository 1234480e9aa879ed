//! HTTP server for the dispatch API.
//!
//! Exposes the engine handle of this client to local consumers: store
//! partitions and metrics for reading, assignment and transition requests
//! for writing.

use crate::apis::{self, order::OrderListing, to_api_error};
use axum::{
	extract::{DefaultBodyLimit, Path, State},
	http::{HeaderName, HeaderValue, Method, StatusCode},
	response::Json,
	routing::{get, post},
	Router,
};
use dispatch_config::{ApiConfig, CorsConfig};
use dispatch_core::{EngineHandle, OverlayView};
use dispatch_types::{
	APIError, AssignmentRequest, AssignmentResult, DashboardMetrics, NewOrder, Order,
	ReconcileReport, TransitionRequest,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	/// Handle to the running sync engine.
	pub engine: EngineHandle,
}

/// Starts the HTTP server and serves until it fails.
pub async fn start_server(
	api_config: ApiConfig,
	engine: EngineHandle,
) -> Result<(), Box<dyn std::error::Error>> {
	let app = router(AppState { engine })
		.layer(DefaultBodyLimit::max(api_config.max_request_size))
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(cors_layer(api_config.cors.as_ref())),
		);

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!("Dispatch API server starting on {}", bind_address);

	axum::serve(listener, app).await?;

	Ok(())
}

/// Routes under `/api`.
pub fn router(state: AppState) -> Router {
	Router::new()
		.nest(
			"/api",
			Router::new()
				.route("/orders", post(handle_submit_order))
				.route("/orders/available", get(handle_available))
				.route("/orders/active", get(handle_active))
				.route("/orders/history", get(handle_history))
				.route("/orders/{id}", get(handle_get_order))
				.route("/orders/{id}/assignments", post(handle_assignment))
				.route("/orders/{id}/transitions", post(handle_transition))
				.route("/partners/{id}/orders", get(handle_partner_orders))
				.route("/metrics", get(handle_metrics))
				.route("/overlays", get(handle_overlays))
				.route("/refresh", post(handle_refresh)),
		)
		.with_state(state)
}

/// Permissive unless origins, methods and headers are configured.
fn cors_layer(config: Option<&CorsConfig>) -> CorsLayer {
	let Some(config) = config else {
		return CorsLayer::permissive();
	};

	let origins: Vec<HeaderValue> = config
		.allowed_origins
		.iter()
		.filter_map(|origin| origin.parse().ok())
		.collect();
	let methods: Vec<Method> = config
		.allowed_methods
		.iter()
		.filter_map(|method| Method::from_bytes(method.as_bytes()).ok())
		.collect();
	let headers: Vec<HeaderName> = config
		.allowed_headers
		.iter()
		.filter_map(|header| HeaderName::from_bytes(header.as_bytes()).ok())
		.collect();

	CorsLayer::new()
		.allow_origin(origins)
		.allow_methods(methods)
		.allow_headers(headers)
}

async fn handle_available(State(state): State<AppState>) -> Json<Vec<Order>> {
	Json(apis::order::list_orders(&state.engine, OrderListing::Available))
}

async fn handle_active(State(state): State<AppState>) -> Json<Vec<Order>> {
	Json(apis::order::list_orders(&state.engine, OrderListing::Active))
}

async fn handle_history(State(state): State<AppState>) -> Json<Vec<Order>> {
	Json(apis::order::list_orders(&state.engine, OrderListing::History))
}

/// Handles GET /api/orders/{id}.
async fn handle_get_order(
	Path(id): Path<String>,
	State(state): State<AppState>,
) -> Result<Json<Order>, APIError> {
	apis::order::get_order(&state.engine, &id)
		.map(Json)
		.map_err(to_api_error)
}

async fn handle_partner_orders(
	Path(id): Path<String>,
	State(state): State<AppState>,
) -> Result<Json<Vec<Order>>, APIError> {
	apis::order::partner_orders(&state.engine, &id)
		.map(Json)
		.map_err(to_api_error)
}

/// Handles POST /api/orders. Manager clients only.
async fn handle_submit_order(
	State(state): State<AppState>,
	Json(order): Json<NewOrder>,
) -> Result<(StatusCode, Json<Order>), APIError> {
	match apis::order::submit_order(&state.engine, order).await {
		Ok(order) => Ok((StatusCode::CREATED, Json(order))),
		Err(e) => {
			tracing::warn!("Order submission failed: {}", e);
			Err(to_api_error(e))
		},
	}
}

/// Handles POST /api/orders/{id}/assignments.
///
/// A lost compare-and-swap answers 409 with the rejection as body.
async fn handle_assignment(
	Path(id): Path<String>,
	State(state): State<AppState>,
	Json(request): Json<AssignmentRequest>,
) -> Result<(StatusCode, Json<AssignmentResult>), APIError> {
	let result = apis::assignment::request_assignment(&state.engine, id, request)
		.await
		.map_err(to_api_error)?;
	let status = if result.is_accepted() {
		StatusCode::OK
	} else {
		StatusCode::CONFLICT
	};
	Ok((status, Json(result)))
}

/// Handles POST /api/orders/{id}/transitions.
async fn handle_transition(
	Path(id): Path<String>,
	State(state): State<AppState>,
	Json(request): Json<TransitionRequest>,
) -> Result<Json<Order>, APIError> {
	apis::order::transition_order(&state.engine, id, request)
		.await
		.map(Json)
		.map_err(to_api_error)
}

async fn handle_metrics(State(state): State<AppState>) -> Json<DashboardMetrics> {
	Json(state.engine.metrics())
}

async fn handle_overlays(
	State(state): State<AppState>,
) -> Result<Json<Vec<OverlayView>>, APIError> {
	state
		.engine
		.pending_overlays()
		.await
		.map(Json)
		.map_err(to_api_error)
}

/// Handles POST /api/refresh: forces a full pull.
async fn handle_refresh(State(state): State<AppState>) -> Result<Json<ReconcileReport>, APIError> {
	state
		.engine
		.refresh()
		.await
		.map(Json)
		.map_err(to_api_error)
}
