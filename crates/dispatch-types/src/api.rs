//! Request and response types of the consumer HTTP API.

use crate::{OrderId, OrderStatus, PartnerId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Body of `POST /api/orders/{id}/assignments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRequest {
	pub partner_id: PartnerId,
	/// Reuse a token when retrying a previous request.
	#[serde(default)]
	pub token: Option<String>,
}

/// Outcome of an assignment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AssignmentResult {
	Accepted {
		order_id: OrderId,
		partner_id: PartnerId,
	},
	Rejected {
		order_id: OrderId,
		reason: RejectionReason,
	},
}

impl AssignmentResult {
	pub fn is_accepted(&self) -> bool {
		matches!(self, AssignmentResult::Accepted { .. })
	}
}

/// Business-rule reason for refusing an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
	AlreadyAssigned,
}

/// Body of `POST /api/orders/{id}/transitions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
	pub status: OrderStatus,
}

/// API error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	/// Machine readable code.
	pub error: String,
	pub message: String,
	#[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
	pub retry_after: Option<u64>,
}

/// Structured API error with HTTP status mapping.
#[derive(Debug)]
pub enum APIError {
	/// Malformed request (400).
	BadRequest { error_type: String, message: String },
	/// Credentials refused upstream (401).
	Unauthorized { message: String },
	/// Unknown order or partner (404).
	NotFound { message: String },
	/// Business-rule conflict such as ALREADY_ASSIGNED (409).
	Conflict { error_type: String, message: String },
	/// Backend unreachable after retries (503).
	ServiceUnavailable {
		message: String,
		retry_after: Option<u64>,
	},
}

impl APIError {
	pub fn status_code(&self) -> u16 {
		match self {
			APIError::BadRequest { .. } => 400,
			APIError::Unauthorized { .. } => 401,
			APIError::NotFound { .. } => 404,
			APIError::Conflict { .. } => 409,
			APIError::ServiceUnavailable { .. } => 503,
		}
	}

	pub fn to_error_response(&self) -> ErrorResponse {
		let (error, message, retry_after) = match self {
			APIError::BadRequest {
				error_type,
				message,
			} => (error_type.clone(), message.clone(), None),
			APIError::Unauthorized { message } => ("UNAUTHORIZED".into(), message.clone(), None),
			APIError::NotFound { message } => ("NOT_FOUND".into(), message.clone(), None),
			APIError::Conflict {
				error_type,
				message,
			} => (error_type.clone(), message.clone(), None),
			APIError::ServiceUnavailable {
				message,
				retry_after,
			} => ("SERVICE_UNAVAILABLE".into(), message.clone(), *retry_after),
		};
		ErrorResponse {
			error,
			message,
			retry_after,
		}
	}
}

impl fmt::Display for APIError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let response = self.to_error_response();
		write!(f, "{} ({}): {}", response.error, self.status_code(), response.message)
	}
}

impl std::error::Error for APIError {}

impl axum::response::IntoResponse for APIError {
	fn into_response(self) -> axum::response::Response {
		use axum::{http::StatusCode, response::Json};

		let status = StatusCode::from_u16(self.status_code())
			.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		(status, Json(self.to_error_response())).into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_assignment_result_wire_format() {
		let rejected = AssignmentResult::Rejected {
			order_id: "o1".to_string(),
			reason: RejectionReason::AlreadyAssigned,
		};
		let json = serde_json::to_value(&rejected).unwrap();
		assert_eq!(json["status"], "rejected");
		assert_eq!(json["reason"], "ALREADY_ASSIGNED");
		assert!(!rejected.is_accepted());
	}

	#[test]
	fn test_conflict_maps_to_409() {
		let err = APIError::Conflict {
			error_type: "ALREADY_ASSIGNED".to_string(),
			message: "order o1 is taken".to_string(),
		};
		assert_eq!(err.status_code(), 409);
		assert_eq!(err.to_error_response().error, "ALREADY_ASSIGNED");
	}
}
