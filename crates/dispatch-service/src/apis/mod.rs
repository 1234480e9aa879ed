//! Request processing behind the HTTP routes.

pub mod assignment;
pub mod order;

use dispatch_core::SyncError;
use dispatch_types::APIError;

/// Seconds a client should wait before retrying against an offline backend.
const RETRY_AFTER_SECONDS: u64 = 5;

/// Maps an engine error onto the HTTP error surface.
pub fn to_api_error(error: SyncError) -> APIError {
	match error {
		SyncError::Network(message) => APIError::ServiceUnavailable {
			message,
			retry_after: Some(RETRY_AFTER_SECONDS),
		},
		SyncError::Auth(message) => APIError::Unauthorized { message },
		SyncError::AlreadyAssigned(order_id) => APIError::Conflict {
			error_type: "ALREADY_ASSIGNED".into(),
			message: format!("Order {} is already assigned", order_id),
		},
		SyncError::InvalidTransition(message) => APIError::Conflict {
			error_type: "INVALID_TRANSITION".into(),
			message,
		},
		SyncError::NotFound(message) => APIError::NotFound { message },
		SyncError::Validation(message) => APIError::BadRequest {
			error_type: "VALIDATION_ERROR".into(),
			message,
		},
		SyncError::EngineStopped => APIError::ServiceUnavailable {
			message: "Sync engine is not running".into(),
			retry_after: None,
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_status_codes() {
		let cases = [
			(SyncError::Network("down".into()), 503),
			(SyncError::Auth("refused".into()), 401),
			(SyncError::AlreadyAssigned("o1".into()), 409),
			(SyncError::InvalidTransition("PREP -> DELIVERED".into()), 409),
			(SyncError::NotFound("o1".into()), 404),
			(SyncError::Validation("empty id".into()), 400),
			(SyncError::EngineStopped, 503),
		];
		for (error, status) in cases {
			assert_eq!(to_api_error(error).status_code(), status);
		}
	}

	#[test]
	fn test_conflict_carries_error_code() {
		let response = to_api_error(SyncError::AlreadyAssigned("o1".into())).to_error_response();
		assert_eq!(response.error, "ALREADY_ASSIGNED");
		assert_eq!(response.retry_after, None);

		let response = to_api_error(SyncError::Network("down".into())).to_error_response();
		assert_eq!(response.retry_after, Some(RETRY_AFTER_SECONDS));
	}
}
