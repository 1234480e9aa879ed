//! Assignment requests.

use dispatch_core::{EngineHandle, SyncError};
use dispatch_types::{truncate_id, AssignmentRequest, AssignmentResult};
use tracing::{info, warn};

/// Forwards a claim for `order_id` and waits for the authority's answer.
///
/// A lost race is a normal outcome and comes back as
/// [`AssignmentResult::Rejected`], not as an error.
pub async fn request_assignment(
	handle: &EngineHandle,
	order_id: String,
	request: AssignmentRequest,
) -> Result<AssignmentResult, SyncError> {
	if request.partner_id.trim().is_empty() {
		return Err(SyncError::Validation("partner_id cannot be empty".into()));
	}

	info!(
		order_id = %truncate_id(&order_id),
		partner_id = %request.partner_id,
		"Assignment requested"
	);
	let result = handle
		.request_assignment_with_token(order_id, request.partner_id, request.token)
		.await;
	match &result {
		Ok(AssignmentResult::Rejected { reason, .. }) => {
			info!(?reason, "Assignment rejected");
		},
		Ok(AssignmentResult::Accepted { .. }) => {},
		Err(e) => warn!(error = %e, "Assignment failed"),
	}
	result
}
