//! Helper utilities for common operations.

/// Current UNIX timestamp in seconds, 0 if the clock is before the epoch.
pub fn current_timestamp() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// Fresh idempotency token for an assignment intent.
pub fn new_token() -> String {
	uuid::Uuid::new_v4().to_string()
}
