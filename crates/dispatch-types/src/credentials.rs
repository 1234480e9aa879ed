//! Access credentials for the backend and the sync channel.

use crate::SecretString;
use serde::{Deserialize, Serialize};

/// Identity and bearer token of this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
	pub client_id: String,
	pub token: SecretString,
}

impl Credentials {
	pub fn new(client_id: impl Into<String>, token: impl Into<SecretString>) -> Self {
		Self {
			client_id: client_id.into(),
			token: token.into(),
		}
	}

	/// Value for an `Authorization` header.
	pub fn bearer(&self) -> String {
		self.token.with_exposed(|t| format!("Bearer {}", t))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_bearer_header_and_redaction() {
		let credentials = Credentials::new("manager-1", "s3cr3t");
		assert_eq!(credentials.bearer(), "Bearer s3cr3t");
		assert!(!format!("{:?}", credentials).contains("s3cr3t"));
	}
}
