//! Types for the data center HTTP API.
//!
//! Every endpoint answers with the same [`ApiResponse`] envelope: `code` is
//! zero on success, otherwise it carries the HTTP status of the failure and
//! `message` explains it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{LogEntry, ServiceState};

/// Response envelope shared by all endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
	pub code: i32,
	pub message: String,
	pub data: Option<T>,
}

impl<T> ApiResponse<T> {
	pub fn ok(message: impl Into<String>, data: T) -> Self {
		Self {
			code: 0,
			message: message.into(),
			data: Some(data),
		}
	}

	pub fn failure(code: i32, message: impl Into<String>, data: Option<T>) -> Self {
		Self {
			code,
			message: message.into(),
			data,
		}
	}

	pub fn is_success(&self) -> bool {
		self.code == 0
	}
}

pub type StateResponse = ApiResponse<ServiceState>;
pub type LogsResponse = ApiResponse<Vec<LogEntry>>;

/// Query parameters for `GET /logs`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogsQuery {
	pub limit: Option<usize>,
}

/// Payload of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
	pub healthy: bool,
	pub modules: BTreeMap<String, bool>,
}

/// Heartbeat payload of the `ping` stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
	pub time: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_failure_envelope_has_null_data() {
		let response: StateResponse = ApiResponse::failure(409, "busy", None);
		let value = serde_json::to_value(&response).unwrap();
		assert_eq!(value["code"], 409);
		assert_eq!(value["message"], "busy");
		assert!(value["data"].is_null());
		assert!(!response.is_success());
	}

	#[test]
	fn test_ok_envelope() {
		let response = ApiResponse::ok("ok", vec![LogEntry::info("a")]);
		assert!(response.is_success());
		assert_eq!(response.data.map(|d| d.len()), Some(1));
	}
}
