//! Aggregate service state and per-module snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Aggregate status of the whole data center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
	Stopped,
	Starting,
	Running,
	Stopping,
	Error,
}

impl fmt::Display for ServiceStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Stopped => write!(f, "stopped"),
			Self::Starting => write!(f, "starting"),
			Self::Running => write!(f, "running"),
			Self::Stopping => write!(f, "stopping"),
			Self::Error => write!(f, "error"),
		}
	}
}

/// Status of a single registered module.
///
/// `Stopping` is transient: a module passes through it between `Running`
/// and `Registered` while its stop hook executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
	Registered,
	Pending,
	Starting,
	Running,
	Stopping,
	Error,
}

impl fmt::Display for ModuleStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Registered => write!(f, "registered"),
			Self::Pending => write!(f, "pending"),
			Self::Starting => write!(f, "starting"),
			Self::Running => write!(f, "running"),
			Self::Stopping => write!(f, "stopping"),
			Self::Error => write!(f, "error"),
		}
	}
}

/// Point-in-time view of one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
	pub name: String,
	pub status: ModuleStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub started_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
}

impl ModuleInfo {
	pub fn registered(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			status: ModuleStatus::Registered,
			started_at: None,
			error_message: None,
		}
	}
}

/// Aggregate state of the data center, as returned by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
	pub status: ServiceStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub start_time: Option<DateTime<Utc>>,
	#[serde(default)]
	pub uptime_seconds: i64,
	#[serde(default)]
	pub modules: BTreeMap<String, ModuleInfo>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error_message: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_update: Option<DateTime<Utc>>,
}

impl ServiceState {
	pub fn stopped() -> Self {
		Self {
			status: ServiceStatus::Stopped,
			start_time: None,
			uptime_seconds: 0,
			modules: BTreeMap::new(),
			error_message: None,
			last_update: Some(Utc::now()),
		}
	}

	/// Returns a copy with `uptime_seconds` derived for `now`.
	///
	/// Uptime is only non-zero while the service is running.
	pub fn at(&self, now: DateTime<Utc>) -> Self {
		let mut state = self.clone();
		state.uptime_seconds = match (state.status, state.start_time) {
			(ServiceStatus::Running, Some(start)) => (now - start).num_seconds().max(0),
			_ => 0,
		};
		state
	}

	pub fn count_modules(&self, status: ModuleStatus) -> usize {
		self.modules.values().filter(|m| m.status == status).count()
	}
}

impl Default for ServiceState {
	fn default() -> Self {
		Self::stopped()
	}
}
