//! Configuration types for the data center runtime.
//!
//! Every section and every field has a default, so an empty file is a valid
//! configuration.

use crate::serde_helpers::{
	deserialize_log_level, deserialize_overflow_policy, serialize_log_level,
};
use datacenter_types::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DataCenterConfig {
	pub service: ServiceSettings,
	pub orchestrator: OrchestratorConfig,
	pub event_bus: EventBusConfig,
	pub logs: LogsConfig,
	pub log_stream: LogStreamConfig,
	pub monitoring: MonitoringConfig,
}

/// HTTP listener and boot behaviour.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSettings {
	/// Instance name, used in log output
	pub name: String,
	/// Bind address of the HTTP surface
	pub host: String,
	/// Bind port of the HTTP surface
	pub port: u16,
	/// Start all modules as soon as the process is up
	pub auto_start: bool,
}

impl Default for ServiceSettings {
	fn default() -> Self {
		Self {
			name: "datacenter".to_string(),
			host: "0.0.0.0".to_string(),
			port: 8001,
			auto_start: false,
		}
	}
}

impl ServiceSettings {
	pub fn bind_address(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
	/// Default bound on a single start hook
	pub start_timeout_secs: u64,
	/// Bound on a single stop hook
	pub stop_timeout_secs: u64,
	/// Bound on a single health probe
	pub health_timeout_secs: u64,
	/// Per-module start timeout overrides, keyed by module name
	pub module_start_timeouts: HashMap<String, u64>,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			start_timeout_secs: 30,
			stop_timeout_secs: 10,
			health_timeout_secs: 5,
			module_start_timeouts: HashMap::new(),
		}
	}
}

impl OrchestratorConfig {
	/// Start timeout for `module`, falling back to the global default.
	pub fn start_timeout_for(&self, module: &str) -> Duration {
		let secs = self
			.module_start_timeouts
			.get(module)
			.copied()
			.unwrap_or(self.start_timeout_secs);
		Duration::from_secs(secs)
	}

	pub fn start_timeout(&self) -> Duration {
		Duration::from_secs(self.start_timeout_secs)
	}

	pub fn stop_timeout(&self) -> Duration {
		Duration::from_secs(self.stop_timeout_secs)
	}

	pub fn health_timeout(&self) -> Duration {
		Duration::from_secs(self.health_timeout_secs)
	}
}

/// What a full subscriber buffer does with the next event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
	/// Evict the oldest queued event to make room.
	#[default]
	DropOldest,
	/// Discard the incoming event.
	DropNewest,
}

impl fmt::Display for OverflowPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::DropOldest => write!(f, "drop_oldest"),
			Self::DropNewest => write!(f, "drop_newest"),
		}
	}
}

impl FromStr for OverflowPolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().replace('-', "_").as_str() {
			"drop_oldest" => Ok(Self::DropOldest),
			"drop_newest" => Ok(Self::DropNewest),
			other => Err(format!("unknown overflow policy '{}'", other)),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EventBusConfig {
	/// Default buffer size of a subscription
	pub subscriber_capacity: usize,
	/// Default overload policy of a subscription
	#[serde(deserialize_with = "deserialize_overflow_policy")]
	pub overflow_policy: OverflowPolicy,
	/// Period of the `timer` topic; 0 disables it
	pub timer_interval_secs: u64,
}

impl Default for EventBusConfig {
	fn default() -> Self {
		Self {
			subscriber_capacity: 1024,
			overflow_policy: OverflowPolicy::DropOldest,
			timer_interval_secs: 1,
		}
	}
}

impl EventBusConfig {
	pub fn timer_interval(&self) -> Option<Duration> {
		(self.timer_interval_secs > 0).then(|| Duration::from_secs(self.timer_interval_secs))
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogsConfig {
	/// Entries retained for `GET /logs`
	pub history_size: usize,
	/// `limit` used when the query omits it
	pub default_limit: usize,
	/// Minimum level forwarded into the history and the live stream
	#[serde(
		deserialize_with = "deserialize_log_level",
		serialize_with = "serialize_log_level"
	)]
	pub stream_level: LogLevel,
}

impl Default for LogsConfig {
	fn default() -> Self {
		Self {
			history_size: 1000,
			default_limit: 100,
			stream_level: LogLevel::Info,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogStreamConfig {
	pub observer_buffer: usize,
	pub heartbeat_interval_secs: u64,
	pub reconnect_delay_secs: u64,
	/// Observers that lose more entries than this are disconnected; 0 never
	pub max_dropped_per_observer: u64,
}

impl Default for LogStreamConfig {
	fn default() -> Self {
		Self {
			observer_buffer: 256,
			heartbeat_interval_secs: 15,
			reconnect_delay_secs: 5,
			max_dropped_per_observer: 10_000,
		}
	}
}

impl LogStreamConfig {
	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_secs(self.heartbeat_interval_secs)
	}

	pub fn reconnect_delay(&self) -> Duration {
		Duration::from_secs(self.reconnect_delay_secs)
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
	/// Filter directive for console output, e.g. `info` or `datacenter_core=debug`
	pub log_level: String,
	/// Emit JSON lines instead of human-readable output
	pub json_format: bool,
}

impl Default for MonitoringConfig {
	fn default() -> Self {
		Self {
			log_level: "info".to_string(),
			json_format: false,
		}
	}
}
