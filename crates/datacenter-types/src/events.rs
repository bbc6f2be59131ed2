use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LogEntry, ModuleStatus, ServiceStatus};

/// Well-known bus topics.
pub mod topics {
	/// Log records, relayed to external observers by the log broadcaster.
	pub const LOG: &str = "log";
	/// Module and aggregate status transitions.
	pub const LIFECYCLE: &str = "lifecycle";
	/// Periodic ticks emitted by the bus while it is active.
	pub const TIMER: &str = "timer";
}

/// Payload carried by the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusEvent {
	Log(LogEntry),
	Lifecycle(LifecycleEvent),
	Timer(TimerEvent),
	/// Free-form payload for collaborator-defined topics.
	Custom(serde_json::Value),
}

impl BusEvent {
	pub fn as_log(&self) -> Option<&LogEntry> {
		match self {
			Self::Log(entry) => Some(entry),
			_ => None,
		}
	}
}

impl From<LogEntry> for BusEvent {
	fn from(entry: LogEntry) -> Self {
		Self::Log(entry)
	}
}

impl From<LifecycleEvent> for BusEvent {
	fn from(event: LifecycleEvent) -> Self {
		Self::Lifecycle(event)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum LifecycleEvent {
	Module {
		name: String,
		status: ModuleStatus,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<String>,
		at: DateTime<Utc>,
	},
	Service {
		status: ServiceStatus,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<String>,
		at: DateTime<Utc>,
	},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerEvent {
	pub tick: u64,
	pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_bus_event_tagging() {
		let event = BusEvent::Lifecycle(LifecycleEvent::Module {
			name: "EventBus".into(),
			status: ModuleStatus::Running,
			error: None,
			at: Utc::now(),
		});

		let value = serde_json::to_value(&event).unwrap();
		assert_eq!(value["type"], "lifecycle");
		assert_eq!(value["data"]["scope"], "module");
		assert_eq!(value["data"]["status"], "running");
	}

	#[test]
	fn test_as_log() {
		let entry = LogEntry::info("hello");
		assert_eq!(BusEvent::from(entry.clone()).as_log(), Some(&entry));
		assert!(BusEvent::Custom(serde_json::json!({})).as_log().is_none());
	}
}
