//! Structured log records exposed through the history query and the live stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Keys owned by [`LogEntry`] itself; extra fields may not shadow them.
const RESERVED_KEYS: [&str; 3] = ["timestamp", "level", "message"];

/// Severity of a [`LogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
	Debug,
	Info,
	Warning,
	Error,
}

impl LogLevel {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Debug => "DEBUG",
			Self::Info => "INFO",
			Self::Warning => "WARNING",
			Self::Error => "ERROR",
		}
	}
}

impl fmt::Display for LogLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Error)]
#[error("Unknown log level: {0}")]
pub struct ParseLogLevelError(String);

impl FromStr for LogLevel {
	type Err = ParseLogLevelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_uppercase().as_str() {
			"TRACE" | "DEBUG" => Ok(Self::Debug),
			"INFO" => Ok(Self::Info),
			"WARN" | "WARNING" => Ok(Self::Warning),
			"ERROR" => Ok(Self::Error),
			_ => Err(ParseLogLevelError(s.to_string())),
		}
	}
}

/// A single log record.
///
/// Additional structured fields are flattened next to the fixed ones when
/// serialized, so a record with a `module` field renders as
/// `{"timestamp": .., "level": "INFO", "message": .., "module": "EventBus"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
	pub timestamp: DateTime<Utc>,
	pub level: LogLevel,
	pub message: String,
	#[serde(flatten)]
	pub fields: Map<String, Value>,
}

impl LogEntry {
	pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
		Self {
			timestamp: Utc::now(),
			level,
			message: message.into(),
			fields: Map::new(),
		}
	}

	pub fn debug(message: impl Into<String>) -> Self {
		Self::new(LogLevel::Debug, message)
	}

	pub fn info(message: impl Into<String>) -> Self {
		Self::new(LogLevel::Info, message)
	}

	pub fn warning(message: impl Into<String>) -> Self {
		Self::new(LogLevel::Warning, message)
	}

	pub fn error(message: impl Into<String>) -> Self {
		Self::new(LogLevel::Error, message)
	}

	/// Attaches an extra field. A later value for the same key replaces the
	/// earlier one; keys colliding with the fixed fields get an `extra_` prefix.
	pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.insert_field(key, value);
		self
	}

	pub fn insert_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
		let key = key.into();
		let key = if RESERVED_KEYS.contains(&key.as_str()) {
			format!("extra_{}", key)
		} else {
			key
		};
		self.fields.insert(key, value.into());
	}

	pub fn field(&self, key: &str) -> Option<&Value> {
		self.fields.get(key)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_extra_fields_are_flattened() {
		let entry = LogEntry::info("Module started")
			.with_field("module", "EventBus")
			.with_field("elapsed_ms", 12);

		let value = serde_json::to_value(&entry).unwrap();
		assert_eq!(value["level"], "INFO");
		assert_eq!(value["message"], "Module started");
		assert_eq!(value["module"], "EventBus");
		assert_eq!(value["elapsed_ms"], 12);
		assert!(value["timestamp"].as_str().is_some());

		let parsed: LogEntry = serde_json::from_value(value).unwrap();
		assert_eq!(parsed.field("module"), Some(&Value::from("EventBus")));
	}

	#[test]
	fn test_reserved_keys_do_not_shadow() {
		let entry = LogEntry::warning("real message").with_field("message", "shadow");

		assert_eq!(entry.message, "real message");
		assert_eq!(entry.field("extra_message"), Some(&Value::from("shadow")));
		let value = serde_json::to_value(&entry).unwrap();
		assert_eq!(value["message"], "real message");
	}

	#[test]
	fn test_duplicate_keys_keep_last_value() {
		let entry = LogEntry::debug("x").with_field("k", 1).with_field("k", 2);
		assert_eq!(entry.fields.len(), 1);
		assert_eq!(entry.field("k"), Some(&Value::from(2)));
	}

	#[test]
	fn test_level_parsing() {
		assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warning);
		assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warning);
		assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Debug);
		assert!("verbose".parse::<LogLevel>().is_err());
		assert!(LogLevel::Error > LogLevel::Info);
	}
}
