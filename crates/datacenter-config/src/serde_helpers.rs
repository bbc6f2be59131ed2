//! Serde helpers for configuration deserialization

use datacenter_types::LogLevel;
use serde::{Deserialize, Deserializer, Serializer};

use crate::types::OverflowPolicy;

/// Accepts any casing and the `warn`/`trace` aliases, e.g. `stream_level = "info"`
pub fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
	D: Deserializer<'de>,
{
	let raw = String::deserialize(deserializer)?;
	raw.parse().map_err(serde::de::Error::custom)
}

/// Writes the level back in the lowercase form used in config files
pub fn serialize_log_level<S>(level: &LogLevel, serializer: S) -> Result<S::Ok, S::Error>
where
	S: Serializer,
{
	serializer.serialize_str(&level.as_str().to_ascii_lowercase())
}

/// Accepts `drop_oldest`, `drop-oldest` and any casing of either
pub fn deserialize_overflow_policy<'de, D>(deserializer: D) -> Result<OverflowPolicy, D::Error>
where
	D: Deserializer<'de>,
{
	let raw = String::deserialize(deserializer)?;
	raw.parse().map_err(serde::de::Error::custom)
}
