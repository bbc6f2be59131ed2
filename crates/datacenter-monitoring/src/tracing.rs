use crate::log_layer::{level_filter, LogForwardLayer, LogSinkFn};
use datacenter_config::{LogsConfig, MonitoringConfig};
use datacenter_types::LogLevel;
use tracing::info;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Tracing configuration
#[derive(Clone)]
pub struct TracingConfig {
	/// Console filter directive; `RUST_LOG` wins when set.
	pub filter: String,
	pub json_format: bool,
	pub with_target: bool,
	pub with_thread_ids: bool,
	pub with_file_and_line: bool,
	/// Minimum level handed to the forwarding sink.
	pub forward_level: LogLevel,
	pub forward: Option<LogSinkFn>,
}

impl Default for TracingConfig {
	fn default() -> Self {
		Self {
			filter: "info".to_string(),
			json_format: false,
			with_target: true,
			with_thread_ids: false,
			with_file_and_line: false,
			forward_level: LogLevel::Info,
			forward: None,
		}
	}
}

impl TracingConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_settings(monitoring: &MonitoringConfig, logs: &LogsConfig) -> Self {
		Self {
			filter: monitoring.log_level.clone(),
			json_format: monitoring.json_format,
			forward_level: logs.stream_level,
			..Self::default()
		}
	}

	pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
		self.filter = filter.into();
		self
	}

	pub fn with_json_format(mut self, json: bool) -> Self {
		self.json_format = json;
		self
	}

	/// Also send every event at `forward_level` or above to `sink`.
	pub fn with_forwarding(mut self, sink: LogSinkFn) -> Self {
		self.forward = Some(sink);
		self
	}

	pub fn debug() -> Self {
		Self::default().with_filter("debug")
	}

	pub fn production() -> Self {
		Self {
			with_target: false,
			json_format: true,
			..Self::default()
		}
	}
}

/// Initialize tracing with the given configuration
pub fn init_tracing(config: TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
	let filter = match EnvFilter::try_from_default_env() {
		Ok(filter) => filter,
		Err(_) => EnvFilter::try_new(&config.filter)
			.map_err(|e| format!("Invalid log filter '{}': {}", config.filter, e))?,
	};

	let console: Box<dyn Layer<Registry> + Send + Sync> = if config.json_format {
		tracing_subscriber::fmt::layer()
			.json()
			.with_thread_ids(config.with_thread_ids)
			.with_file(config.with_file_and_line)
			.with_line_number(config.with_file_and_line)
			.with_target(config.with_target)
			.boxed()
	} else {
		tracing_subscriber::fmt::layer()
			.compact()
			.with_thread_ids(config.with_thread_ids)
			.with_file(config.with_file_and_line)
			.with_line_number(config.with_file_and_line)
			.with_target(config.with_target)
			.boxed()
	};

	let forward = config
		.forward
		.clone()
		.map(|sink| LogForwardLayer::new(sink).with_filter(level_filter(config.forward_level)));

	tracing_subscriber::registry()
		.with(console.with_filter(filter))
		.with(forward)
		.try_init()
		.map_err(|e| format!("Failed to initialize tracing: {}", e))?;

	info!(
		filter = %config.filter,
		json = config.json_format,
		forward_level = %config.forward_level,
		"Tracing initialized"
	);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_from_settings() {
		let monitoring = MonitoringConfig {
			log_level: "datacenter_core=debug,info".to_string(),
			json_format: true,
		};
		let logs = LogsConfig {
			stream_level: LogLevel::Warning,
			..Default::default()
		};

		let config = TracingConfig::from_settings(&monitoring, &logs);
		assert_eq!(config.filter, "datacenter_core=debug,info");
		assert!(config.json_format);
		assert_eq!(config.forward_level, LogLevel::Warning);
		assert!(config.forward.is_none());
	}

	#[test]
	fn test_invalid_filter_is_rejected() {
		if std::env::var("RUST_LOG").is_ok() {
			return;
		}
		let err = init_tracing(TracingConfig::new().with_filter("datacenter=loud")).unwrap_err();
		assert!(err.to_string().contains("Invalid log filter"));
	}
}
