//! Configuration loading from files and environment.

use crate::{ConfigError, DataCenterConfig};
use regex::Regex;
use std::path::Path;
use tracing::{debug, info};

/// Prefix of the environment variables that override file settings.
pub const ENV_PREFIX: &str = "DATACENTER_";

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
	/// Load, override and validate configuration from a file.
	pub fn from_file<P: AsRef<Path>>(path: P) -> Result<DataCenterConfig, ConfigError> {
		Self::from_file_with_env(path, |key| std::env::var(key).ok())
	}

	/// Like [`ConfigLoader::from_file`], resolving environment lookups through `env`.
	pub fn from_file_with_env<P, F>(path: P, env: F) -> Result<DataCenterConfig, ConfigError>
	where
		P: AsRef<Path>,
		F: Fn(&str) -> Option<String>,
	{
		let path = path.as_ref();
		info!("Loading configuration from {:?}", path);

		if !path.exists() {
			return Err(ConfigError::FileNotFound(path.display().to_string()));
		}
		let contents = std::fs::read_to_string(path)?;
		let contents = Self::substitute_env_vars(&contents, &env)?;

		let mut config = match path.extension().and_then(|s| s.to_str()) {
			Some("toml") => Self::from_toml(&contents)?,
			Some("json") => Self::from_json(&contents)?,
			Some("yaml") | Some("yml") => Self::from_yaml(&contents)?,
			_ => return Err(ConfigError::UnsupportedFormat(path.display().to_string())),
		};

		Self::apply_env_overrides(&mut config, &env)?;
		Self::validate_config(&config)?;
		Ok(config)
	}

	/// Load from TOML string
	pub fn from_toml(contents: &str) -> Result<DataCenterConfig, ConfigError> {
		toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
	}

	/// Load from JSON string
	pub fn from_json(contents: &str) -> Result<DataCenterConfig, ConfigError> {
		serde_json::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
	}

	/// Load from YAML string
	pub fn from_yaml(contents: &str) -> Result<DataCenterConfig, ConfigError> {
		serde_yaml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
	}

	/// Defaults plus environment overrides, for running without a file.
	pub fn from_env() -> Result<DataCenterConfig, ConfigError> {
		let mut config = DataCenterConfig::default();
		Self::apply_env_overrides(&mut config, &|key: &str| std::env::var(key).ok())?;
		Self::validate_config(&config)?;
		Ok(config)
	}

	/// Replace `${VAR}` placeholders. An unset variable is an error.
	pub fn substitute_env_vars<F>(content: &str, env: &F) -> Result<String, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		// Find and replace ${VAR_NAME} patterns
		let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
			.map_err(|e| ConfigError::ParseError(e.to_string()))?;
		let mut result = String::with_capacity(content.len());
		let mut last = 0;

		for cap in re.captures_iter(content) {
			let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
				continue;
			};
			let value = env(var_name.as_str())
				.ok_or_else(|| ConfigError::EnvVarNotFound(var_name.as_str().to_string()))?;

			result.push_str(&content[last..full_match.start()]);
			result.push_str(&value);
			last = full_match.end();
		}
		result.push_str(&content[last..]);

		Ok(result)
	}

	/// Apply `DATACENTER_*` overrides for the settings operators change most.
	pub fn apply_env_overrides<F>(config: &mut DataCenterConfig, env: &F) -> Result<(), ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let var = |name: &str| env(&format!("{}{}", ENV_PREFIX, name));

		if let Some(host) = var("HOST") {
			debug!("Overriding host from environment");
			config.service.host = host;
		}

		if let Some(port) = var("PORT") {
			debug!("Overriding port from environment");
			config.service.port = port
				.parse()
				.map_err(|e| ConfigError::ValidationError(format!("Invalid port: {}", e)))?;
		}

		if let Some(level) = var("LOG_LEVEL") {
			debug!("Overriding log level from environment");
			config.monitoring.log_level = level;
		}

		if let Some(auto_start) = var("AUTO_START") {
			config.service.auto_start = match auto_start.to_ascii_lowercase().as_str() {
				"1" | "true" | "yes" | "on" => true,
				"0" | "false" | "no" | "off" => false,
				other => {
					return Err(ConfigError::ValidationError(format!(
						"Invalid auto start flag: {}",
						other
					)))
				}
			};
		}

		Ok(())
	}

	/// Validate configuration
	pub fn validate_config(config: &DataCenterConfig) -> Result<(), ConfigError> {
		let fail = |msg: String| Err(ConfigError::ValidationError(msg));

		if config.service.host.trim().is_empty() {
			return fail("service.host must not be empty".into());
		}
		if config.orchestrator.start_timeout_secs == 0 {
			return fail("orchestrator.start_timeout_secs must be greater than 0".into());
		}
		if config.orchestrator.stop_timeout_secs == 0 {
			return fail("orchestrator.stop_timeout_secs must be greater than 0".into());
		}
		if config.orchestrator.health_timeout_secs == 0 {
			return fail("orchestrator.health_timeout_secs must be greater than 0".into());
		}
		if let Some((name, _)) = config
			.orchestrator
			.module_start_timeouts
			.iter()
			.find(|(_, secs)| **secs == 0)
		{
			return fail(format!(
				"orchestrator.module_start_timeouts.{} must be greater than 0",
				name
			));
		}
		if config.event_bus.subscriber_capacity == 0 {
			return fail("event_bus.subscriber_capacity must be greater than 0".into());
		}
		if config.logs.history_size == 0 {
			return fail("logs.history_size must be greater than 0".into());
		}
		if config.logs.default_limit > config.logs.history_size {
			return fail(format!(
				"logs.default_limit ({}) exceeds logs.history_size ({})",
				config.logs.default_limit, config.logs.history_size
			));
		}
		if config.log_stream.observer_buffer == 0 {
			return fail("log_stream.observer_buffer must be greater than 0".into());
		}
		if config.log_stream.heartbeat_interval_secs == 0 {
			return fail("log_stream.heartbeat_interval_secs must be greater than 0".into());
		}

		Ok(())
	}
}

/// Load configuration from standard locations
pub fn load_config() -> Result<DataCenterConfig, ConfigError> {
	// Check for config file in order:
	// 1. Environment variable DATACENTER_CONFIG
	// 2. ./config.toml
	// 3. ./config/datacenter.toml
	// 4. Default config with env overrides

	if let Ok(path) = std::env::var(format!("{}CONFIG", ENV_PREFIX)) {
		return ConfigLoader::from_file(path);
	}

	let paths = ["./config.toml", "./config/datacenter.toml"];

	for path in &paths {
		if Path::new(path).exists() {
			return ConfigLoader::from_file(path);
		}
	}

	ConfigLoader::from_env()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::OverflowPolicy;
	use datacenter_types::LogLevel;
	use std::collections::HashMap;
	use std::io::Write;
	use std::time::Duration;

	fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		move |key| map.get(key).cloned()
	}

	#[test]
	fn test_default_config() {
		let config = DataCenterConfig::default();
		assert_eq!(config.service.port, 8001);
		assert_eq!(config.logs.default_limit, 100);
		assert_eq!(config.log_stream.reconnect_delay(), Duration::from_secs(5));
		assert!(ConfigLoader::validate_config(&config).is_ok());
	}

	#[test]
	fn test_empty_toml_is_default() {
		let config = ConfigLoader::from_toml("").unwrap();
		assert_eq!(config, DataCenterConfig::default());
	}

	#[test]
	fn test_toml_parsing() {
		let toml = r#"
[service]
name = "dc-test"
port = 9001
auto_start = true

[orchestrator]
start_timeout_secs = 20
health_timeout_secs = 2

[orchestrator.module_start_timeouts]
MarketGateway = 5

[event_bus]
subscriber_capacity = 64
overflow_policy = "drop-newest"
timer_interval_secs = 0

[logs]
stream_level = "warn"

[log_stream]
heartbeat_interval_secs = 3
"#;

		let config = ConfigLoader::from_toml(toml).unwrap();
		assert_eq!(config.service.name, "dc-test");
		assert_eq!(config.service.port, 9001);
		assert_eq!(config.service.host, "0.0.0.0");
		assert!(config.service.auto_start);
		assert_eq!(
			config.orchestrator.start_timeout_for("MarketGateway"),
			Duration::from_secs(5)
		);
		assert_eq!(
			config.orchestrator.start_timeout_for("Storage"),
			Duration::from_secs(20)
		);
		assert_eq!(config.orchestrator.health_timeout(), Duration::from_secs(2));
		assert_eq!(config.orchestrator.stop_timeout(), Duration::from_secs(10));
		assert_eq!(config.event_bus.overflow_policy, OverflowPolicy::DropNewest);
		assert!(config.event_bus.timer_interval().is_none());
		assert_eq!(config.logs.stream_level, LogLevel::Warning);
		assert_eq!(config.log_stream.heartbeat_interval_secs, 3);
	}

	#[test]
	fn test_invalid_policy_is_parse_error() {
		let err = ConfigLoader::from_toml("[event_bus]\noverflow_policy = \"block\"").unwrap_err();
		assert!(matches!(err, ConfigError::ParseError(_)));
	}

	#[test]
	fn test_validation_rejects_bad_values() {
		let mut config = DataCenterConfig::default();
		config.logs.default_limit = config.logs.history_size + 1;
		assert!(matches!(
			ConfigLoader::validate_config(&config),
			Err(ConfigError::ValidationError(_))
		));

		let mut config = DataCenterConfig::default();
		config.event_bus.subscriber_capacity = 0;
		assert!(ConfigLoader::validate_config(&config).is_err());

		let mut config = DataCenterConfig::default();
		config.orchestrator.health_timeout_secs = 0;
		let err = ConfigLoader::validate_config(&config).unwrap_err();
		assert!(err.to_string().contains("health_timeout_secs"));

		let mut config = DataCenterConfig::default();
		config
			.orchestrator
			.module_start_timeouts
			.insert("Slow".into(), 0);
		let err = ConfigLoader::validate_config(&config).unwrap_err();
		assert!(err.to_string().contains("Slow"));
	}

	#[test]
	fn test_substitute_env_vars() {
		let env = env_of(&[("DC_HOST", "10.0.0.5")]);
		let out = ConfigLoader::substitute_env_vars("host = \"${DC_HOST}\"", &env).unwrap();
		assert_eq!(out, "host = \"10.0.0.5\"");

		let err = ConfigLoader::substitute_env_vars("x = \"${MISSING}\"", &env).unwrap_err();
		assert!(matches!(err, ConfigError::EnvVarNotFound(name) if name == "MISSING"));
	}

	#[test]
	fn test_env_overrides() {
		let env = env_of(&[
			("DATACENTER_PORT", "9100"),
			("DATACENTER_AUTO_START", "yes"),
			("DATACENTER_LOG_LEVEL", "debug"),
		]);
		let mut config = DataCenterConfig::default();
		ConfigLoader::apply_env_overrides(&mut config, &env).unwrap();

		assert_eq!(config.service.port, 9100);
		assert!(config.service.auto_start);
		assert_eq!(config.monitoring.log_level, "debug");

		let bad = env_of(&[("DATACENTER_PORT", "eighty")]);
		assert!(ConfigLoader::apply_env_overrides(&mut config, &bad).is_err());
	}

	#[test]
	fn test_from_file_by_extension() {
		let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
		writeln!(toml_file, "[service]\nhost = \"${{BIND}}\"\nport = 8123").unwrap();
		let config =
			ConfigLoader::from_file_with_env(toml_file.path(), env_of(&[("BIND", "127.0.0.1")]))
				.unwrap();
		assert_eq!(config.service.bind_address(), "127.0.0.1:8123");

		let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
		writeln!(json_file, r#"{{"logs": {{"history_size": 50, "default_limit": 10}}}}"#).unwrap();
		let config = ConfigLoader::from_file_with_env(json_file.path(), env_of(&[])).unwrap();
		assert_eq!(config.logs.history_size, 50);

		let mut yaml_file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
		writeln!(yaml_file, "event_bus:\n  subscriber_capacity: 8").unwrap();
		let config = ConfigLoader::from_file_with_env(yaml_file.path(), env_of(&[])).unwrap();
		assert_eq!(config.event_bus.subscriber_capacity, 8);

		let ini_file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
		assert!(matches!(
			ConfigLoader::from_file_with_env(ini_file.path(), env_of(&[])),
			Err(ConfigError::UnsupportedFormat(_))
		));
	}

	#[test]
	fn test_missing_file() {
		assert!(matches!(
			ConfigLoader::from_file("/nonexistent/datacenter.toml"),
			Err(ConfigError::FileNotFound(_))
		));
	}
}
