//! Configuration for the data center runtime.
//!
//! Configuration is read from a TOML, JSON or YAML file (chosen by extension),
//! `${VAR}` placeholders are substituted from the environment, `DATACENTER_*`
//! variables override selected settings and the result is validated before
//! anything is built from it.

use thiserror::Error;

pub mod loader;
mod serde_helpers;
pub mod types;

pub use loader::{load_config, ConfigLoader, ENV_PREFIX};
pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Unsupported config format: {0}")]
	UnsupportedFormat(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}
