use std::time::Duration;
use thiserror::Error;

/// Failure reported by a module hook or a bus subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(String);

impl HookError {
	pub fn new(message: impl Into<String>) -> Self {
		Self(message.into())
	}

	pub fn message(&self) -> &str {
		&self.0
	}
}

impl From<String> for HookError {
	fn from(message: String) -> Self {
		Self(message)
	}
}

impl From<&str> for HookError {
	fn from(message: &str) -> Self {
		Self(message.to_string())
	}
}

impl From<anyhow::Error> for HookError {
	fn from(err: anyhow::Error) -> Self {
		Self(format!("{:#}", err))
	}
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
	#[error("Event bus is not active")]
	Inactive,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
	#[error("Module {0} is already registered")]
	DuplicateModule(String),

	#[error("Module {module} depends on unknown module {dependency}")]
	UnknownDependency { module: String, dependency: String },

	#[error("Cyclic dependency between modules: {}", .0.join(", "))]
	CyclicDependency(Vec<String>),

	#[error("Another control operation is in progress")]
	ControlConflict,

	#[error("Data center is already running")]
	AlreadyRunning,

	#[error("Module {module} failed to start: {message}")]
	StartHookFailure { module: String, message: String },

	#[error("Module {module} did not start within {}s", .timeout.as_secs_f64())]
	StartTimeout { module: String, timeout: Duration },

	#[error("Module {module} failed to stop: {message}")]
	StopHookFailure { module: String, message: String },

	#[error("Module {module} did not stop within {}s", .timeout.as_secs_f64())]
	StopTimeout { module: String, timeout: Duration },

	#[error(transparent)]
	Bus(#[from] BusError),
}

impl CoreError {
	/// Name of the module the error is about, if any.
	pub fn module(&self) -> Option<&str> {
		match self {
			Self::DuplicateModule(module) => Some(module.as_str()),
			Self::UnknownDependency { module, .. }
			| Self::StartHookFailure { module, .. }
			| Self::StartTimeout { module, .. }
			| Self::StopHookFailure { module, .. }
			| Self::StopTimeout { module, .. } => Some(module.as_str()),
			_ => None,
		}
	}

	/// Registration errors; any of these aborts boot.
	pub fn is_registration(&self) -> bool {
		matches!(
			self,
			Self::DuplicateModule(_) | Self::UnknownDependency { .. } | Self::CyclicDependency(_)
		)
	}
}

/// Renders a panic payload caught by `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
	if let Some(msg) = payload.downcast_ref::<&'static str>() {
		(*msg).to_string()
	} else if let Some(msg) = payload.downcast_ref::<String>() {
		msg.clone()
	} else {
		"unknown panic".to_string()
	}
}
