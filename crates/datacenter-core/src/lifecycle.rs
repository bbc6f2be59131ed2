//! Lifecycle orchestration across registered modules.
//!
//! Modules start one at a time in dependency order and stop in reverse. A
//! start failure or timeout rolls back every module started in the same
//! run. Only one control operation runs at a time; a second caller gets
//! [`CoreError::ControlConflict`] immediately.
//!
//! The aggregate [`ServiceState`] is published through an `ArcSwap` after
//! every transition, so [`Orchestrator::status`] never waits on a control
//! operation.
//!
//! Control futures should be driven to completion. Dropping one half-way
//! leaves the modules it already touched in their intermediate state.

use crate::error::{panic_message, CoreError};
use crate::event_bus::EventBus;
use crate::registry::{Hook, ModuleDescriptor, ModuleRegistry};
use arc_swap::ArcSwap;
use chrono::Utc;
use datacenter_config::OrchestratorConfig;
use datacenter_types::{
	topics, LifecycleEvent, ModuleInfo, ModuleStatus, ServiceState, ServiceStatus,
};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of a stop pass. Stop is best-effort, so module failures are
/// collected rather than returned as an error.
#[derive(Debug, Clone)]
pub struct StopReport {
	pub state: ServiceState,
	pub failures: Vec<CoreError>,
}

impl StopReport {
	pub fn is_clean(&self) -> bool {
		self.failures.is_empty()
	}
}

pub struct Orchestrator {
	registry: RwLock<ModuleRegistry>,
	state: ArcSwap<ServiceState>,
	control: tokio::sync::Mutex<()>,
	/// Modules started in the current run, in start order.
	started: Mutex<Vec<String>>,
	config: OrchestratorConfig,
	bus: Option<EventBus>,
}

impl Orchestrator {
	/// Creates an orchestrator with no modules and an aggregate status of
	/// `stopped`. `config` supplies the hook and probe timeouts.
	pub fn new(config: OrchestratorConfig) -> Self {
		Self {
			registry: RwLock::new(ModuleRegistry::new()),
			state: ArcSwap::from_pointee(ServiceState::stopped()),
			control: tokio::sync::Mutex::new(()),
			started: Mutex::new(Vec::new()),
			config,
			bus: None,
		}
	}

	/// Publish module and aggregate transitions on the `lifecycle` topic.
	pub fn with_event_bus(mut self, bus: EventBus) -> Self {
		self.bus = Some(bus);
		self
	}

	/// Adds a module. Not allowed while a control operation is running.
	pub fn register(&self, descriptor: ModuleDescriptor) -> Result<(), CoreError> {
		let _guard = self
			.control
			.try_lock()
			.map_err(|_| CoreError::ControlConflict)?;

		let name = descriptor.name.clone();
		self.registry.write().register(descriptor)?;
		self.commit(|state| {
			state
				.modules
				.insert(name.clone(), ModuleInfo::registered(name.clone()));
		});
		info!(module = %name, "Module registered");
		Ok(())
	}

	/// Latest committed state. Never blocks.
	pub fn status(&self) -> ServiceState {
		self.state.load().at(Utc::now())
	}

	/// Dependency-resolved start order of the registered modules.
	pub fn start_order(&self) -> Result<Vec<String>, CoreError> {
		self.registry.read().resolve_order()
	}

	/// The instance handle registered under `name`, if it is a `T`.
	pub fn instance<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
		let descriptor = self.registry.read().get(name)?;
		descriptor.instance.clone().downcast::<T>().ok()
	}

	/// Starts every module in dependency order.
	///
	/// A failing or timed-out start hook rolls back the modules started so
	/// far, newest first, leaves the aggregate in `error` and returns the
	/// failure. Fails fast with [`CoreError::ControlConflict`] while another
	/// control operation runs and with [`CoreError::AlreadyRunning`] when
	/// already running.
	pub async fn start(&self) -> Result<ServiceState, CoreError> {
		let _guard = self
			.control
			.try_lock()
			.map_err(|_| CoreError::ControlConflict)?;
		self.start_locked().await
	}

	/// Stops the running modules in reverse start order. Best effort: every
	/// module gets its stop hook even after another one fails, and the
	/// failures come back in the [`StopReport`]. The only error is
	/// [`CoreError::ControlConflict`].
	pub async fn stop(&self) -> Result<StopReport, CoreError> {
		let _guard = self
			.control
			.try_lock()
			.map_err(|_| CoreError::ControlConflict)?;
		Ok(self.stop_locked().await)
	}

	/// Stop then start under one hold of the control lock. Stop failures
	/// are logged and do not prevent the start attempt.
	pub async fn restart(&self) -> Result<ServiceState, CoreError> {
		let _guard = self
			.control
			.try_lock()
			.map_err(|_| CoreError::ControlConflict)?;

		info!("Restarting data center");
		let report = self.stop_locked().await;
		if !report.is_clean() {
			warn!(
				failures = report.failures.len(),
				"Continuing restart after stop failures"
			);
		}
		self.start_locked().await
	}

	/// Per-module health. Running modules report their probe, or `true`
	/// without one; every other module reports `false`. A probe that panics
	/// or outlives the health timeout reports `false`.
	pub async fn health_check(&self) -> BTreeMap<String, bool> {
		let snapshot = self.state.load_full();
		let descriptors: Vec<Arc<ModuleDescriptor>> =
			self.registry.read().descriptors().cloned().collect();

		let mut report = BTreeMap::new();
		for descriptor in descriptors {
			let running = snapshot
				.modules
				.get(&descriptor.name)
				.is_some_and(|m| m.status == ModuleStatus::Running);
			let healthy = match (&descriptor.health_probe, running) {
				(_, false) => false,
				(None, true) => true,
				(Some(probe), true) => {
					let probe = AssertUnwindSafe(probe()).catch_unwind();
					matches!(
						tokio::time::timeout(self.config.health_timeout(), probe).await,
						Ok(Ok(true))
					)
				}
			};
			report.insert(descriptor.name.clone(), healthy);
		}
		report
	}

	async fn start_locked(&self) -> Result<ServiceState, CoreError> {
		if self.state.load().status == ServiceStatus::Running {
			return Err(CoreError::AlreadyRunning);
		}

		let descriptors: Vec<Arc<ModuleDescriptor>> = {
			let registry = self.registry.read();
			registry
				.resolve_order()?
				.iter()
				.filter_map(|name| registry.get(name))
				.collect()
		};

		info!(modules = descriptors.len(), "Starting data center");
		self.commit(|state| {
			state.status = ServiceStatus::Starting;
			for descriptor in &descriptors {
				if let Some(module) = state.modules.get_mut(&descriptor.name) {
					module.status = ModuleStatus::Pending;
					module.started_at = None;
					module.error_message = None;
				}
			}
		});
		self.announce_service(ServiceStatus::Starting, None);

		let mut started: Vec<Arc<ModuleDescriptor>> = Vec::with_capacity(descriptors.len());
		for descriptor in &descriptors {
			self.set_module(&descriptor.name, ModuleStatus::Starting, None);

			if let Err(err) = self.run_start_hook(descriptor).await {
				let message = err.to_string();
				error!(module = %descriptor.name, "{}", message);
				self.set_module(&descriptor.name, ModuleStatus::Error, Some(message.clone()));

				self.rollback(&started).await;
				self.commit(|state| {
					for module in state.modules.values_mut() {
						if module.status == ModuleStatus::Pending {
							module.status = ModuleStatus::Registered;
						}
					}
					state.status = ServiceStatus::Error;
					state.start_time = None;
					state.error_message = Some(message.clone());
				});
				self.announce_service(ServiceStatus::Error, Some(message));
				return Err(err);
			}

			let now = Utc::now();
			self.commit(|state| {
				if let Some(module) = state.modules.get_mut(&descriptor.name) {
					module.status = ModuleStatus::Running;
					module.started_at = Some(now);
					module.error_message = None;
				}
			});
			self.announce_module(&descriptor.name, ModuleStatus::Running, None);
			info!(module = %descriptor.name, "Module started");
			started.push(descriptor.clone());
		}

		*self.started.lock() = started.iter().map(|d| d.name.clone()).collect();
		self.commit(|state| {
			state.status = ServiceStatus::Running;
			state.start_time = Some(Utc::now());
			state.error_message = None;
		});
		self.announce_service(ServiceStatus::Running, None);
		info!(modules = started.len(), "Data center running");
		Ok(self.status())
	}

	/// Stops the modules of a failed run, newest first.
	async fn rollback(&self, started: &[Arc<ModuleDescriptor>]) {
		if !started.is_empty() {
			warn!(modules = started.len(), "Rolling back started modules");
		}
		for descriptor in started.iter().rev() {
			if let Err(err) = self.stop_module(descriptor).await {
				warn!(module = %descriptor.name, "Rollback stop failed: {}", err);
			}
		}
	}

	async fn stop_locked(&self) -> StopReport {
		if self.state.load().status == ServiceStatus::Stopped {
			return StopReport {
				state: self.status(),
				failures: Vec::new(),
			};
		}

		info!("Stopping data center");
		self.commit(|state| state.status = ServiceStatus::Stopping);
		self.announce_service(ServiceStatus::Stopping, None);

		let names = std::mem::take(&mut *self.started.lock());
		let descriptors: Vec<Arc<ModuleDescriptor>> = {
			let registry = self.registry.read();
			names.iter().filter_map(|name| registry.get(name)).collect()
		};

		let mut failures = Vec::new();
		for descriptor in descriptors.iter().rev() {
			if let Err(err) = self.stop_module(descriptor).await {
				warn!(module = %descriptor.name, "{}", err);
				failures.push(err);
			}
		}

		self.commit(|state| {
			state.status = ServiceStatus::Stopped;
			state.start_time = None;
		});
		self.announce_service(ServiceStatus::Stopped, None);
		info!(failures = failures.len(), "Data center stopped");

		StopReport {
			state: self.status(),
			failures,
		}
	}

	/// `running → stopping → registered`, or `error` if the hook fails.
	async fn stop_module(&self, descriptor: &ModuleDescriptor) -> Result<(), CoreError> {
		self.set_module(&descriptor.name, ModuleStatus::Stopping, None);

		let result = match &descriptor.stop_hook {
			Some(hook) => {
				let limit = self.config.stop_timeout();
				match run_hook(hook, limit).await {
					HookOutcome::Done => Ok(()),
					HookOutcome::Failed(message) => Err(CoreError::StopHookFailure {
						module: descriptor.name.clone(),
						message,
					}),
					HookOutcome::TimedOut => Err(CoreError::StopTimeout {
						module: descriptor.name.clone(),
						timeout: limit,
					}),
				}
			}
			None => Ok(()),
		};

		match &result {
			Ok(()) => {
				self.commit(|state| {
					if let Some(module) = state.modules.get_mut(&descriptor.name) {
						module.status = ModuleStatus::Registered;
						module.started_at = None;
					}
				});
				self.announce_module(&descriptor.name, ModuleStatus::Registered, None);
				info!(module = %descriptor.name, "Module stopped");
			}
			Err(err) => {
				self.set_module(&descriptor.name, ModuleStatus::Error, Some(err.to_string()));
			}
		}
		result
	}

	async fn run_start_hook(&self, descriptor: &ModuleDescriptor) -> Result<(), CoreError> {
		let Some(hook) = &descriptor.start_hook else {
			return Ok(());
		};
		let limit = descriptor
			.start_timeout
			.unwrap_or_else(|| self.config.start_timeout_for(&descriptor.name));

		match run_hook(hook, limit).await {
			HookOutcome::Done => Ok(()),
			HookOutcome::Failed(message) => Err(CoreError::StartHookFailure {
				module: descriptor.name.clone(),
				message,
			}),
			HookOutcome::TimedOut => Err(CoreError::StartTimeout {
				module: descriptor.name.clone(),
				timeout: limit,
			}),
		}
	}

	fn set_module(&self, name: &str, status: ModuleStatus, error: Option<String>) {
		self.commit(|state| {
			if let Some(module) = state.modules.get_mut(name) {
				module.status = status;
				if error.is_some() {
					module.error_message = error.clone();
				}
			}
		});
		self.announce_module(name, status, error);
	}

	fn commit<F: Fn(&mut ServiceState)>(&self, update: F) {
		self.state.rcu(|current| {
			let mut next = ServiceState::clone(current);
			update(&mut next);
			next.last_update = Some(Utc::now());
			next
		});
	}

	fn announce_module(&self, name: &str, status: ModuleStatus, error: Option<String>) {
		if let Some(bus) = &self.bus {
			bus.publish(
				topics::LIFECYCLE,
				LifecycleEvent::Module {
					name: name.to_string(),
					status,
					error,
					at: Utc::now(),
				},
			);
		}
	}

	fn announce_service(&self, status: ServiceStatus, error: Option<String>) {
		if let Some(bus) = &self.bus {
			bus.publish(
				topics::LIFECYCLE,
				LifecycleEvent::Service {
					status,
					error,
					at: Utc::now(),
				},
			);
		}
	}
}

enum HookOutcome {
	Done,
	Failed(String),
	TimedOut,
}

/// Runs one hook invocation bounded by `limit`, converting panics to failures.
async fn run_hook(hook: &Hook, limit: Duration) -> HookOutcome {
	let call = AssertUnwindSafe(async { hook().await }).catch_unwind();
	match tokio::time::timeout(limit, call).await {
		Ok(Ok(Ok(()))) => HookOutcome::Done,
		Ok(Ok(Err(err))) => HookOutcome::Failed(err.to_string()),
		Ok(Err(panic)) => {
			HookOutcome::Failed(format!("hook panicked: {}", panic_message(panic.as_ref())))
		}
		Err(_) => HookOutcome::TimedOut,
	}
}
