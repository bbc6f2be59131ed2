//! The data center context owned by the process entry point.

use datacenter_config::DataCenterConfig;
use datacenter_core::{
	BusStats, CoreError, EventBus, LogBroadcaster, LogSink, ModuleDescriptor, Orchestrator,
	StopReport,
};
use datacenter_types::{HealthReport, LogEntry, ServiceState, ServiceStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Runtime counters served by `GET /statistics`.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
	pub status: ServiceStatus,
	pub uptime_seconds: i64,
	pub start_order: Vec<String>,
	/// Module count per status, keyed by the status name.
	pub modules: BTreeMap<String, usize>,
	pub bus: BusStats,
	pub observers: usize,
	pub log_history: usize,
}

/// Everything the HTTP surface and the binary need, built once at startup.
pub struct DataCenterService {
	config: DataCenterConfig,
	bus: EventBus,
	orchestrator: Orchestrator,
	log_sink: Arc<LogSink>,
	broadcaster: LogBroadcaster,
}

impl DataCenterService {
	pub fn new(config: DataCenterConfig) -> Self {
		let bus = EventBus::new(config.event_bus.clone());
		let log_sink = Arc::new(LogSink::new(config.logs.history_size, bus.clone()));
		let broadcaster = LogBroadcaster::new(bus.clone(), config.log_stream.clone());
		let orchestrator =
			Orchestrator::new(config.orchestrator.clone()).with_event_bus(bus.clone());

		Self {
			config,
			bus,
			orchestrator,
			log_sink,
			broadcaster,
		}
	}

	/// Registers the infrastructure modules the service owns.
	pub fn register_builtin_modules(&self) -> Result<(), CoreError> {
		for descriptor in crate::modules::builtin_modules(&self.bus, &self.broadcaster) {
			self.orchestrator.register(descriptor)?;
		}
		Ok(())
	}

	pub fn register(&self, descriptor: ModuleDescriptor) -> Result<(), CoreError> {
		self.orchestrator.register(descriptor)
	}

	pub fn config(&self) -> &DataCenterConfig {
		&self.config
	}

	pub fn bus(&self) -> &EventBus {
		&self.bus
	}

	pub fn orchestrator(&self) -> &Orchestrator {
		&self.orchestrator
	}

	pub fn broadcaster(&self) -> &LogBroadcaster {
		&self.broadcaster
	}

	pub fn log_sink(&self) -> Arc<LogSink> {
		self.log_sink.clone()
	}

	pub async fn start(&self) -> Result<ServiceState, CoreError> {
		self.orchestrator.start().await
	}

	pub async fn stop(&self) -> Result<StopReport, CoreError> {
		self.orchestrator.stop().await
	}

	pub async fn restart(&self) -> Result<ServiceState, CoreError> {
		self.orchestrator.restart().await
	}

	pub fn status(&self) -> ServiceState {
		self.orchestrator.status()
	}

	/// Newest entries, oldest first. `None` uses the configured default.
	pub fn recent_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
		self.log_sink
			.recent(limit.unwrap_or(self.config.logs.default_limit))
	}

	/// Healthy when at least one module is registered and every module
	/// reports healthy.
	pub async fn health(&self) -> HealthReport {
		let modules = self.orchestrator.health_check().await;
		let healthy = !modules.is_empty() && modules.values().all(|ok| *ok);
		HealthReport { healthy, modules }
	}

	pub fn statistics(&self) -> Statistics {
		let state = self.status();
		let mut modules = BTreeMap::new();
		for info in state.modules.values() {
			*modules.entry(info.status.to_string()).or_insert(0) += 1;
		}

		Statistics {
			status: state.status,
			uptime_seconds: state.uptime_seconds,
			start_order: self.orchestrator.start_order().unwrap_or_default(),
			modules,
			bus: self.bus.stats(),
			observers: self.broadcaster.observer_count(),
			log_history: self.log_sink.len(),
		}
	}

	/// Stops every module and closes open log streams. Used on process exit.
	pub async fn shutdown(&self) {
		match self.orchestrator.stop().await {
			Ok(report) if report.is_clean() => info!("All modules stopped"),
			Ok(report) => warn!(
				failures = report.failures.len(),
				"Modules stopped with failures"
			),
			Err(e) => warn!(error = %e, "Could not stop modules"),
		}
		// Streams must end or the HTTP server waits on them forever.
		self.broadcaster.detach().await;
	}
}
