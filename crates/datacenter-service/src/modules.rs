//! Infrastructure modules registered by the service itself.

use datacenter_core::{EventBus, LogBroadcaster, ModuleDescriptor};
use std::sync::Arc;

pub const EVENT_BUS: &str = "EventBus";
pub const LOG_BROADCASTER: &str = "LogBroadcaster";

/// The event bus first, then the log broadcaster that relays its `log`
/// topic.
pub fn builtin_modules(bus: &EventBus, broadcaster: &LogBroadcaster) -> Vec<ModuleDescriptor> {
	vec![
		ModuleDescriptor::for_module(EVENT_BUS, Arc::new(bus.clone())),
		ModuleDescriptor::for_module(LOG_BROADCASTER, Arc::new(broadcaster.clone()))
			.depends_on([EVENT_BUS]),
	]
}
