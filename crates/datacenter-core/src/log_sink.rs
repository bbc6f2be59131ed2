//! Recent log history plus hand-off to the bus `log` topic.

use crate::event_bus::EventBus;
use datacenter_types::{topics, LogEntry};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Keeps the last `capacity` entries for `GET /logs` and publishes every
/// entry on the `log` topic for live observers.
///
/// Must not emit tracing itself: it is fed by the tracing layer.
pub struct LogSink {
	history: Mutex<VecDeque<LogEntry>>,
	capacity: usize,
	bus: EventBus,
}

impl LogSink {
	/// History of at most `capacity` entries (at least one).
	pub fn new(capacity: usize, bus: EventBus) -> Self {
		let capacity = capacity.max(1);
		Self {
			history: Mutex::new(VecDeque::with_capacity(capacity)),
			capacity,
			bus,
		}
	}

	/// Appends `entry` to the history, evicting the oldest when full, then
	/// publishes it on the `log` topic.
	pub fn record(&self, entry: LogEntry) {
		{
			let mut history = self.history.lock();
			if history.len() == self.capacity {
				history.pop_front();
			}
			history.push_back(entry.clone());
		}
		self.bus.publish(topics::LOG, entry);
	}

	/// The newest `limit` entries, oldest first.
	pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
		let history = self.history.lock();
		let skip = history.len().saturating_sub(limit);
		history.iter().skip(skip).cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.history.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}
}
