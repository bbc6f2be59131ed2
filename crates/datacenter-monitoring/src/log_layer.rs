//! Tracing layer that forwards log events as [`LogEntry`] records.

use datacenter_types::{LogEntry, LogLevel};
use serde_json::{Map, Value};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer};

/// Receives every forwarded entry.
pub type LogSinkFn = Arc<dyn Fn(LogEntry) + Send + Sync>;

thread_local! {
	static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Resets the re-entrancy flag, also when the sink panics.
struct ForwardGuard;

impl ForwardGuard {
	fn enter() -> Option<Self> {
		FORWARDING.with(|flag| {
			if flag.get() {
				None
			} else {
				flag.set(true);
				Some(ForwardGuard)
			}
		})
	}
}

impl Drop for ForwardGuard {
	fn drop(&mut self) {
		FORWARDING.with(|flag| flag.set(false));
	}
}

/// Converts tracing events to [`LogEntry`] and hands them to a sink.
///
/// The `message` field becomes the entry message, other fields become extra
/// fields and the event target is kept as `target`. Events emitted by the
/// sink itself are not forwarded again.
pub struct LogForwardLayer {
	sink: LogSinkFn,
}

impl LogForwardLayer {
	pub fn new(sink: LogSinkFn) -> Self {
		Self { sink }
	}
}

impl<S: Subscriber> Layer<S> for LogForwardLayer {
	fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
		let Some(_guard) = ForwardGuard::enter() else {
			return;
		};

		let metadata = event.metadata();
		let mut visitor = FieldVisitor::default();
		event.record(&mut visitor);

		let mut entry = LogEntry::new(
			log_level(metadata.level()),
			visitor.message.unwrap_or_default(),
		);
		for (key, value) in visitor.fields {
			entry.insert_field(key, value);
		}
		entry.insert_field("target", metadata.target());

		(self.sink)(entry);
	}
}

pub fn log_level(level: &Level) -> LogLevel {
	if *level == Level::ERROR {
		LogLevel::Error
	} else if *level == Level::WARN {
		LogLevel::Warning
	} else if *level == Level::INFO {
		LogLevel::Info
	} else {
		LogLevel::Debug
	}
}

/// Tracing filter that passes `level` and everything more severe.
pub fn level_filter(level: LogLevel) -> LevelFilter {
	match level {
		LogLevel::Debug => LevelFilter::DEBUG,
		LogLevel::Info => LevelFilter::INFO,
		LogLevel::Warning => LevelFilter::WARN,
		LogLevel::Error => LevelFilter::ERROR,
	}
}

#[derive(Default)]
struct FieldVisitor {
	message: Option<String>,
	fields: Map<String, Value>,
}

impl FieldVisitor {
	fn put(&mut self, field: &Field, value: Value) {
		if field.name() == "message" {
			self.message = Some(match value {
				Value::String(s) => s,
				other => other.to_string(),
			});
		} else {
			self.fields.insert(field.name().to_string(), value);
		}
	}
}

impl Visit for FieldVisitor {
	fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
		self.put(field, Value::String(format!("{:?}", value)));
	}

	fn record_str(&mut self, field: &Field, value: &str) {
		self.put(field, Value::String(value.to_string()));
	}

	fn record_i64(&mut self, field: &Field, value: i64) {
		self.put(field, Value::from(value));
	}

	fn record_u64(&mut self, field: &Field, value: u64) {
		self.put(field, Value::from(value));
	}

	fn record_f64(&mut self, field: &Field, value: f64) {
		self.put(field, Value::from(value));
	}

	fn record_bool(&mut self, field: &Field, value: bool) {
		self.put(field, Value::from(value));
	}

	fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
		self.put(field, Value::String(value.to_string()));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;
	use tracing_subscriber::layer::SubscriberExt;

	fn capture() -> (LogSinkFn, Arc<Mutex<Vec<LogEntry>>>) {
		let entries = Arc::new(Mutex::new(Vec::new()));
		let sink_entries = entries.clone();
		let sink: LogSinkFn = Arc::new(move |entry: LogEntry| sink_entries.lock().unwrap().push(entry));
		(sink, entries)
	}

	#[test]
	fn test_event_becomes_log_entry() {
		let (sink, entries) = capture();
		let subscriber = tracing_subscriber::registry().with(LogForwardLayer::new(sink));

		tracing::subscriber::with_default(subscriber, || {
			tracing::warn!(module = "Storage", retries = 3u64, "Flush slow: {}ms", 250);
		});

		let entries = entries.lock().unwrap();
		assert_eq!(entries.len(), 1);
		let entry = &entries[0];
		assert_eq!(entry.level, LogLevel::Warning);
		assert_eq!(entry.message, "Flush slow: 250ms");
		assert_eq!(entry.field("module"), Some(&Value::from("Storage")));
		assert_eq!(entry.field("retries"), Some(&Value::from(3u64)));
		assert!(entry.field("target").is_some());
	}

	#[test]
	fn test_level_filter_applies() {
		let (sink, entries) = capture();
		let subscriber = tracing_subscriber::registry()
			.with(LogForwardLayer::new(sink).with_filter(level_filter(LogLevel::Info)));

		tracing::subscriber::with_default(subscriber, || {
			tracing::debug!("noise");
			tracing::info!("signal");
			tracing::error!("alarm");
		});

		let levels: Vec<LogLevel> = entries.lock().unwrap().iter().map(|e| e.level).collect();
		assert_eq!(levels, vec![LogLevel::Info, LogLevel::Error]);
	}

	#[test]
	fn test_events_from_sink_are_not_forwarded() {
		let entries = Arc::new(Mutex::new(Vec::new()));
		let sink_entries = entries.clone();
		let sink: LogSinkFn = Arc::new(move |entry: LogEntry| {
			tracing::info!("sink saw {}", entry.message);
			sink_entries.lock().unwrap().push(entry);
		});
		let subscriber = tracing_subscriber::registry().with(LogForwardLayer::new(sink));

		tracing::subscriber::with_default(subscriber, || {
			tracing::info!("outer");
		});

		let entries = entries.lock().unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].message, "outer");
	}

	#[test]
	fn test_level_mapping() {
		assert_eq!(log_level(&Level::TRACE), LogLevel::Debug);
		assert_eq!(log_level(&Level::WARN), LogLevel::Warning);
		assert_eq!(level_filter(LogLevel::Warning), LevelFilter::WARN);
	}
}
