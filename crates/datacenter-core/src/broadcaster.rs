//! Fan-out of the bus `log` topic to external observers.
//!
//! The broadcaster holds a single subscription on the bus and copies each
//! log envelope into one drop-oldest channel per observer. Observers only
//! see entries published after they connected. A quiet connection gets a
//! ping every heartbeat interval. An observer that loses more than
//! `max_dropped_per_observer` entries between two deliveries is
//! disconnected; dropping the observer stream unregisters it.
//!
//! When the bus stops, the broadcaster's subscription ends and every
//! observer stream is closed. The dispatch loop then waits for the bus to
//! come back.

use crate::error::HookError;
use crate::event_bus::{EventBus, SharedEnvelope, SubscribeOptions, Subscription};
use crate::queue::{self, QueueSender};
use crate::registry::Module;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use datacenter_config::{LogStreamConfig, OverflowPolicy};
use datacenter_types::{topics, Heartbeat, LogEntry};
use futures::Stream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One frame of an observer stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
	Log(LogEntry),
	Ping(Heartbeat),
}

impl StreamFrame {
	/// Event name on the wire.
	pub fn event_name(&self) -> &'static str {
		match self {
			Self::Log(_) => "log",
			Self::Ping(_) => "ping",
		}
	}
}

struct Observer {
	sender: QueueSender<SharedEnvelope>,
	/// Bus sequence at connect time; older envelopes are never forwarded.
	since_seq: u64,
}

struct Dispatch {
	token: CancellationToken,
	task: JoinHandle<()>,
}

struct BroadcasterInner {
	bus: EventBus,
	observers: DashMap<u64, Observer>,
	next_id: AtomicU64,
	config: LogStreamConfig,
	dispatch: Mutex<Option<Dispatch>>,
}

impl BroadcasterInner {
	fn fan_out(&self, envelope: &SharedEnvelope) {
		if envelope.event.as_log().is_none() {
			return;
		}

		for observer in self.observers.iter() {
			if envelope.seq > observer.since_seq {
				observer.sender.push(envelope.clone());
			}
		}
	}

	/// Drops every sending half; each observer stream drains and ends.
	fn close_all(&self) -> usize {
		let mut closed = 0;
		self.observers.retain(|_, _| {
			closed += 1;
			false
		});
		closed
	}
}

/// Relays bus log entries to any number of observers.
#[derive(Clone)]
pub struct LogBroadcaster {
	inner: Arc<BroadcasterInner>,
}

impl LogBroadcaster {
	/// Creates a detached broadcaster over `bus`. Nothing is relayed until
	/// [`attach`](Self::attach).
	pub fn new(bus: EventBus, config: LogStreamConfig) -> Self {
		Self {
			inner: Arc::new(BroadcasterInner {
				bus,
				observers: DashMap::new(),
				next_id: AtomicU64::new(0),
				config,
				dispatch: Mutex::new(None),
			}),
		}
	}

	/// Starts relaying. Subscribes right away when the bus is active, so
	/// entries published after `attach` returns reach connected observers.
	pub fn attach(&self) {
		let mut dispatch = self.inner.dispatch.lock();
		if dispatch.is_some() {
			return;
		}

		let token = CancellationToken::new();
		let initial = self.inner.bus.subscribe(topics::LOG, log_subscription()).ok();
		let task = tokio::spawn(dispatch_loop(self.inner.clone(), initial, token.clone()));
		*dispatch = Some(Dispatch { token, task });
	}

	/// Stops relaying and closes every observer stream.
	pub async fn detach(&self) {
		let dispatch = self.inner.dispatch.lock().take();
		if let Some(dispatch) = dispatch {
			dispatch.token.cancel();
			let _ = dispatch.task.await;
		}
		let closed = self.inner.close_all();
		info!(observers = closed, "Log broadcaster detached");
	}

	pub fn is_attached(&self) -> bool {
		self.inner.dispatch.lock().is_some()
	}

	/// Observers currently connected.
	pub fn observer_count(&self) -> usize {
		self.inner.observers.len()
	}

	/// Registers an observer and returns its frame stream.
	///
	/// The stream ends when the broadcaster detaches, the bus stops or the
	/// observer falls too far behind. Dropping it disconnects the observer.
	pub fn connect(&self) -> impl Stream<Item = StreamFrame> + Send + 'static {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
		let (sender, mut receiver) =
			queue::bounded(self.inner.config.observer_buffer, OverflowPolicy::DropOldest);
		self.inner.observers.insert(
			id,
			Observer {
				sender,
				since_seq: self.inner.bus.current_seq(),
			},
		);
		debug!(observer = id, "Log observer connected");

		let guard = ObserverGuard {
			id,
			inner: Arc::downgrade(&self.inner),
		};
		let heartbeat = self.inner.config.heartbeat_interval();
		let limit = self.inner.config.max_dropped_per_observer;

		async_stream::stream! {
			let _guard = guard;
			loop {
				match tokio::time::timeout(heartbeat, receiver.recv()).await {
					Ok(Some(envelope)) => {
						let missed = receiver.missed();
						if limit > 0 && missed > limit {
							warn!(observer = id, missed, "Disconnecting slow log observer");
							break;
						}
						if let Some(entry) = envelope.event.as_log() {
							yield StreamFrame::Log(entry.clone());
						}
					}
					Ok(None) => break,
					Err(_) => yield StreamFrame::Ping(Heartbeat { time: Utc::now() }),
				}
			}
		}
	}
}

fn log_subscription() -> SubscribeOptions {
	SubscribeOptions::default().named("log-broadcaster")
}

struct ObserverGuard {
	id: u64,
	inner: Weak<BroadcasterInner>,
}

impl Drop for ObserverGuard {
	fn drop(&mut self) {
		if let Some(inner) = self.inner.upgrade() {
			inner.observers.remove(&self.id);
		}
	}
}

async fn dispatch_loop(
	inner: Arc<BroadcasterInner>,
	mut subscription: Option<Subscription>,
	token: CancellationToken,
) {
	loop {
		let mut current = match subscription.take() {
			Some(subscription) => subscription,
			None => {
				let active = tokio::select! {
					_ = token.cancelled() => break,
					active = inner.bus.wait_active() => active,
				};
				if !active {
					break;
				}
				match inner.bus.subscribe(topics::LOG, log_subscription()) {
					Ok(subscription) => subscription,
					// Stopped again in between; wait for the next start.
					Err(_) => continue,
				}
			}
		};

		loop {
			let envelope = tokio::select! {
				_ = token.cancelled() => return,
				envelope = current.recv() => envelope,
			};
			match envelope {
				Some(envelope) => inner.fan_out(&envelope),
				None => break,
			}
		}

		let closed = inner.close_all();
		info!(observers = closed, "Log topic closed, observer streams ended");
	}
}

#[async_trait]
impl Module for LogBroadcaster {
	async fn start(&self) -> Result<(), HookError> {
		self.attach();
		Ok(())
	}

	async fn stop(&self) -> Result<(), HookError> {
		self.detach().await;
		Ok(())
	}

	async fn health_check(&self) -> bool {
		self.is_attached()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use datacenter_config::EventBusConfig;
	use futures::StreamExt;
	use std::pin::Pin;
	use std::time::Duration;

	type Frames = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

	fn setup(config: LogStreamConfig) -> (EventBus, LogBroadcaster) {
		let bus = EventBus::new(EventBusConfig {
			timer_interval_secs: 0,
			..Default::default()
		});
		bus.start();
		let broadcaster = LogBroadcaster::new(bus.clone(), config);
		broadcaster.attach();
		(bus, broadcaster)
	}

	fn connect(broadcaster: &LogBroadcaster) -> Frames {
		Box::pin(broadcaster.connect())
	}

	async fn next_frame(frames: &mut Frames) -> Option<StreamFrame> {
		tokio::time::timeout(Duration::from_secs(2), frames.next())
			.await
			.expect("stream stalled")
	}

	async fn next_log(frames: &mut Frames) -> String {
		loop {
			match next_frame(frames).await {
				Some(StreamFrame::Log(entry)) => return entry.message,
				Some(StreamFrame::Ping(_)) => continue,
				None => panic!("stream ended"),
			}
		}
	}

	#[tokio::test]
	async fn test_observers_receive_entries_in_order() {
		let (bus, broadcaster) = setup(LogStreamConfig::default());
		let mut first = connect(&broadcaster);
		let mut second = connect(&broadcaster);
		assert_eq!(broadcaster.observer_count(), 2);

		for i in 0..5 {
			bus.publish(topics::LOG, LogEntry::info(format!("entry {}", i)));
		}

		for frames in [&mut first, &mut second] {
			for i in 0..5 {
				assert_eq!(next_log(frames).await, format!("entry {}", i));
			}
		}
	}

	#[tokio::test]
	async fn test_no_replay_before_connect() {
		let (bus, broadcaster) = setup(LogStreamConfig::default());
		bus.publish(topics::LOG, LogEntry::info("before"));

		let mut frames = connect(&broadcaster);
		bus.publish(topics::LOG, LogEntry::info("after"));

		assert_eq!(next_log(&mut frames).await, "after");
	}

	#[tokio::test]
	async fn test_idle_observer_gets_pings() {
		let (_bus, broadcaster) = setup(LogStreamConfig {
			heartbeat_interval_secs: 1,
			..Default::default()
		});
		let mut frames = connect(&broadcaster);

		let frame = next_frame(&mut frames).await.unwrap();
		assert_eq!(frame.event_name(), "ping");
	}

	#[tokio::test]
	async fn test_dropping_stream_disconnects() {
		let (_bus, broadcaster) = setup(LogStreamConfig::default());
		let frames = connect(&broadcaster);
		assert_eq!(broadcaster.observer_count(), 1);
		drop(frames);
		assert_eq!(broadcaster.observer_count(), 0);
	}

	#[tokio::test]
	async fn test_bus_stop_closes_observers() {
		let (bus, broadcaster) = setup(LogStreamConfig::default());
		let mut frames = connect(&broadcaster);
		bus.publish(topics::LOG, LogEntry::info("last words"));
		bus.stop();

		assert_eq!(next_log(&mut frames).await, "last words");
		assert!(next_frame(&mut frames).await.is_none());
		assert_eq!(broadcaster.observer_count(), 0);
	}

	#[tokio::test]
	async fn test_resubscribes_after_bus_restart() {
		let (bus, broadcaster) = setup(LogStreamConfig::default());
		bus.stop();
		bus.start();

		tokio::time::timeout(Duration::from_secs(2), async {
			while bus.subscriber_count(topics::LOG) == 0 {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();

		let mut frames = connect(&broadcaster);
		bus.publish(topics::LOG, LogEntry::info("back again"));
		assert_eq!(next_log(&mut frames).await, "back again");
	}

	#[tokio::test]
	async fn test_slow_observer_is_disconnected() {
		let (bus, broadcaster) = setup(LogStreamConfig {
			observer_buffer: 2,
			max_dropped_per_observer: 3,
			..Default::default()
		});
		let mut slow = connect(&broadcaster);

		for i in 0..10 {
			bus.publish(topics::LOG, LogEntry::info(format!("entry {}", i)));
		}

		let mut delivered = 0;
		while let Some(frame) = next_frame(&mut slow).await {
			assert_eq!(frame.event_name(), "log");
			delivered += 1;
		}
		assert!(delivered < 10);
		assert_eq!(broadcaster.observer_count(), 0);
	}

	#[tokio::test]
	async fn test_observer_that_catches_up_stays_connected() {
		let (bus, broadcaster) = setup(LogStreamConfig {
			observer_buffer: 2,
			max_dropped_per_observer: 3,
			..Default::default()
		});
		let mut frames = connect(&broadcaster);

		// Each burst overruns the buffer by at most two entries, so the
		// lifetime loss passes the limit while no single gap does.
		for round in 0..4 {
			for i in 0..4 {
				bus.publish(topics::LOG, LogEntry::info(format!("round {} entry {}", round, i)));
			}
			let last = format!("round {} entry 3", round);
			while next_log(&mut frames).await != last {}
		}

		assert_eq!(broadcaster.observer_count(), 1);
	}

	#[tokio::test]
	async fn test_detach_closes_observers() {
		let (bus, broadcaster) = setup(LogStreamConfig::default());
		let mut frames = connect(&broadcaster);

		broadcaster.detach().await;
		assert!(!broadcaster.is_attached());
		assert!(next_frame(&mut frames).await.is_none());
		assert_eq!(bus.subscriber_count(topics::LOG), 0);
	}
}
