//! In-process publish/subscribe bus.
//!
//! Topics are independent; each subscription is a bounded channel from
//! [`crate::queue`], so a slow consumer loses events under its overload
//! policy instead of holding up the publisher. Nothing is retained for late
//! subscribers.
//!
//! The bus starts inactive. While inactive, `publish` delivers nothing and
//! `subscribe` is refused. Stopping the bus drops every sending half; a
//! consumer sees its channel drain and then end.
//!
//! No tracing happens while the subscriber table lock is held: log records
//! are themselves published on the `log` topic.

use crate::error::{panic_message, BusError, HookError};
use crate::queue::{self, PushOutcome, QueueReceiver, QueueSender};
use crate::registry::Module;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datacenter_config::{EventBusConfig, OverflowPolicy};
use datacenter_types::{topics, BusEvent, TimerEvent};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
	/// Bus-wide publish sequence, starting at 1.
	pub seq: u64,
	pub topic: String,
	pub published_at: DateTime<Utc>,
	pub event: BusEvent,
}

pub type SharedEnvelope = Arc<Envelope>;

/// Per-subscription settings; unset fields take the bus defaults.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
	pub capacity: Option<usize>,
	pub policy: Option<OverflowPolicy>,
	pub name: Option<String>,
}

impl SubscribeOptions {
	pub fn capacity(mut self, capacity: usize) -> Self {
		self.capacity = Some(capacity);
		self
	}

	pub fn policy(mut self, policy: OverflowPolicy) -> Self {
		self.policy = Some(policy);
		self
	}

	pub fn named(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}
}

/// Callback-style consumer run by [`EventBus::subscribe_with`].
///
/// Errors and panics are caught per event, counted and logged.
#[async_trait]
pub trait Subscriber: Send + Sync {
	async fn on_event(&self, envelope: &Envelope) -> Result<(), HookError>;
}

struct Slot {
	id: u64,
	name: String,
	sender: QueueSender<SharedEnvelope>,
	failures: Arc<AtomicU64>,
}

struct Topics {
	active: bool,
	subscribers: HashMap<String, Vec<Slot>>,
}

struct BusInner {
	topics: RwLock<Topics>,
	next_seq: AtomicU64,
	next_id: AtomicU64,
	defaults: EventBusConfig,
	active_tx: watch::Sender<bool>,
	timer: Mutex<Option<CancellationToken>>,
}

impl BusInner {
	fn remove(&self, topic: &str, id: u64) -> Option<Slot> {
		let mut topics = self.topics.write();
		let slots = topics.subscribers.get_mut(topic)?;
		let index = slots.iter().position(|slot| slot.id == id)?;
		let slot = slots.remove(index);
		if slots.is_empty() {
			topics.subscribers.remove(topic);
		}
		Some(slot)
	}
}

/// Cheaply cloneable handle to the process-wide bus.
#[derive(Clone)]
pub struct EventBus {
	inner: Arc<BusInner>,
}

impl EventBus {
	/// Creates an inactive bus; `config` supplies subscription defaults and
	/// the timer period.
	pub fn new(config: EventBusConfig) -> Self {
		let (active_tx, _) = watch::channel(false);
		Self {
			inner: Arc::new(BusInner {
				topics: RwLock::new(Topics {
					active: false,
					subscribers: HashMap::new(),
				}),
				next_seq: AtomicU64::new(0),
				next_id: AtomicU64::new(0),
				defaults: config,
				active_tx,
				timer: Mutex::new(None),
			}),
		}
	}

	/// Activates the bus and, when configured, the `timer` topic.
	pub fn start(&self) {
		{
			let mut topics = self.inner.topics.write();
			if topics.active {
				return;
			}
			topics.active = true;
		}
		self.inner.active_tx.send_replace(true);

		if let Some(period) = self.inner.defaults.timer_interval() {
			if let Ok(handle) = tokio::runtime::Handle::try_current() {
				let token = CancellationToken::new();
				if let Some(previous) = self.inner.timer.lock().replace(token.clone()) {
					previous.cancel();
				}
				handle.spawn(run_timer(Arc::downgrade(&self.inner), period, token));
			}
		}
		info!("Event bus started");
	}

	/// Deactivates the bus and closes every subscription. Events already
	/// queued are still delivered.
	///
	/// Returns the number of subscriptions closed.
	pub fn stop(&self) -> usize {
		let drained: Vec<Slot> = {
			let mut topics = self.inner.topics.write();
			if !topics.active {
				return 0;
			}
			topics.active = false;
			topics
				.subscribers
				.drain()
				.flat_map(|(_, slots)| slots)
				.collect()
		};
		self.inner.active_tx.send_replace(false);
		if let Some(timer) = self.inner.timer.lock().take() {
			timer.cancel();
		}

		let closed = drained.len();
		drop(drained);
		info!(subscriptions = closed, "Event bus stopped");
		closed
	}

	pub fn is_active(&self) -> bool {
		self.inner.topics.read().active
	}

	/// Resolves once the bus is active. Returns `false` if it never can be.
	pub async fn wait_active(&self) -> bool {
		let mut rx = self.inner.active_tx.subscribe();
		// Bound first: the `Ref` temporary must not outlive `rx`.
		let active = rx.wait_for(|active| *active).await.is_ok();
		active
	}

	/// Delivers `event` to every current subscriber of `topic`.
	///
	/// Never blocks and never fails; returns the number of subscribers that
	/// queued the event. An inactive bus delivers nothing.
	pub fn publish(&self, topic: &str, event: impl Into<BusEvent>) -> usize {
		let topics = self.inner.topics.read();
		if !topics.active {
			return 0;
		}

		let envelope = Arc::new(Envelope {
			seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
			topic: topic.to_string(),
			published_at: Utc::now(),
			event: event.into(),
		});

		let Some(slots) = topics.subscribers.get(topic) else {
			return 0;
		};
		slots
			.iter()
			.map(|slot| slot.sender.push(envelope.clone()))
			.filter(PushOutcome::is_queued)
			.count()
	}

	/// Sequence number of the most recent publish, 0 before the first one.
	pub fn current_seq(&self) -> u64 {
		self.inner.next_seq.load(Ordering::SeqCst)
	}

	/// Opens a pull subscription on `topic`. Refused while the bus is
	/// inactive. Unset options take the bus defaults.
	pub fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<Subscription, BusError> {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
		let (sender, receiver) = queue::bounded(
			options
				.capacity
				.unwrap_or(self.inner.defaults.subscriber_capacity),
			options
				.policy
				.unwrap_or(self.inner.defaults.overflow_policy),
		);
		let name = options
			.name
			.unwrap_or_else(|| format!("{}-subscriber-{}", topic, id));
		let failures = Arc::new(AtomicU64::new(0));

		{
			let mut topics = self.inner.topics.write();
			if !topics.active {
				return Err(BusError::Inactive);
			}
			topics
				.subscribers
				.entry(topic.to_string())
				.or_default()
				.push(Slot {
					id,
					name: name.clone(),
					sender,
					failures: failures.clone(),
				});
		}
		debug!(topic = %topic, subscriber = %name, "Subscribed");

		Ok(Subscription {
			id,
			topic: topic.to_string(),
			name,
			receiver,
			failures,
			bus: Arc::downgrade(&self.inner),
		})
	}

	/// Runs `subscriber` on a dedicated task for every event on `topic`.
	///
	/// The task ends when the subscription is cancelled or the bus stops.
	pub fn subscribe_with(
		&self,
		topic: &str,
		subscriber: Arc<dyn Subscriber>,
		options: SubscribeOptions,
	) -> Result<SubscriberHandle, BusError> {
		let mut subscription = self.subscribe(topic, options)?;
		let failures = subscription.failures.clone();
		let id = subscription.id;
		let bus = subscription.bus.clone();

		let task = tokio::spawn(async move {
			while let Some(envelope) = subscription.recv().await {
				let outcome = AssertUnwindSafe(subscriber.on_event(&envelope))
					.catch_unwind()
					.await;
				match outcome {
					Ok(Ok(())) => {}
					Ok(Err(err)) => {
						subscription.failures.fetch_add(1, Ordering::Relaxed);
						warn!(
							topic = %subscription.topic,
							subscriber = %subscription.name,
							seq = envelope.seq,
							"Subscriber failed: {}",
							err
						);
					}
					Err(panic) => {
						subscription.failures.fetch_add(1, Ordering::Relaxed);
						error!(
							topic = %subscription.topic,
							subscriber = %subscription.name,
							seq = envelope.seq,
							"Subscriber panicked: {}",
							panic_message(panic.as_ref())
						);
					}
				}
			}
		});

		Ok(SubscriberHandle {
			id,
			topic: topic.to_string(),
			failures,
			bus,
			task,
		})
	}

	/// Current number of subscriptions on `topic`.
	pub fn subscriber_count(&self, topic: &str) -> usize {
		self.inner
			.topics
			.read()
			.subscribers
			.get(topic)
			.map_or(0, Vec::len)
	}

	pub fn stats(&self) -> BusStats {
		let topics = self.inner.topics.read();
		BusStats {
			active: topics.active,
			published: self.current_seq(),
			topics: topics
				.subscribers
				.iter()
				.map(|(topic, slots)| {
					let stats = slots
						.iter()
						.map(|slot| SubscriberStats {
							name: slot.name.clone(),
							capacity: slot.sender.capacity(),
							policy: slot.sender.policy(),
							queued: slot.sender.len(),
							delivered: slot.sender.delivered(),
							dropped: slot.sender.dropped(),
							failures: slot.failures.load(Ordering::Relaxed),
						})
						.collect();
					(topic.clone(), stats)
				})
				.collect(),
		}
	}
}

async fn run_timer(bus: Weak<BusInner>, period: Duration, token: CancellationToken) {
	let mut interval = tokio::time::interval(period);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	// The first tick completes immediately.
	interval.tick().await;
	let mut tick = 0u64;

	loop {
		tokio::select! {
			_ = token.cancelled() => break,
			_ = interval.tick() => {
				let Some(inner) = bus.upgrade() else { break };
				tick += 1;
				EventBus { inner }.publish(
					topics::TIMER,
					BusEvent::Timer(TimerEvent { tick, at: Utc::now() }),
				);
			}
		}
	}
}

/// Receiving side of a topic subscription. Dropping it unsubscribes.
pub struct Subscription {
	id: u64,
	topic: String,
	name: String,
	receiver: QueueReceiver<SharedEnvelope>,
	failures: Arc<AtomicU64>,
	bus: Weak<BusInner>,
}

impl Subscription {
	/// Next event, or `None` once the bus stopped and the buffer is drained.
	pub async fn recv(&mut self) -> Option<SharedEnvelope> {
		self.receiver.recv().await
	}

	pub fn try_recv(&mut self) -> Option<SharedEnvelope> {
		self.receiver.try_recv()
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn topic(&self) -> &str {
		&self.topic
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Events lost to the overload policy.
	pub fn dropped(&self) -> u64 {
		self.receiver.dropped()
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(bus) = self.bus.upgrade() {
			bus.remove(&self.topic, self.id);
		}
	}
}

/// Handle to a callback subscriber started by [`EventBus::subscribe_with`].
pub struct SubscriberHandle {
	id: u64,
	topic: String,
	failures: Arc<AtomicU64>,
	bus: Weak<BusInner>,
	task: JoinHandle<()>,
}

impl SubscriberHandle {
	/// Events whose handler returned an error or panicked.
	pub fn failures(&self) -> u64 {
		self.failures.load(Ordering::Relaxed)
	}

	/// Unsubscribes and waits for queued events to be processed.
	pub async fn cancel(self) {
		// Removing the slot drops the sending half; the worker drains and ends.
		if let Some(bus) = self.bus.upgrade() {
			bus.remove(&self.topic, self.id);
		}
		let _ = self.task.await;
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
	pub name: String,
	pub capacity: usize,
	pub policy: OverflowPolicy,
	pub queued: usize,
	pub delivered: u64,
	pub dropped: u64,
	pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
	pub active: bool,
	pub published: u64,
	pub topics: BTreeMap<String, Vec<SubscriberStats>>,
}

#[async_trait]
impl Module for EventBus {
	async fn start(&self) -> Result<(), HookError> {
		EventBus::start(self);
		Ok(())
	}

	async fn stop(&self) -> Result<(), HookError> {
		EventBus::stop(self);
		Ok(())
	}

	async fn health_check(&self) -> bool {
		self.is_active()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use datacenter_types::LogEntry;
	use std::sync::atomic::AtomicUsize;

	fn quiet_bus(capacity: usize, policy: OverflowPolicy) -> EventBus {
		let bus = EventBus::new(EventBusConfig {
			subscriber_capacity: capacity,
			overflow_policy: policy,
			timer_interval_secs: 0,
		});
		bus.start();
		bus
	}

	fn custom(n: u64) -> BusEvent {
		BusEvent::Custom(serde_json::json!({ "n": n }))
	}

	fn number(envelope: &Envelope) -> u64 {
		match &envelope.event {
			BusEvent::Custom(value) => value["n"].as_u64().unwrap(),
			other => panic!("unexpected event {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_inactive_bus_refuses_and_drops() {
		let bus = EventBus::new(EventBusConfig::default());
		assert!(matches!(
			bus.subscribe("x", SubscribeOptions::default()),
			Err(BusError::Inactive)
		));
		assert_eq!(bus.publish("x", custom(1)), 0);
		assert_eq!(bus.current_seq(), 0);
	}

	#[tokio::test]
	async fn test_publish_fans_out_per_topic() {
		let bus = quiet_bus(16, OverflowPolicy::DropOldest);
		let mut a = bus.subscribe("market", SubscribeOptions::default()).unwrap();
		let mut b = bus.subscribe("market", SubscribeOptions::default()).unwrap();
		let mut other = bus.subscribe("orders", SubscribeOptions::default()).unwrap();

		assert_eq!(bus.publish("market", custom(1)), 2);
		assert_eq!(bus.publish("market", custom(2)), 2);

		for sub in [&mut a, &mut b] {
			assert_eq!(number(&sub.recv().await.unwrap()), 1);
			assert_eq!(number(&sub.recv().await.unwrap()), 2);
		}
		assert!(other.try_recv().is_none());
	}

	#[tokio::test]
	async fn test_no_replay_for_late_subscribers() {
		let bus = quiet_bus(16, OverflowPolicy::DropOldest);
		bus.publish("market", custom(1));
		let mut late = bus.subscribe("market", SubscribeOptions::default()).unwrap();
		bus.publish("market", custom(2));

		assert_eq!(number(&late.recv().await.unwrap()), 2);
		assert!(late.try_recv().is_none());
	}

	#[tokio::test]
	async fn test_overflow_counts_drops_without_blocking() {
		let bus = quiet_bus(1024, OverflowPolicy::DropOldest);
		let mut slow = bus
			.subscribe(
				"ticks",
				SubscribeOptions::default()
					.capacity(4)
					.policy(OverflowPolicy::DropNewest),
			)
			.unwrap();
		let fast = bus.subscribe("ticks", SubscribeOptions::default()).unwrap();

		for n in 1..=10 {
			bus.publish("ticks", custom(n));
		}

		assert_eq!(slow.dropped(), 6);
		assert_eq!(fast.dropped(), 0);
		assert_eq!(number(&slow.try_recv().unwrap()), 1);

		let stats = bus.stats();
		let ticks = &stats.topics["ticks"];
		assert_eq!(ticks.len(), 2);
		assert_eq!(ticks[0].dropped, 6);
		assert_eq!(stats.published, 10);
	}

	#[tokio::test]
	async fn test_drop_unsubscribes() {
		let bus = quiet_bus(16, OverflowPolicy::DropOldest);
		let sub = bus.subscribe("x", SubscribeOptions::default()).unwrap();
		assert_eq!(bus.subscriber_count("x"), 1);
		drop(sub);
		assert_eq!(bus.subscriber_count("x"), 0);
		assert_eq!(bus.publish("x", custom(1)), 0);
	}

	#[tokio::test]
	async fn test_stop_closes_subscriptions() {
		let bus = quiet_bus(16, OverflowPolicy::DropOldest);
		let mut sub = bus.subscribe(topics::LOG, SubscribeOptions::default()).unwrap();
		bus.publish(topics::LOG, LogEntry::info("before stop"));

		assert_eq!(bus.stop(), 1);
		assert!(!bus.is_active());
		assert!(sub.recv().await.is_some());
		assert!(sub.recv().await.is_none());
		assert_eq!(bus.publish(topics::LOG, LogEntry::info("after stop")), 0);
	}

	#[tokio::test]
	async fn test_wait_active() {
		let bus = EventBus::new(EventBusConfig {
			timer_interval_secs: 0,
			..Default::default()
		});
		let waiter = {
			let bus = bus.clone();
			tokio::spawn(async move { bus.wait_active().await })
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		bus.start();
		assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.unwrap()
			.unwrap());
	}

	struct Flaky {
		seen: AtomicUsize,
	}

	#[async_trait]
	impl Subscriber for Flaky {
		async fn on_event(&self, envelope: &Envelope) -> Result<(), HookError> {
			self.seen.fetch_add(1, Ordering::SeqCst);
			match number(envelope) {
				2 => Err(HookError::new("cannot handle 2")),
				3 => panic!("cannot handle 3"),
				_ => Ok(()),
			}
		}
	}

	struct Counter {
		seen: AtomicUsize,
	}

	#[async_trait]
	impl Subscriber for Counter {
		async fn on_event(&self, _envelope: &Envelope) -> Result<(), HookError> {
			self.seen.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	#[tokio::test]
	async fn test_subscriber_failures_are_isolated() {
		let bus = quiet_bus(16, OverflowPolicy::DropOldest);
		let flaky = Arc::new(Flaky {
			seen: AtomicUsize::new(0),
		});
		let counter = Arc::new(Counter {
			seen: AtomicUsize::new(0),
		});
		let flaky_handle = bus
			.subscribe_with("jobs", flaky.clone(), SubscribeOptions::default())
			.unwrap();
		let counter_handle = bus
			.subscribe_with("jobs", counter.clone(), SubscribeOptions::default())
			.unwrap();

		for n in 1..=4 {
			assert_eq!(bus.publish("jobs", custom(n)), 2);
		}

		tokio::time::timeout(Duration::from_secs(1), async {
			while flaky.seen.load(Ordering::SeqCst) < 4 || counter.seen.load(Ordering::SeqCst) < 4 {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();

		assert_eq!(flaky_handle.failures(), 2);
		assert_eq!(counter_handle.failures(), 0);

		flaky_handle.cancel().await;
		assert_eq!(bus.subscriber_count("jobs"), 1);
		counter_handle.cancel().await;
	}

	#[tokio::test]
	async fn test_timer_topic_ticks() {
		let bus = EventBus::new(EventBusConfig {
			timer_interval_secs: 1,
			..Default::default()
		});
		bus.start();
		let mut timer = bus.subscribe(topics::TIMER, SubscribeOptions::default()).unwrap();

		let envelope = tokio::time::timeout(Duration::from_secs(3), timer.recv())
			.await
			.unwrap()
			.unwrap();
		assert!(matches!(envelope.event, BusEvent::Timer(TimerEvent { tick: 1, .. })));
		bus.stop();
	}
}
