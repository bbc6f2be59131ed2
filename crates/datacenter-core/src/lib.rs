//! Lifecycle orchestration and live event distribution for the data center.
//!
//! - [`EventBus`]: topic-based publish/subscribe with bounded, lossy
//!   per-subscriber buffers.
//! - [`ModuleRegistry`] and [`resolve_order`]: module descriptors and their
//!   start order.
//! - [`Orchestrator`]: start/stop/restart across modules with rollback and
//!   lock-free status snapshots.
//! - [`LogSink`] and [`LogBroadcaster`]: log history and its live fan-out to
//!   external observers.

pub mod broadcaster;
pub mod error;
pub mod event_bus;
pub mod lifecycle;
pub mod log_sink;
pub mod queue;
pub mod registry;

pub use broadcaster::{LogBroadcaster, StreamFrame};
pub use error::{BusError, CoreError, HookError};
pub use event_bus::{
	BusStats, Envelope, EventBus, SharedEnvelope, SubscribeOptions, Subscriber, SubscriberHandle,
	SubscriberStats, Subscription,
};
pub use lifecycle::{Orchestrator, StopReport};
pub use log_sink::LogSink;
pub use queue::{PushOutcome, QueueReceiver, QueueSender};
pub use registry::{resolve_order, Hook, HookResult, Module, ModuleDescriptor, ModuleRegistry};
