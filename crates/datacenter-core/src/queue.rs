//! Bounded single-consumer channels with a configurable overload policy.
//!
//! Used for every bus subscription and every log stream observer. Producers
//! never wait. `DropNewest` is a tokio `mpsc` channel fed with `try_send`:
//! a full channel discards the incoming item. `DropOldest` is a tokio
//! `broadcast` ring with a single receiver: a full ring overwrites its
//! oldest item and the receiver learns about the loss as `Lagged(n)`.
//! Either way the loss is counted.
//!
//! Dropping the [`QueueSender`] closes the channel. The receiver still gets
//! everything queued before that, then `None`.

use datacenter_config::OverflowPolicy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// tokio rejects absurd channel sizes; larger requests are clamped.
const MAX_CAPACITY: usize = 1 << 20;

/// Result of a [`QueueSender::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
	/// Queued. Under drop-oldest this may have evicted an older item.
	Accepted,
	/// The channel was full and the item was discarded.
	Dropped,
	/// The receiver is gone.
	Closed,
}

impl PushOutcome {
	pub fn is_queued(&self) -> bool {
		matches!(self, Self::Accepted)
	}
}

#[derive(Debug, Default)]
struct Counters {
	accepted: AtomicU64,
	delivered: AtomicU64,
	dropped: AtomicU64,
}

enum Tx<T> {
	Newest(mpsc::Sender<T>),
	Oldest(broadcast::Sender<T>),
}

enum Rx<T> {
	Newest(mpsc::Receiver<T>),
	Oldest(broadcast::Receiver<T>),
}

/// Creates a channel holding at most `capacity` items.
///
/// A capacity of zero is raised to one. Drop-oldest channels round the
/// capacity up to a power of two, as tokio's ring does.
pub fn bounded<T: Clone>(
	capacity: usize,
	policy: OverflowPolicy,
) -> (QueueSender<T>, QueueReceiver<T>) {
	let capacity = capacity.clamp(1, MAX_CAPACITY);
	let (tx, rx, capacity) = match policy {
		OverflowPolicy::DropNewest => {
			let (tx, rx) = mpsc::channel(capacity);
			(Tx::Newest(tx), Rx::Newest(rx), capacity)
		}
		OverflowPolicy::DropOldest => {
			let capacity = capacity.next_power_of_two();
			let (tx, rx) = broadcast::channel(capacity);
			(Tx::Oldest(tx), Rx::Oldest(rx), capacity)
		}
	};
	let counters = Arc::new(Counters::default());

	(
		QueueSender {
			tx,
			capacity,
			policy,
			counters: counters.clone(),
		},
		QueueReceiver {
			rx,
			counters,
			seen_dropped: 0,
			missed: 0,
		},
	)
}

/// Producing half. Pushes never block.
pub struct QueueSender<T> {
	tx: Tx<T>,
	capacity: usize,
	policy: OverflowPolicy,
	counters: Arc<Counters>,
}

impl<T> QueueSender<T> {
	pub fn push(&self, item: T) -> PushOutcome {
		let outcome = match &self.tx {
			Tx::Newest(tx) => match tx.try_send(item) {
				Ok(()) => PushOutcome::Accepted,
				Err(mpsc::error::TrySendError::Full(_)) => PushOutcome::Dropped,
				Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Closed,
			},
			// Eviction on a full ring is counted by the receiver.
			Tx::Oldest(tx) => match tx.send(item) {
				Ok(_) => PushOutcome::Accepted,
				Err(_) => PushOutcome::Closed,
			},
		};

		match outcome {
			PushOutcome::Accepted => {
				self.counters.accepted.fetch_add(1, Ordering::Relaxed);
			}
			PushOutcome::Dropped => {
				self.counters.dropped.fetch_add(1, Ordering::Relaxed);
			}
			PushOutcome::Closed => {}
		}
		outcome
	}

	/// Items waiting for the receiver.
	pub fn len(&self) -> usize {
		match &self.tx {
			Tx::Newest(tx) => self.capacity.saturating_sub(tx.capacity()),
			Tx::Oldest(tx) => tx.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn policy(&self) -> OverflowPolicy {
		self.policy
	}

	pub fn accepted(&self) -> u64 {
		self.counters.accepted.load(Ordering::Relaxed)
	}

	pub fn delivered(&self) -> u64 {
		self.counters.delivered.load(Ordering::Relaxed)
	}

	pub fn dropped(&self) -> u64 {
		self.counters.dropped.load(Ordering::Relaxed)
	}
}

/// Consuming half.
pub struct QueueReceiver<T> {
	rx: Rx<T>,
	counters: Arc<Counters>,
	seen_dropped: u64,
	missed: u64,
}

impl<T: Clone> QueueReceiver<T> {
	/// Waits for the next item; `None` once the sender is gone and
	/// everything queued has been handed out. Cancel safe.
	pub async fn recv(&mut self) -> Option<T> {
		let item = match &mut self.rx {
			Rx::Newest(rx) => rx.recv().await,
			Rx::Oldest(rx) => loop {
				match rx.recv().await {
					Ok(item) => break Some(item),
					Err(broadcast::error::RecvError::Lagged(lost)) => {
						self.counters.dropped.fetch_add(lost, Ordering::Relaxed);
					}
					Err(broadcast::error::RecvError::Closed) => break None,
				}
			},
		};
		self.note_delivery(item)
	}

	pub fn try_recv(&mut self) -> Option<T> {
		let item = match &mut self.rx {
			Rx::Newest(rx) => rx.try_recv().ok(),
			Rx::Oldest(rx) => loop {
				match rx.try_recv() {
					Ok(item) => break Some(item),
					Err(broadcast::error::TryRecvError::Lagged(lost)) => {
						self.counters.dropped.fetch_add(lost, Ordering::Relaxed);
					}
					Err(_) => break None,
				}
			},
		};
		self.note_delivery(item)
	}

	fn note_delivery(&mut self, item: Option<T>) -> Option<T> {
		if item.is_some() {
			self.counters.delivered.fetch_add(1, Ordering::Relaxed);
			let dropped = self.counters.dropped.load(Ordering::Relaxed);
			self.missed = dropped.saturating_sub(self.seen_dropped);
			self.seen_dropped = dropped;
		}
		item
	}
}

impl<T> QueueReceiver<T> {
	/// Items lost between the previous delivery and the last one.
	pub fn missed(&self) -> u64 {
		self.missed
	}

	/// Items lost over the lifetime of the channel.
	pub fn dropped(&self) -> u64 {
		self.counters.dropped.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn test_drop_oldest_keeps_latest() {
		let (tx, mut rx) = bounded(2, OverflowPolicy::DropOldest);
		assert_eq!(tx.push(1), PushOutcome::Accepted);
		assert_eq!(tx.push(2), PushOutcome::Accepted);
		assert_eq!(tx.push(3), PushOutcome::Accepted);
		assert_eq!(tx.len(), 2);

		assert_eq!(rx.try_recv(), Some(2));
		assert_eq!(rx.missed(), 1);
		assert_eq!(rx.try_recv(), Some(3));
		assert_eq!(rx.missed(), 0);
		assert_eq!(rx.try_recv(), None);
		assert_eq!(tx.dropped(), 1);
		assert_eq!(tx.delivered(), 2);
	}

	#[test]
	fn test_drop_newest_keeps_earliest() {
		let (tx, mut rx) = bounded(2, OverflowPolicy::DropNewest);
		tx.push(1);
		tx.push(2);
		assert_eq!(tx.push(3), PushOutcome::Dropped);
		assert_eq!(tx.push(4), PushOutcome::Dropped);

		assert_eq!(tx.dropped(), 2);
		assert_eq!(tx.accepted(), 2);
		assert_eq!(tx.len(), 2);
		assert_eq!(rx.try_recv(), Some(1));
		assert_eq!(rx.try_recv(), Some(2));
		assert_eq!(rx.try_recv(), None);
	}

	#[test]
	fn test_capacity_bounds() {
		let (tx, _rx) = bounded::<u8>(0, OverflowPolicy::DropNewest);
		assert_eq!(tx.capacity(), 1);
		assert_eq!(tx.push(1), PushOutcome::Accepted);
		assert_eq!(tx.push(2), PushOutcome::Dropped);

		let (tx, _rx) = bounded::<u8>(5, OverflowPolicy::DropOldest);
		assert_eq!(tx.capacity(), 8);
	}

	#[tokio::test]
	async fn test_dropping_sender_drains_then_ends() {
		for policy in [OverflowPolicy::DropOldest, OverflowPolicy::DropNewest] {
			let (tx, mut rx) = bounded(4, policy);
			tx.push(1);
			tx.push(2);
			drop(tx);

			assert_eq!(rx.recv().await, Some(1));
			assert_eq!(rx.recv().await, Some(2));
			assert_eq!(rx.recv().await, None);
		}
	}

	#[test]
	fn test_push_after_receiver_dropped() {
		for policy in [OverflowPolicy::DropOldest, OverflowPolicy::DropNewest] {
			let (tx, rx) = bounded(4, policy);
			drop(rx);
			assert_eq!(tx.push(1), PushOutcome::Closed);
			assert_eq!(tx.dropped(), 0);
		}
	}

	#[tokio::test]
	async fn test_recv_wakes_on_push_and_close() {
		let (tx, mut rx) = bounded(4, OverflowPolicy::DropOldest);

		let consumer = tokio::spawn(async move {
			let mut seen = Vec::new();
			while let Some(item) = rx.recv().await {
				seen.push(item);
			}
			seen
		});

		tokio::time::sleep(Duration::from_millis(20)).await;
		tx.push(10);
		tx.push(11);
		tokio::time::sleep(Duration::from_millis(20)).await;
		let delivered = tx.delivered();
		drop(tx);

		let seen = tokio::time::timeout(Duration::from_secs(1), consumer)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(seen, vec![10, 11]);
		assert_eq!(delivered, 2);
	}

	#[tokio::test]
	async fn test_lag_is_counted_on_recv() {
		let (tx, mut rx) = bounded(4, OverflowPolicy::DropOldest);
		for i in 0..10 {
			tx.push(i);
		}
		assert_eq!(rx.recv().await, Some(6));
		assert_eq!(rx.missed(), 6);
		assert_eq!(rx.dropped(), 6);
	}

	#[test]
	fn test_push_never_blocks_when_full() {
		let (tx, _rx) = bounded(8, OverflowPolicy::DropNewest);
		for i in 0..10_000 {
			tx.push(i);
		}
		assert_eq!(tx.len(), 8);
		assert_eq!(tx.dropped(), 10_000 - 8);
	}
}
