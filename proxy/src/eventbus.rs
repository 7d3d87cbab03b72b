//! Topic fan-out with bounded per-subscriber queues and a drop-oldest backpressure policy.
//!
//! Grounded on the gateway crate's preference for explicit, non-blocking publish paths
//! (`ProxyInputs`-style context objects rather than implicit singletons, spec.md §9): the bus is
//! an owned object threaded through every engine, not a global.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};

const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
	NewRequest,
	Intercept,
	ProxyStatus,
	WebSocketMessage,
	IntruderResult,
	IntruderProgress,
	SpiderUrl,
	SpiderProgress,
	ScanProgress,
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
	pub topic_name: &'static str,
	pub sequence: u64,
	pub payload: serde_json::Value,
}

impl Topic {
	fn name(self) -> &'static str {
		match self {
			Topic::NewRequest => "new_request",
			Topic::Intercept => "intercept",
			Topic::ProxyStatus => "proxy_status",
			Topic::WebSocketMessage => "websocket_message",
			Topic::IntruderResult => "intruder_result",
			Topic::IntruderProgress => "intruder_progress",
			Topic::SpiderUrl => "spider_url",
			Topic::SpiderProgress => "spider_progress",
			Topic::ScanProgress => "scan_progress",
		}
	}
}

struct SubscriberQueue {
	capacity: usize,
	events: VecDeque<Event>,
	dropped: u64,
	closed: bool,
}

struct Subscriber {
	queue: Mutex<SubscriberQueue>,
	notify: Notify,
}

/// A single subscriber's handle. Receives events in publish order per topic, modulo drops.
pub struct Subscription {
	subscriber: Arc<Subscriber>,
}

impl Subscription {
	/// Awaits the next event, or `None` once the bus has been shut down and drained.
	pub async fn recv(&self) -> Option<Event> {
		loop {
			{
				let mut q = self.subscriber.queue.lock().await;
				if let Some(ev) = q.events.pop_front() {
					return Some(ev);
				}
				if q.closed {
					return None;
				}
			}
			self.subscriber.notify.notified().await;
		}
	}

	pub async fn dropped_count(&self) -> u64 {
		self.subscriber.queue.lock().await.dropped
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Ok(mut q) = self.subscriber.queue.try_lock() {
			q.closed = true;
		}
		self.subscriber.notify.notify_waiters();
	}
}

struct TopicState {
	subscribers: Vec<Arc<Subscriber>>,
}

pub struct EventBus {
	topics: Mutex<std::collections::HashMap<&'static str, TopicState>>,
	sequence: AtomicU64,
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

impl EventBus {
	pub fn new() -> Self {
		EventBus {
			topics: Mutex::new(std::collections::HashMap::new()),
			sequence: AtomicU64::new(0),
		}
	}

	pub async fn subscribe(&self, topic: Topic) -> Subscription {
		self.subscribe_with_capacity(topic, DEFAULT_QUEUE_CAPACITY).await
	}

	pub async fn subscribe_with_capacity(&self, topic: Topic, capacity: usize) -> Subscription {
		let subscriber = Arc::new(Subscriber {
			queue: Mutex::new(SubscriberQueue {
				capacity,
				events: VecDeque::new(),
				dropped: 0,
				closed: false,
			}),
			notify: Notify::new(),
		});
		let mut topics = self.topics.lock().await;
		topics
			.entry(topic.name())
			.or_insert_with(|| TopicState { subscribers: Vec::new() })
			.subscribers
			.push(subscriber.clone());
		Subscription { subscriber }
	}

	/// Publishes `payload` to every live subscriber of `topic`. Never blocks: a full subscriber
	/// queue drops its oldest entry and increments that subscriber's drop counter.
	pub async fn publish(&self, topic: Topic, payload: serde_json::Value) {
		let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
		let event = Event { topic_name: topic.name(), sequence, payload };

		let mut topics = self.topics.lock().await;
		let Some(state) = topics.get_mut(topic.name()) else { return };
		let mut live = Vec::with_capacity(state.subscribers.len());
		for sub in state.subscribers.drain(..) {
			if !sub.queue.lock().await.closed {
				live.push(sub);
			}
		}
		state.subscribers = live;
		for sub in &state.subscribers {
			let mut q = sub.queue.lock().await;
			if q.events.len() >= q.capacity {
				q.events.pop_front();
				q.dropped += 1;
			}
			q.events.push_back(event.clone());
			drop(q);
			sub.notify.notify_waiters();
		}
	}

	/// Marks every subscriber closed so pending `recv()` calls return `None`.
	pub async fn shutdown(&self) {
		let topics = self.topics.lock().await;
		for state in topics.values() {
			for sub in &state.subscribers {
				sub.queue.lock().await.closed = true;
				sub.notify.notify_waiters();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test]
	async fn subscriber_receives_events_in_publish_order() {
		let bus = EventBus::new();
		let sub = bus.subscribe(Topic::NewRequest).await;
		bus.publish(Topic::NewRequest, json!(1)).await;
		bus.publish(Topic::NewRequest, json!(2)).await;
		bus.publish(Topic::NewRequest, json!(3)).await;
		assert_eq!(sub.recv().await.unwrap().payload, json!(1));
		assert_eq!(sub.recv().await.unwrap().payload, json!(2));
		assert_eq!(sub.recv().await.unwrap().payload, json!(3));
	}

	#[tokio::test]
	async fn overflow_drops_oldest_and_counts() {
		let bus = EventBus::new();
		let sub = bus.subscribe_with_capacity(Topic::NewRequest, 2).await;
		for i in 0..5 {
			bus.publish(Topic::NewRequest, json!(i)).await;
		}
		assert_eq!(sub.dropped_count().await, 3);
		assert_eq!(sub.recv().await.unwrap().payload, json!(3));
		assert_eq!(sub.recv().await.unwrap().payload, json!(4));
	}

	#[tokio::test]
	async fn publish_to_topic_with_no_subscribers_does_not_block() {
		let bus = EventBus::new();
		bus.publish(Topic::ScanProgress, json!("noop")).await;
	}

	#[tokio::test]
	async fn shutdown_completes_pending_recv_with_none() {
		let bus = Arc::new(EventBus::new());
		let sub = bus.subscribe(Topic::ProxyStatus).await;
		let bus2 = bus.clone();
		let handle = tokio::spawn(async move { sub.recv().await });
		tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		bus2.shutdown().await;
		assert_eq!(handle.await.unwrap(), None);
	}
}
