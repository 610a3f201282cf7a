//! Per-connection subscription state and notification delivery.
//!
//! A [`Notifier`] is bound to exactly one codec. Subscriptions start out
//! inactive and buffer their notifications; the dispatcher activates them
//! after the creation response has left, which guarantees the client sees
//! the subscription id before the first event. Delivery is at-most-once,
//! in per-subscription order.

use std::{
	collections::{HashMap, VecDeque},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::{codec::ServerCodec, message};

/// Subscription identifier: 16 random bytes, hex-encoded with a `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
	pub fn random() -> Self {
		let bytes: [u8; 16] = rand::random();
		SubscriptionId(format!("0x{}", hex::encode(bytes)))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for SubscriptionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for SubscriptionId {
	fn from(value: &str) -> Self {
		SubscriptionId(value.to_string())
	}
}

#[derive(Debug, Error)]
pub enum NotifyError {
	#[error("unknown subscription")]
	Unknown,
	#[error("connection closed")]
	Closed,
}

struct SubState {
	service: String,
	active: bool,
	queue: VecDeque<Value>,
}

/// Owns every subscription hanging off one codec.
pub struct Notifier {
	codec: Arc<dyn ServerCodec>,
	subs: AsyncMutex<HashMap<SubscriptionId, SubState>>,
	count: AtomicUsize,
	buffer_cap: usize,
}

impl Notifier {
	pub fn new(codec: Arc<dyn ServerCodec>, buffer_cap: usize) -> Self {
		Notifier {
			codec,
			subs: AsyncMutex::new(HashMap::new()),
			count: AtomicUsize::new(0),
			buffer_cap,
		}
	}

	/// Number of live subscriptions on this connection.
	pub fn count(&self) -> usize {
		self.count.load(Ordering::Acquire)
	}

	/// Mints a fresh, inactive subscription under the given namespace.
	pub async fn create_subscription(&self, service: &str) -> SubscriptionId {
		let id = SubscriptionId::random();
		let mut subs = self.subs.lock().await;
		subs.insert(
			id.clone(),
			SubState {
				service: service.to_string(),
				active: false,
				queue: VecDeque::new(),
			},
		);
		self.count.store(subs.len(), Ordering::Release);
		id
	}

	/// Delivers one event. Inactive subscriptions buffer it; active ones
	/// write it through the codec. A write failure tears down every
	/// subscription on this connection and closes the codec.
	pub async fn notify(&self, id: &SubscriptionId, payload: Value) -> Result<(), NotifyError> {
		let mut subs = self.subs.lock().await;
		let Some(state) = subs.get_mut(id) else {
			return Err(NotifyError::Unknown);
		};

		if !state.active {
			if state.queue.len() >= self.buffer_cap {
				debug!(subscription = %id, "notification buffer full, dropping oldest event");
				state.queue.pop_front();
			}
			state.queue.push_back(payload);
			return Ok(());
		}

		let frame = message::notification(&state.service, id.as_str(), &payload);
		if self.codec.send(frame).await.is_err() {
			Self::teardown(&mut subs, &self.count, &*self.codec);
			return Err(NotifyError::Closed);
		}
		Ok(())
	}

	/// Marks the subscription active and flushes its buffered events in
	/// order. Called strictly after the creation response was written; the
	/// map lock is held across the flush so concurrent `notify` calls
	/// cannot overtake buffered events.
	pub async fn activate(&self, id: &SubscriptionId) {
		let mut subs = self.subs.lock().await;
		let (service, queued) = match subs.get_mut(id) {
			Some(state) => {
				state.active = true;
				(state.service.clone(), std::mem::take(&mut state.queue))
			},
			None => return,
		};

		for payload in queued {
			let frame = message::notification(&service, id.as_str(), &payload);
			if self.codec.send(frame).await.is_err() {
				warn!(subscription = %id, "notification write failed, closing connection");
				Self::teardown(&mut subs, &self.count, &*self.codec);
				return;
			}
		}
	}

	/// Removes one subscription. Returns whether it existed.
	pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
		let mut subs = self.subs.lock().await;
		let existed = subs.remove(id).is_some();
		self.count.store(subs.len(), Ordering::Release);
		existed
	}

	/// Drops every subscription; invoked when the codec goes away.
	pub async fn unsubscribe_all(&self) {
		let mut subs = self.subs.lock().await;
		subs.clear();
		self.count.store(0, Ordering::Release);
	}

	fn teardown(
		subs: &mut HashMap<SubscriptionId, SubState>,
		count: &AtomicUsize,
		codec: &dyn ServerCodec,
	) {
		subs.clear();
		count.store(0, Ordering::Release);
		codec.close();
	}
}

/// Handle given to a subscription callable; events pushed here travel
/// through a bounded channel to the notifier, giving producers natural
/// backpressure.
#[derive(Clone)]
pub struct SubscriptionSink {
	id: SubscriptionId,
	tx: mpsc::Sender<Value>,
}

impl SubscriptionSink {
	pub(crate) fn new(id: SubscriptionId, tx: mpsc::Sender<Value>) -> Self {
		SubscriptionSink { id, tx }
	}

	pub fn subscription_id(&self) -> &SubscriptionId {
		&self.id
	}

	/// Queues one event. Fails once the subscription is gone.
	pub async fn send(&self, payload: Value) -> Result<(), NotifyError> {
		self.tx.send(payload).await.map_err(|_| NotifyError::Closed)
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	/// Resolves when the subscription is cancelled or its connection dies.
	pub async fn closed(&self) {
		self.tx.closed().await
	}
}

/// Drains a subscription's channel into the notifier. Ends when the sink
/// is dropped, the subscription is cancelled, or the connection dies.
pub(crate) async fn forward(
	notifier: Arc<Notifier>,
	id: SubscriptionId,
	mut rx: mpsc::Receiver<Value>,
	closed: tokio_util::sync::CancellationToken,
) {
	loop {
		tokio::select! {
			_ = closed.cancelled() => break,
			payload = rx.recv() => match payload {
				None => break,
				Some(payload) => {
					if notifier.notify(&id, payload).await.is_err() {
						break;
					}
				},
			},
		}
	}
}
