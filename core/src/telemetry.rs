//! Dispatcher instrumentation.
//!
//! [`RpcMetrics`] is the single source of truth for the server counters;
//! the [`otlp`] module periodically exports it through the OpenTelemetry
//! pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod otlp;

/// Counters maintained by the dispatcher and its transports.
///
/// The conservation invariant holds at any quiescent point:
/// `requests_seen == success_responses + error_responses + admission_drops`.
#[derive(Debug, Default)]
pub struct RpcMetrics {
	/// Requests parsed off the wire, batches counted element-wise.
	pub requests_seen: AtomicU64,
	pub success_responses: AtomicU64,
	pub error_responses: AtomicU64,
	/// Requests rejected by the pending-work limit, never dispatched.
	pub admission_drops: AtomicU64,
	/// Requests currently in flight.
	pub pending_requests: AtomicU64,
	/// Currently open WebSocket connections.
	pub open_ws_connections: AtomicU64,
	pub subscribe_requests: AtomicU64,
	pub unsubscribe_requests: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
	pub requests_seen: u64,
	pub success_responses: u64,
	pub error_responses: u64,
	pub admission_drops: u64,
	pub pending_requests: u64,
	pub open_ws_connections: u64,
	pub subscribe_requests: u64,
	pub unsubscribe_requests: u64,
}

impl RpcMetrics {
	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			requests_seen: self.requests_seen.load(Ordering::Relaxed),
			success_responses: self.success_responses.load(Ordering::Relaxed),
			error_responses: self.error_responses.load(Ordering::Relaxed),
			admission_drops: self.admission_drops.load(Ordering::Relaxed),
			pending_requests: self.pending_requests.load(Ordering::Relaxed),
			open_ws_connections: self.open_ws_connections.load(Ordering::Relaxed),
			subscribe_requests: self.subscribe_requests.load(Ordering::Relaxed),
			unsubscribe_requests: self.unsubscribe_requests.load(Ordering::Relaxed),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snapshot_reads_all_counters() {
		let metrics = RpcMetrics::default();
		metrics.requests_seen.fetch_add(3, Ordering::Relaxed);
		metrics.success_responses.fetch_add(2, Ordering::Relaxed);
		metrics.error_responses.fetch_add(1, Ordering::Relaxed);

		let snapshot = metrics.snapshot();
		assert_eq!(snapshot.requests_seen, 3);
		assert_eq!(
			snapshot.requests_seen,
			snapshot.success_responses + snapshot.error_responses + snapshot.admission_drops
		);
	}
}
