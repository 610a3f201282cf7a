//! OpenTelemetry export of the dispatcher counters.
//!
//! Counters are cumulative atomics owned by [`RpcMetrics`]; every export
//! period the delta since the previous flush is added to the OTLP counter
//! instruments, and the pending/connection gauges are re-observed.

use std::{collections::HashMap, sync::Arc, time::Duration};

use opentelemetry::{
	global,
	metrics::{Counter, Meter},
	KeyValue,
};
use opentelemetry_otlp::{ExportConfig, Protocol, WithExportConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{MetricsSnapshot, RpcMetrics};

const COUNTER_NAMES: &[&str] = &[
	"rpc.requests",
	"rpc.success_responses",
	"rpc.error_responses",
	"rpc.admission_drops",
	"rpc.subscribe_requests",
	"rpc.unsubscribe_requests",
];

#[derive(Debug, Error)]
pub enum TelemetryError {
	#[error("failed to initialize OTLP pipeline: {0}")]
	Init(String),
	#[error("failed to record gauge: {0}")]
	Record(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OtelConfig {
	/// OpenTelemetry Collector endpoint.
	pub ot_collector_endpoint: String,
	pub ot_export_period: u64,
	pub ot_export_timeout: u64,
}

impl Default for OtelConfig {
	fn default() -> Self {
		OtelConfig {
			ot_collector_endpoint: "http://127.0.0.1:4317".to_string(),
			ot_export_period: 300,
			ot_export_timeout: 10,
		}
	}
}

/// Periodic exporter for one server's [`RpcMetrics`].
pub struct Exporter {
	meter: Meter,
	counters: HashMap<&'static str, Counter<u64>>,
	attributes: Vec<KeyValue>,
	period: Duration,
	last: MetricsSnapshot,
}

/// Builds the OTLP pipeline and installs it as the global meter provider.
pub fn initialize(
	attributes: Vec<(&str, String)>,
	ot_config: OtelConfig,
) -> Result<Exporter, TelemetryError> {
	let export_config = ExportConfig {
		endpoint: ot_config.ot_collector_endpoint.clone(),
		timeout: Duration::from_secs(ot_config.ot_export_timeout),
		protocol: Protocol::Grpc,
	};
	let provider = opentelemetry_otlp::new_pipeline()
		.metrics(opentelemetry_sdk::runtime::Tokio)
		.with_exporter(
			opentelemetry_otlp::new_exporter()
				.tonic()
				.with_export_config(export_config),
		)
		.with_period(Duration::from_secs(ot_config.ot_export_period))
		.with_timeout(Duration::from_secs(ot_config.ot_export_timeout))
		.build()
		.map_err(|e| TelemetryError::Init(e.to_string()))?;

	global::set_meter_provider(provider);
	let meter = global::meter("lattice_rpc");

	// counters persist, unlike gauges which are re-observed every flush
	let counters = COUNTER_NAMES
		.iter()
		.map(|name| (*name, meter.u64_counter(*name).init()))
		.collect();

	let attributes = attributes
		.into_iter()
		.map(|(key, value)| KeyValue::new(key.to_string(), value))
		.collect();

	Ok(Exporter {
		meter,
		counters,
		attributes,
		period: Duration::from_secs(ot_config.ot_export_period),
		last: MetricsSnapshot {
			requests_seen: 0,
			success_responses: 0,
			error_responses: 0,
			admission_drops: 0,
			pending_requests: 0,
			open_ws_connections: 0,
			subscribe_requests: 0,
			unsubscribe_requests: 0,
		},
	})
}

impl Exporter {
	/// Flushes one delta of the cumulative counters plus the gauges.
	pub fn flush(&mut self, metrics: &RpcMetrics) -> Result<(), TelemetryError> {
		let snapshot = metrics.snapshot();
		let deltas = [
			("rpc.requests", snapshot.requests_seen - self.last.requests_seen),
			(
				"rpc.success_responses",
				snapshot.success_responses - self.last.success_responses,
			),
			(
				"rpc.error_responses",
				snapshot.error_responses - self.last.error_responses,
			),
			(
				"rpc.admission_drops",
				snapshot.admission_drops - self.last.admission_drops,
			),
			(
				"rpc.subscribe_requests",
				snapshot.subscribe_requests - self.last.subscribe_requests,
			),
			(
				"rpc.unsubscribe_requests",
				snapshot.unsubscribe_requests - self.last.unsubscribe_requests,
			),
		];
		for (name, delta) in deltas {
			if delta > 0 {
				self.counters[name].add(delta, &self.attributes);
			}
		}
		self.last = snapshot;

		self.record_gauge("rpc.pending_requests", snapshot.pending_requests)?;
		self.record_gauge("rpc.open_ws_connections", snapshot.open_ws_connections)?;
		Ok(())
	}

	fn record_gauge(&self, name: &'static str, value: u64) -> Result<(), TelemetryError> {
		let instrument = self
			.meter
			.u64_observable_gauge(name)
			.try_init()
			.map_err(|e| TelemetryError::Record(e.to_string()))?;
		let attributes = self.attributes.clone();
		self.meter
			.register_callback(&[instrument.as_any()], move |observer| {
				observer.observe_u64(&instrument, value, &attributes)
			})
			.map_err(|e| TelemetryError::Record(e.to_string()))?;
		Ok(())
	}

	/// Flush loop; runs until the token fires.
	pub async fn run(mut self, metrics: Arc<RpcMetrics>, cancel: CancellationToken) {
		let mut ticker = tokio::time::interval(self.period);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = ticker.tick() => {
					if let Err(error) = self.flush(&metrics) {
						warn!(%error, "metrics flush failed");
					} else {
						debug!("metrics flushed");
					}
				},
			}
		}
	}
}
