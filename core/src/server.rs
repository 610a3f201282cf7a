//! The dispatcher: reads batches off codecs, validates and admits them,
//! invokes registered callables and writes responses.
//!
//! One reader loop per codec; every incoming message (single or batch) is
//! dispatched in its own worker task, so workers complete out of arrival
//! order and serialize only on the codec's write side. The dispatcher knows
//! nothing about transports beyond which serve entry point they use and
//! whether subscriptions are allowed.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Mutex as StdMutex,
	},
};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn, Instrument};

use crate::{
	codec::ServerCodec,
	error::{CodecError, RpcError},
	message::{self, CallKind, Response, RpcRequest},
	notifier::{self, Notifier, SubscriptionId, SubscriptionSink},
	registry::{CallCtx, Registry},
	telemetry::RpcMetrics,
	types::ServerLimits,
	utils::spawn_in_span,
};

/// Per-codec dispatch options. Method calls are always allowed;
/// subscriptions only on multi-shot transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServeOptions {
	pub allow_subscriptions: bool,
}

impl ServeOptions {
	pub fn multi_shot() -> Self {
		ServeOptions {
			allow_subscriptions: true,
		}
	}

	pub fn single_shot() -> Self {
		ServeOptions {
			allow_subscriptions: false,
		}
	}
}

/// JSON-RPC server core, shared by every transport of one endpoint.
pub struct Server {
	registry: Arc<Registry>,
	limits: ServerLimits,
	metrics: Arc<RpcMetrics>,
	run: AtomicBool,
	next_codec_id: AtomicU64,
	codecs: StdMutex<HashMap<u64, Arc<dyn ServerCodec>>>,
	tracker: TaskTracker,
	cancel: CancellationToken,
}

struct Session {
	server: Arc<Server>,
	codec: Arc<dyn ServerCodec>,
	notifier: Option<Arc<Notifier>>,
	in_flight: std::sync::atomic::AtomicUsize,
	drained: tokio::sync::Notify,
}

impl Session {
	fn new(server: Arc<Server>, codec: Arc<dyn ServerCodec>, options: ServeOptions) -> Arc<Self> {
		let notifier = options.allow_subscriptions.then(|| {
			Arc::new(Notifier::new(
				codec.clone(),
				server.limits.subscription_buffer,
			))
		});
		Arc::new(Session {
			server,
			codec,
			notifier,
			in_flight: std::sync::atomic::AtomicUsize::new(0),
			drained: tokio::sync::Notify::new(),
		})
	}

	/// Waits until every spawned worker of this connection has finished,
	/// so a graceful end-of-stream still gets its responses out.
	async fn drain(&self) {
		loop {
			let notified = self.drained.notified();
			if self.in_flight.load(Ordering::Acquire) == 0 {
				break;
			}
			notified.await;
		}
	}
}

impl Server {
	pub fn new(registry: Arc<Registry>, limits: ServerLimits) -> Arc<Self> {
		Arc::new(Server {
			registry,
			limits,
			metrics: Arc::new(RpcMetrics::default()),
			run: AtomicBool::new(true),
			next_codec_id: AtomicU64::new(0),
			codecs: StdMutex::new(HashMap::new()),
			tracker: TaskTracker::new(),
			cancel: CancellationToken::new(),
		})
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	pub fn limits(&self) -> &ServerLimits {
		&self.limits
	}

	pub fn metrics(&self) -> Arc<RpcMetrics> {
		self.metrics.clone()
	}

	pub fn is_running(&self) -> bool {
		self.run.load(Ordering::Acquire)
	}

	/// Cancelled when the server starts draining.
	pub fn cancel_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Serves a multi-shot codec until it closes. The codec is closed and
	/// every subscription on it cancelled before this returns.
	pub async fn serve_codec(self: &Arc<Self>, codec: Arc<dyn ServerCodec>, options: ServeOptions) {
		if !self.is_running() {
			codec.close();
			return;
		}

		let codec_id = self.track_codec(codec.clone());
		let session = Session::new(self.clone(), codec.clone(), options);

		loop {
			let raw = match codec.recv().await {
				Ok(raw) => raw,
				Err(CodecError::Oversized { limit }) => {
					self.metrics.requests_seen.fetch_add(1, Ordering::Relaxed);
					self.metrics.error_responses.fetch_add(1, Ordering::Relaxed);
					let err = RpcError::Parse(format!(
						"request exceeds the configured limit of {limit} bytes"
					));
					let body =
						message::serialize_responses(&[Response::failure(Value::Null, &err)], false);
					let _ = codec.send(body).await;
					break;
				},
				Err(_) => break,
			};

			if !self.dispatch_message(&session, raw, true).await {
				break;
			}
		}

		session.drain().await;
		if let Some(notifier) = &session.notifier {
			notifier.unsubscribe_all().await;
		}
		codec.close();
		self.untrack_codec(codec_id);
		debug!(remote = %codec.remote(), "connection closed");
	}

	/// Reads exactly one message (single or batch), processes it inline and
	/// returns without closing the codec. Used by single-shot transports.
	pub async fn serve_single_request(
		self: &Arc<Self>,
		codec: Arc<dyn ServerCodec>,
		options: ServeOptions,
	) {
		let session = Session::new(self.clone(), codec.clone(), options);

		let raw = match codec.recv().await {
			Ok(raw) => raw,
			Err(CodecError::Oversized { limit }) => {
				self.metrics.requests_seen.fetch_add(1, Ordering::Relaxed);
				self.metrics.error_responses.fetch_add(1, Ordering::Relaxed);
				let err = RpcError::Parse(format!(
					"request exceeds the configured limit of {limit} bytes"
				));
				let body =
					message::serialize_responses(&[Response::failure(Value::Null, &err)], false);
				let _ = codec.send(body).await;
				return;
			},
			Err(_) => return,
		};

		self.dispatch_message(&session, raw, false).await;
	}

	/// Flips the run flag, closes every live codec and waits for in-flight
	/// workers to drain. Idempotent.
	pub async fn stop(&self) {
		if !self.run.swap(false, Ordering::AcqRel) {
			return;
		}
		self.cancel.cancel();

		let codecs: Vec<Arc<dyn ServerCodec>> = {
			let codecs = self.codecs.lock().expect("codec set lock poisoned");
			codecs.values().cloned().collect()
		};
		for codec in codecs {
			codec.close();
		}

		self.tracker.close();
		self.tracker.wait().await;
	}

	fn track_codec(&self, codec: Arc<dyn ServerCodec>) -> u64 {
		let id = self.next_codec_id.fetch_add(1, Ordering::Relaxed);
		self.codecs
			.lock()
			.expect("codec set lock poisoned")
			.insert(id, codec);
		id
	}

	fn untrack_codec(&self, id: u64) {
		self.codecs
			.lock()
			.expect("codec set lock poisoned")
			.remove(&id);
	}

	/// Validates and admits one wire message, then runs it — spawned for
	/// multi-shot codecs, inline for single-shot ones. Returns whether the
	/// serve loop should keep going.
	async fn dispatch_message(self: &Arc<Self>, session: &Arc<Session>, raw: String, spawn: bool) -> bool {
		let (requests, is_batch) = match message::parse_message(&raw) {
			Ok(parsed) => parsed,
			Err(err) => {
				// parse error or empty batch: single response, codec stays open
				self.metrics.requests_seen.fetch_add(1, Ordering::Relaxed);
				self.metrics.error_responses.fetch_add(1, Ordering::Relaxed);
				let body =
					message::serialize_responses(&[Response::failure(Value::Null, &err)], false);
				return session.codec.send(body).await.is_ok();
			},
		};

		let count = requests.len() as u64;
		self.metrics
			.requests_seen
			.fetch_add(count, Ordering::Relaxed);

		let pending = self.metrics.pending_requests.load(Ordering::Acquire);
		if pending + count > self.limits.pending_request_limit as u64 {
			self.metrics
				.admission_drops
				.fetch_add(count, Ordering::Relaxed);
			let err = RpcError::InvalidRequest("too many pending requests".to_string());
			let body = message::serialize_responses(&[Response::failure(Value::Null, &err)], false);
			return session.codec.send(body).await.is_ok();
		}

		if !self.is_running() {
			let responses: Vec<Response> = requests
				.iter()
				.map(|request| Response::failure(request.error_id(), &RpcError::Shutdown))
				.collect();
			self.metrics
				.error_responses
				.fetch_add(count, Ordering::Relaxed);
			let body = message::serialize_responses(&responses, is_batch);
			let _ = session.codec.send(body).await;
			return false;
		}

		self.metrics
			.pending_requests
			.fetch_add(count, Ordering::Relaxed);
		session.in_flight.fetch_add(1, Ordering::AcqRel);

		let session = session.clone();
		let server = self.clone();
		let work = async move {
			handle_message(&session, requests, is_batch).await;
			server
				.metrics
				.pending_requests
				.fetch_sub(count, Ordering::Relaxed);
			if session.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
				session.drained.notify_waiters();
			}
		};

		let handle = self.tracker.spawn(work.in_current_span());
		if !spawn {
			// single-shot: wait for completion, but let the worker finish
			// its bookkeeping even if the caller times out and drops us
			let _ = handle.await;
		}
		true
	}
}

/// Runs one message's requests in order, writes the collected responses as
/// one JSON value, then flushes subscription activations.
async fn handle_message(session: &Arc<Session>, requests: Vec<RpcRequest>, is_batch: bool) {
	let mut responses = Vec::new();
	let mut activations: Vec<SubscriptionId> = Vec::new();

	for request in requests {
		let (response, activation) = handle_request(session, request).await;
		if let Some(response) = response {
			responses.push(response);
		}
		if let Some(id) = activation {
			activations.push(id);
		}
	}

	if !responses.is_empty() {
		let body = message::serialize_responses(&responses, is_batch);
		if session.codec.send(body).await.is_err() {
			warn!(remote = %session.codec.remote(), "response write failed, closing connection");
			if let Some(notifier) = &session.notifier {
				notifier.unsubscribe_all().await;
			}
			session.codec.close();
			return;
		}
	}

	// Activations run strictly after the response (or batch array) left,
	// so a subscription id is on the wire before its first notification.
	if let Some(notifier) = &session.notifier {
		for id in activations {
			notifier.activate(&id).await;
		}
	}
}

/// Handles a single request: pre-dispatch faults, pub/sub calls, then
/// regular method dispatch. Returns the response (absent for client
/// notifications) and a pending subscription activation, if any.
async fn handle_request(
	session: &Arc<Session>,
	request: RpcRequest,
) -> (Option<Response>, Option<SubscriptionId>) {
	let metrics = &session.server.metrics;

	if let Some(fault) = &request.fault {
		metrics.error_responses.fetch_add(1, Ordering::Relaxed);
		return (Some(Response::failure(request.error_id(), fault)), None);
	}

	let is_notification = request.is_notification();
	let outcome = invoke(session, &request).await;

	match outcome {
		Ok((value, activation)) => {
			metrics.success_responses.fetch_add(1, Ordering::Relaxed);
			let response =
				(!is_notification).then(|| Response::success(request.error_id(), value));
			(response, activation)
		},
		Err(err) => {
			metrics.error_responses.fetch_add(1, Ordering::Relaxed);
			let response = (!is_notification).then(|| Response::failure(request.error_id(), &err));
			(response, None)
		},
	}
}

async fn invoke(
	session: &Arc<Session>,
	request: &RpcRequest,
) -> Result<(Value, Option<SubscriptionId>), RpcError> {
	let server = &session.server;
	match request.kind() {
		CallKind::Unsubscribe { .. } => {
			let notifier = session
				.notifier
				.as_ref()
				.ok_or_else(|| RpcError::server("notifications not supported"))?;
			server
				.metrics
				.unsubscribe_requests
				.fetch_add(1, Ordering::Relaxed);

			let params = request.params_list()?;
			let id = match params.first() {
				Some(Value::String(id)) => SubscriptionId::from(id.as_str()),
				_ => {
					return Err(RpcError::InvalidParams(
						"subscription ID missing".to_string(),
					))
				},
			};
			if notifier.unsubscribe(&id).await {
				Ok((Value::Bool(true), None))
			} else {
				Err(RpcError::server("subscription not found"))
			}
		},
		CallKind::Subscribe { namespace } => {
			let notifier = session
				.notifier
				.as_ref()
				.ok_or_else(|| RpcError::server("notifications not supported"))?;
			server
				.metrics
				.subscribe_requests
				.fetch_add(1, Ordering::Relaxed);

			if notifier.count() >= server.limits.max_subscriptions_per_conn {
				return Err(RpcError::server(
					"max subscriptions per connection reached",
				));
			}

			let mut params = request.params_list()?;
			if params.is_empty() {
				return Err(RpcError::InvalidParams(
					"subscription topic missing".to_string(),
				));
			}
			let topic = match params.remove(0) {
				Value::String(topic) => topic,
				_ => {
					return Err(RpcError::InvalidParams(
						"subscription topic must be a string".to_string(),
					))
				},
			};

			let descriptor = server
				.registry
				.lookup_subscription(namespace, &topic)
				.ok_or_else(|| RpcError::SubscriptionNotFound {
					namespace: namespace.to_string(),
					topic: topic.clone(),
				})?;
			descriptor.arity.check(params.len())?;

			let sub_id = notifier.create_subscription(namespace).await;
			let (tx, rx) = mpsc::channel(server.limits.subscription_buffer);
			let sink = SubscriptionSink::new(sub_id.clone(), tx);

			match call_guarded((descriptor.handler)(sink, params)).await {
				Ok(()) => {
					spawn_in_span(notifier::forward(
						notifier.clone(),
						sub_id.clone(),
						rx,
						session.codec.closed(),
					));
					Ok((Value::String(sub_id.to_string()), Some(sub_id)))
				},
				Err(err) => {
					notifier.unsubscribe(&sub_id).await;
					Err(err)
				},
			}
		},
		CallKind::Method { namespace, method } => {
			let descriptor = server
				.registry
				.lookup(namespace, method)
				.ok_or_else(|| RpcError::MethodNotFound(request.method.clone()))?;

			let params = request.params_list()?;
			descriptor.arity.check(params.len())?;

			let ctx = CallCtx {
				cancel: session.codec.closed(),
				remote: session.codec.remote(),
			};
			call_guarded((descriptor.handler)(ctx, params))
				.await
				.map(|value| (value, None))
		},
		CallKind::Bare => Err(RpcError::MethodNotFound(request.method.clone())),
	}
}

/// Awaits a callable with panic isolation: a panicking handler yields an
/// internal error and the rest of the batch proceeds.
async fn call_guarded<T>(
	fut: impl std::future::Future<Output = Result<T, RpcError>>,
) -> Result<T, RpcError> {
	match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
		Ok(result) => result,
		Err(panic) => {
			let reason = panic
				.downcast_ref::<&str>()
				.map(|s| s.to_string())
				.or_else(|| panic.downcast_ref::<String>().cloned())
				.unwrap_or_else(|| "unknown panic".to_string());
			error!(%reason, "method handler crashed");
			Err(RpcError::Internal("method handler crashed".to_string()))
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		codec::StreamCodec,
		registry::{Arity, Module, Registry},
		types::ServerLimits,
	};
	use serde_json::{json, Value};
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};

	fn test_registry() -> Arc<Registry> {
		let registry = Registry::new();
		registry
			.register(
				"test",
				Module::new()
					.method("echo", Arity::exact(3), |_ctx, params| async move {
						Ok(json!({
							"String": params[0],
							"Int": params[1],
							"Args": params[2],
						}))
					})
					.method("ping", Arity::exact(0), |_ctx, _params| async {
						Ok(Value::String("pong".to_string()))
					})
					.method("fail", Arity::exact(0), |_ctx, _params| async {
						Err(RpcError::server("deliberate failure"))
					})
					.method("panic", Arity::exact(0), |_ctx, _params| async {
						if true {
							panic!("boom");
						}
						Ok(Value::Null)
					})
					.method("slow", Arity::exact(0), |_ctx, _params| async {
						tokio::time::sleep(std::time::Duration::from_millis(200)).await;
						Ok(Value::Null)
					})
					.subscription("ticks", Arity::any(), |sink, _params| async move {
						for tick in 0..3u64 {
							let _ = sink.send(json!(tick)).await;
						}
						Ok(())
					}),
			)
			.unwrap();
		registry
	}

	struct Harness {
		server: Arc<Server>,
		lines: Lines<BufReader<ReadHalf<tokio::io::DuplexStream>>>,
		writer: WriteHalf<tokio::io::DuplexStream>,
	}

	impl Harness {
		fn connect(limits: ServerLimits) -> Harness {
			let server = Server::new(test_registry(), limits);
			let (server_side, client_side) = tokio::io::duplex(1 << 20);
			let codec = Arc::new(StreamCodec::new(
				server_side,
				server.limits().max_request_len,
				"duplex",
			));
			let serve = server.clone();
			tokio::spawn(async move {
				serve.serve_codec(codec, ServeOptions::multi_shot()).await;
			});

			let (read_half, writer) = tokio::io::split(client_side);
			Harness {
				server,
				lines: BufReader::new(read_half).lines(),
				writer,
			}
		}

		async fn send(&mut self, raw: &str) {
			self.writer.write_all(raw.as_bytes()).await.unwrap();
			self.writer.write_all(b"\n").await.unwrap();
		}

		async fn recv(&mut self) -> String {
			self.lines.next_line().await.unwrap().unwrap()
		}

		async fn call(&mut self, raw: &str) -> String {
			self.send(raw).await;
			self.recv().await
		}
	}

	#[tokio::test]
	async fn echo_round_trips_typed_arguments() {
		let mut harness = Harness::connect(Default::default());
		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":1,"method":"test_echo","params":["hello",42,{"S":"x"}]}"#)
			.await;
		assert_eq!(
			reply,
			r#"{"jsonrpc":"2.0","id":1,"result":{"String":"hello","Int":42,"Args":{"S":"x"}}}"#
		);
	}

	#[tokio::test]
	async fn unknown_method_and_bare_names_are_rejected() {
		let mut harness = Harness::connect(Default::default());
		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":2,"method":"test_nope"}"#)
			.await;
		assert_eq!(
			reply,
			r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"the method test_nope does not exist/is not available"}}"#
		);

		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":3,"method":"bogus"}"#)
			.await;
		assert!(reply.contains("the method bogus does not exist"));
	}

	#[tokio::test]
	async fn parse_error_keeps_the_codec_open() {
		let mut harness = Harness::connect(Default::default());
		let reply = harness.call("{this is not json").await;
		let parsed: Response = serde_json::from_str(&reply).unwrap();
		assert_eq!(parsed.id, Value::Null);
		assert_eq!(parsed.error.unwrap().code, -32700);

		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":4,"method":"test_ping"}"#)
			.await;
		assert!(reply.contains("pong"));
	}

	#[tokio::test]
	async fn empty_batch_is_answered_with_invalid_request() {
		let mut harness = Harness::connect(Default::default());
		let reply = harness.call("[]").await;
		let parsed: Response = serde_json::from_str(&reply).unwrap();
		assert_eq!(parsed.error.unwrap().code, -32600);
	}

	#[tokio::test]
	async fn batch_responses_come_back_in_request_order() {
		let mut harness = Harness::connect(Default::default());
		let reply = harness
			.call(r#"[{"jsonrpc":"2.0","id":1,"method":"rpc_modules"},{"jsonrpc":"2.0","id":2,"method":"bogus"}]"#)
			.await;
		let batch: Vec<Response> = serde_json::from_str(&reply).unwrap();
		assert_eq!(batch.len(), 2);
		assert_eq!(batch[0].id, Value::from(1));
		assert!(batch[0].result.is_some());
		assert_eq!(batch[1].id, Value::from(2));
		assert_eq!(batch[1].error.as_ref().unwrap().code, -32601);
	}

	#[tokio::test]
	async fn notifications_are_executed_but_not_answered() {
		let mut harness = Harness::connect(Default::default());
		harness
			.send(r#"{"jsonrpc":"2.0","method":"test_ping"}"#)
			.await;
		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":9,"method":"test_ping"}"#)
			.await;
		// the first answer on the wire belongs to the identified request
		assert!(reply.contains(r#""id":9"#));
	}

	#[tokio::test]
	async fn panicking_handler_yields_internal_error_and_batch_continues() {
		let mut harness = Harness::connect(Default::default());
		let reply = harness
			.call(r#"[{"jsonrpc":"2.0","id":1,"method":"test_panic"},{"jsonrpc":"2.0","id":2,"method":"test_ping"}]"#)
			.await;
		let batch: Vec<Response> = serde_json::from_str(&reply).unwrap();
		assert_eq!(batch[0].error.as_ref().unwrap().code, -32603);
		assert_eq!(batch[1].result, Some(Value::String("pong".to_string())));

		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":3,"method":"test_ping"}"#)
			.await;
		assert!(reply.contains("pong"));
	}

	#[tokio::test]
	async fn callback_errors_carry_the_callable_message() {
		let mut harness = Harness::connect(Default::default());
		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":1,"method":"test_fail"}"#)
			.await;
		let parsed: Response = serde_json::from_str(&reply).unwrap();
		let error = parsed.error.unwrap();
		assert_eq!(error.code, -32000);
		assert_eq!(error.message, "deliberate failure");
	}

	#[tokio::test]
	async fn arity_mismatch_is_invalid_params() {
		let mut harness = Harness::connect(Default::default());
		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":1,"method":"test_echo","params":["only one"]}"#)
			.await;
		let parsed: Response = serde_json::from_str(&reply).unwrap();
		assert_eq!(parsed.error.unwrap().code, -32602);
	}

	#[tokio::test]
	async fn admission_rejects_work_past_the_pending_limit() {
		let limits = ServerLimits {
			pending_request_limit: 0,
			..Default::default()
		};
		let mut harness = Harness::connect(limits);
		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":1,"method":"test_ping"}"#)
			.await;
		let parsed: Response = serde_json::from_str(&reply).unwrap();
		assert_eq!(parsed.id, Value::Null);
		assert_eq!(parsed.error.unwrap().code, -32600);

		let snapshot = harness.server.metrics().snapshot();
		assert_eq!(snapshot.admission_drops, 1);
		assert_eq!(
			snapshot.requests_seen,
			snapshot.success_responses + snapshot.error_responses + snapshot.admission_drops
		);
	}

	#[tokio::test]
	async fn cleared_run_flag_answers_with_shutdown_errors() {
		let mut harness = Harness::connect(Default::default());
		harness.server.run.store(false, Ordering::Release);

		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":1,"method":"test_ping"}"#)
			.await;
		let parsed: Response = serde_json::from_str(&reply).unwrap();
		let error = parsed.error.unwrap();
		assert_eq!(error.code, -32603);
		assert_eq!(error.message, "server is shutting down");
	}

	#[tokio::test]
	async fn stopped_server_refuses_new_codecs() {
		let server = Server::new(test_registry(), Default::default());
		server.stop().await;

		let (server_side, _client_side) = tokio::io::duplex(1024);
		let codec = Arc::new(StreamCodec::new(server_side, 1 << 20, "late"));
		server
			.serve_codec(codec.clone(), ServeOptions::multi_shot())
			.await;
		assert!(codec.closed().is_cancelled());
	}

	#[tokio::test]
	async fn stop_drains_in_flight_workers() {
		let mut harness = Harness::connect(Default::default());
		harness
			.send(r#"{"jsonrpc":"2.0","id":1,"method":"test_slow"}"#)
			.await;
		// give the worker a moment to get admitted
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		harness.server.stop().await;
		assert_eq!(harness.server.metrics().snapshot().pending_requests, 0);
	}

	#[tokio::test]
	async fn subscription_flow_over_a_stream_codec() {
		let mut harness = Harness::connect(Default::default());
		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":10,"method":"test_subscribe","params":["ticks"]}"#)
			.await;
		let response: Response = serde_json::from_str(&reply).unwrap();
		let Some(Value::String(sub_id)) = response.result else {
			panic!("expected subscription id, got {reply}");
		};

		for expected in 0..3u64 {
			let event: Value = serde_json::from_str(&harness.recv().await).unwrap();
			assert_eq!(event["params"]["subscription"], Value::String(sub_id.clone()));
			assert_eq!(event["params"]["result"], json!(expected));
		}

		let reply = harness
			.call(&format!(
				r#"{{"jsonrpc":"2.0","id":11,"method":"test_unsubscribe","params":["{sub_id}"]}}"#
			))
			.await;
		assert!(reply.contains("true"));

		let reply = harness
			.call(&format!(
				r#"{{"jsonrpc":"2.0","id":12,"method":"test_unsubscribe","params":["{sub_id}"]}}"#
			))
			.await;
		assert!(reply.contains("subscription not found"));
	}

	#[tokio::test]
	async fn unknown_subscription_topic_is_reported() {
		let mut harness = Harness::connect(Default::default());
		let reply = harness
			.call(r#"{"jsonrpc":"2.0","id":1,"method":"test_subscribe","params":["nope"]}"#)
			.await;
		let parsed: Response = serde_json::from_str(&reply).unwrap();
		let error = parsed.error.unwrap();
		assert_eq!(error.code, -32601);
		assert!(error.message.contains("nope"));
	}

	#[tokio::test]
	async fn counters_are_conserved_across_mixed_traffic() {
		let mut harness = Harness::connect(Default::default());
		for i in 0..5 {
			harness
				.call(&format!(r#"{{"jsonrpc":"2.0","id":{i},"method":"test_ping"}}"#))
				.await;
		}
		harness
			.call(r#"{"jsonrpc":"2.0","id":9,"method":"test_fail"}"#)
			.await;
		harness.call("{bad json").await;

		let snapshot = harness.server.metrics().snapshot();
		assert_eq!(
			snapshot.requests_seen,
			snapshot.success_responses + snapshot.error_responses + snapshot.admission_drops
		);
		assert_eq!(snapshot.pending_requests, 0);
	}

	mod properties {
		use super::*;
		use proptest::prelude::*;

		proptest! {
			#![proptest_config(ProptestConfig::with_cases(32))]

			/// A batch of N requests always yields N responses with the
			/// ids echoed in request order.
			#[test]
			fn batches_preserve_arity_and_order(known in proptest::collection::vec(any::<bool>(), 1..16)) {
				let rt = tokio::runtime::Builder::new_current_thread()
					.enable_all()
					.build()
					.unwrap();
				rt.block_on(async move {
					let mut harness = Harness::connect(Default::default());
					let elements: Vec<String> = known
						.iter()
						.enumerate()
						.map(|(id, known)| {
							let method = if *known { "test_ping" } else { "test_missing" };
							format!(r#"{{"jsonrpc":"2.0","id":{id},"method":"{method}"}}"#)
						})
						.collect();
					let reply = harness.call(&format!("[{}]", elements.join(","))).await;
					let batch: Vec<Response> = serde_json::from_str(&reply).unwrap();

					prop_assert_eq!(batch.len(), known.len());
					for (id, (response, known)) in batch.iter().zip(known.iter()).enumerate() {
						prop_assert_eq!(&response.id, &Value::from(id as u64));
						prop_assert_eq!(response.error.is_none(), *known);
					}
					Ok(())
				})?;
			}
		}
	}
}
