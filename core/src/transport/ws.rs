//! WebSocket transport: long-lived codec with subscription support.
//!
//! The upgrade handshake enforces the origin allow-list and the global
//! connection cap before the socket exists. An upgraded connection splits
//! into a writer task fed by the codec's outgoing channel and a read loop
//! feeding its incoming one; the dispatcher serves the codec until either
//! side goes away.

use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tracing::{debug, info_span, Instrument};
use warp::{
	http::HeaderValue,
	ws::{Message, WebSocket},
	Filter, Rejection, Reply,
};

use crate::{
	codec::{ChannelCodec, ServerCodec},
	server::{ServeOptions, Server},
	transport::ApiReject,
	types::WsConfig,
	utils::spawn_in_span,
};

/// Frames buffered between the socket pump tasks and the codec.
const FRAME_BUFFER: usize = 64;

/// WebSocket upgrade route. With `config` absent the route stays mounted
/// but answers 404, which lets an HTTP endpoint opt out of sharing its port.
pub fn route(
	server: Arc<Server>,
	config: Option<WsConfig>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::path::end()
		.and(warp::ws())
		.and(warp::header::optional::<String>("origin"))
		.and(warp::header::optional::<String>("sec-websocket-protocol"))
		.and(warp::header::optional::<String>("host"))
		.and(warp::any().map(move || server.clone()))
		.and(warp::any().map(move || config.clone()))
		.and_then(upgrade)
}

async fn upgrade(
	ws: warp::ws::Ws,
	origin: Option<String>,
	protocol: Option<String>,
	host: Option<String>,
	server: Arc<Server>,
	config: Option<WsConfig>,
) -> Result<warp::reply::Response, Rejection> {
	let Some(config) = config else {
		return Err(warp::reject::not_found());
	};

	if !origin_allowed(origin.as_deref(), &config.origins, host.as_deref()) {
		return Err(warp::reject::custom(ApiReject::ForbiddenOrigin));
	}

	let open = server
		.metrics()
		.open_ws_connections
		.load(std::sync::atomic::Ordering::Acquire);
	if open >= server.limits().max_ws_connections as u64 {
		return Err(warp::reject::custom(ApiReject::TooManyConnections));
	}

	let deadline = config.read_deadline();
	let remote = origin.unwrap_or_else(|| "websocket".to_string());
	let mut response = ws
		.on_upgrade(move |socket| {
			let span = info_span!("ws_connection", remote = %remote);
			connection(socket, server, deadline, remote.clone()).instrument(span)
		})
		.into_response();

	if let Some(protocol) = protocol {
		if let Ok(value) = HeaderValue::from_str(&protocol) {
			response
				.headers_mut()
				.insert("sec-websocket-protocol", value);
		}
	}
	Ok(response)
}

/// Origin policy: `*` accepts anything, an empty allow-list accepts
/// localhost plus the host's own name, and non-browser clients without an
/// `Origin` header always pass.
fn origin_allowed(origin: Option<&str>, allow: &[String], host: Option<&str>) -> bool {
	if allow.iter().any(|entry| entry == "*") {
		return true;
	}
	let Some(origin) = origin else { return true };
	let origin_host = strip_origin(origin);

	if allow.is_empty() {
		let own_host = host.map(strip_host).unwrap_or_default();
		return origin_host.eq_ignore_ascii_case("localhost")
			|| origin_host == "127.0.0.1"
			|| origin_host == "::1"
			|| (!own_host.is_empty() && origin_host.eq_ignore_ascii_case(own_host));
	}

	allow.iter().any(|entry| {
		entry.eq_ignore_ascii_case(origin) || entry.eq_ignore_ascii_case(origin_host)
	})
}

fn strip_origin(origin: &str) -> &str {
	let without_scheme = origin.split("://").nth(1).unwrap_or(origin);
	strip_host(without_scheme)
}

fn strip_host(host: &str) -> &str {
	if let Some(rest) = host.strip_prefix('[') {
		rest.split(']').next().unwrap_or("")
	} else {
		host.split(':').next().unwrap_or(host)
	}
}

async fn connection(
	socket: WebSocket,
	server: Arc<Server>,
	deadline: Option<Duration>,
	remote: String,
) {
	let metrics = server.metrics();
	metrics
		.open_ws_connections
		.fetch_add(1, std::sync::atomic::Ordering::AcqRel);

	let limit = server.limits().max_request_len;
	let (codec, incoming, mut outgoing) = ChannelCodec::new(limit, FRAME_BUFFER, remote);
	let codec = Arc::new(codec);

	let (mut ws_tx, mut ws_rx) = socket.split();

	let write_codec = codec.clone();
	let write_closed = codec.closed();
	spawn_in_span(async move {
		loop {
			tokio::select! {
				frame = outgoing.recv() => match frame {
					Some(frame) => {
						if ws_tx.send(Message::text(frame)).await.is_err() {
							write_codec.close();
							break;
						}
					},
					None => break,
				},
				_ = write_closed.cancelled() => {
					// flush frames that were queued before the close
					while let Ok(frame) = outgoing.try_recv() {
						if ws_tx.send(Message::text(frame)).await.is_err() {
							break;
						}
					}
					break;
				},
			}
		}
		let _ = ws_tx.close().await;
	});

	let read_codec = codec.clone();
	let read_closed = codec.closed();
	spawn_in_span(async move {
		loop {
			// a cancelled codec reads as end-of-stream
			let next = async {
				tokio::select! {
					_ = read_closed.cancelled() => None,
					received = ws_rx.next() => received,
				}
			};
			let received = match deadline {
				Some(deadline) => match tokio::time::timeout(deadline, next).await {
					Ok(received) => received,
					Err(_) => {
						debug!("read deadline expired, closing connection");
						read_codec.close();
						break;
					},
				},
				None => next.await,
			};

			match received {
				Some(Ok(message)) if message.is_text() || message.is_binary() => {
					let Ok(frame) = String::from_utf8(message.into_bytes()) else {
						continue;
					};
					if incoming.send(frame).await.is_err() {
						break;
					}
				},
				Some(Ok(message)) if message.is_close() => {
					read_codec.close();
					break;
				},
				// ping/pong are answered by the protocol layer
				Some(Ok(_)) => continue,
				Some(Err(_)) | None => {
					read_codec.close();
					break;
				},
			}
		}
	});

	server
		.serve_codec(codec, ServeOptions::multi_shot())
		.await;

	metrics
		.open_ws_connections
		.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		message::Response,
		registry::{Arity, Module, Registry},
		types::ServerLimits,
	};
	use serde_json::{json, Value};

	fn test_server(limits: ServerLimits) -> Arc<Server> {
		let registry = Registry::new();
		registry
			.register(
				"test",
				Module::new()
					.method("ping", Arity::exact(0), |_ctx, _params| async {
						Ok(Value::String("pong".to_string()))
					})
					.subscription("ticks", Arity::any(), |sink, _params| async move {
						for tick in 0..3u64 {
							let _ = sink.send(json!(tick)).await;
						}
						Ok(())
					}),
			)
			.unwrap();
		Server::new(registry, limits)
	}

	fn ws_filter(
		server: Arc<Server>,
	) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
		route(server, Some(WsConfig::default())).recover(crate::transport::handle_rejection)
	}

	#[tokio::test]
	async fn call_over_websocket_round_trips() {
		let route = ws_filter(test_server(Default::default()));
		let mut client = warp::test::ws().path("/").handshake(route).await.unwrap();

		client
			.send_text(r#"{"jsonrpc":"2.0","id":1,"method":"test_ping"}"#)
			.await;
		let reply = client.recv().await.unwrap();
		assert_eq!(
			reply.to_str().unwrap(),
			r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#
		);
	}

	#[tokio::test]
	async fn subscribe_notify_unsubscribe_flow() {
		let route = ws_filter(test_server(Default::default()));
		let mut client = warp::test::ws().path("/").handshake(route).await.unwrap();

		client
			.send_text(r#"{"jsonrpc":"2.0","id":10,"method":"test_subscribe","params":["ticks"]}"#)
			.await;

		// creation response arrives before any notification
		let reply = client.recv().await.unwrap();
		let response: Response = serde_json::from_str(reply.to_str().unwrap()).unwrap();
		let Some(Value::String(sub_id)) = response.result else {
			panic!("expected subscription id, got {response:?}");
		};
		assert!(sub_id.starts_with("0x"));
		assert_eq!(sub_id.len(), 34);

		for expected in 0..3u64 {
			let event = client.recv().await.unwrap();
			let event: Value = serde_json::from_str(event.to_str().unwrap()).unwrap();
			assert_eq!(event["method"], "test_subscription");
			assert_eq!(event["params"]["subscription"], Value::String(sub_id.clone()));
			assert_eq!(event["params"]["result"], json!(expected));
		}

		client
			.send_text(format!(
				r#"{{"jsonrpc":"2.0","id":11,"method":"test_unsubscribe","params":["{sub_id}"]}}"#
			))
			.await;
		let reply = client.recv().await.unwrap();
		assert_eq!(
			reply.to_str().unwrap(),
			r#"{"jsonrpc":"2.0","id":11,"result":true}"#
		);
	}

	#[tokio::test]
	async fn unsubscribe_with_unknown_id_fails() {
		let route = ws_filter(test_server(Default::default()));
		let mut client = warp::test::ws().path("/").handshake(route).await.unwrap();

		client
			.send_text(r#"{"jsonrpc":"2.0","id":1,"method":"test_unsubscribe","params":["0xdeadbeef"]}"#)
			.await;
		let reply = client.recv().await.unwrap();
		let response: Response = serde_json::from_str(reply.to_str().unwrap()).unwrap();
		let error = response.error.unwrap();
		assert_eq!(error.code, -32000);
		assert_eq!(error.message, "subscription not found");
	}

	#[tokio::test]
	async fn parse_error_keeps_the_connection_open() {
		let route = ws_filter(test_server(Default::default()));
		let mut client = warp::test::ws().path("/").handshake(route).await.unwrap();

		client.send_text("{this is not json").await;
		let reply = client.recv().await.unwrap();
		let response: Response = serde_json::from_str(reply.to_str().unwrap()).unwrap();
		assert_eq!(response.error.unwrap().code, -32700);

		client
			.send_text(r#"{"jsonrpc":"2.0","id":2,"method":"test_ping"}"#)
			.await;
		let reply = client.recv().await.unwrap();
		assert!(reply.to_str().unwrap().contains("pong"));
	}

	#[tokio::test]
	async fn foreign_origin_is_rejected() {
		let route = ws_filter(test_server(Default::default()));
		let result = warp::test::ws()
			.path("/")
			.header("origin", "http://evil.example.com")
			.handshake(route)
			.await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn localhost_origin_is_accepted_by_default() {
		let route = ws_filter(test_server(Default::default()));
		let result = warp::test::ws()
			.path("/")
			.header("origin", "http://localhost:3000")
			.handshake(route)
			.await;
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn connection_cap_refuses_the_handshake() {
		let limits = ServerLimits {
			max_ws_connections: 0,
			..Default::default()
		};
		let route = ws_filter(test_server(limits));
		let result = warp::test::ws().path("/").handshake(route).await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn subscription_cap_is_enforced_per_connection() {
		let limits = ServerLimits {
			max_subscriptions_per_conn: 1,
			..Default::default()
		};
		let route = ws_filter(test_server(limits));
		let mut client = warp::test::ws().path("/").handshake(route).await.unwrap();

		client
			.send_text(r#"{"jsonrpc":"2.0","id":1,"method":"test_subscribe","params":["ticks"]}"#)
			.await;
		let first: Response =
			serde_json::from_str(client.recv().await.unwrap().to_str().unwrap()).unwrap();
		assert!(first.error.is_none());

		// drain the three buffered ticks of the first subscription
		for _ in 0..3 {
			client.recv().await.unwrap();
		}

		client
			.send_text(r#"{"jsonrpc":"2.0","id":2,"method":"test_subscribe","params":["ticks"]}"#)
			.await;
		let second: Response =
			serde_json::from_str(client.recv().await.unwrap().to_str().unwrap()).unwrap();
		let error = second.error.unwrap();
		assert_eq!(error.code, -32000);
		assert_eq!(error.message, "max subscriptions per connection reached");
	}
}
