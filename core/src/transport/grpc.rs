//! gRPC transport: two RPCs on one service, both carrying JSON-RPC
//! envelopes as opaque payload bytes.
//!
//! `Call` maps one envelope onto `serve_single_request`; `BiCall` is a
//! long-lived bidirectional stream with the same semantics as a WebSocket
//! connection, subscriptions included. The service and client glue are
//! written out in the shape `tonic-build` emits, which keeps protoc out of
//! the build.

use std::{io, net::SocketAddr, sync::Arc};

use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::info;

use crate::{
	codec::{BufferedCodec, ChannelCodec, ServerCodec},
	server::{ServeOptions, Server},
	types::GrpcConfig,
	utils::spawn_in_span,
};

/// Envelopes buffered per direction on a `BiCall` stream.
const STREAM_BUFFER: usize = 64;

/// Wire message: `payload` is one JSON-RPC envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(bytes = "vec", tag = "1")]
	pub payload: Vec<u8>,
}

/// Adapts the dispatcher to the gRPC service surface.
pub struct NodeRpcService {
	server: Arc<Server>,
}

impl NodeRpcService {
	pub fn new(server: Arc<Server>) -> Self {
		NodeRpcService { server }
	}
}

#[tonic::async_trait]
impl node_rpc_server::NodeRpc for NodeRpcService {
	async fn call(&self, request: Request<Envelope>) -> Result<Response<Envelope>, Status> {
		let payload = String::from_utf8(request.into_inner().payload)
			.map_err(|_| Status::invalid_argument("payload is not valid UTF-8"))?;

		let codec = Arc::new(BufferedCodec::new(payload, "grpc"));
		self.server
			.serve_single_request(codec.clone(), ServeOptions::single_shot())
			.await;

		let output = codec.take_output().unwrap_or_default();
		Ok(Response::new(Envelope {
			payload: output.into_bytes(),
		}))
	}

	type BiCallStream = ReceiverStream<Result<Envelope, Status>>;

	async fn bi_call(
		&self,
		request: Request<Streaming<Envelope>>,
	) -> Result<Response<Self::BiCallStream>, Status> {
		let mut inbound = request.into_inner();
		let limit = self.server.limits().max_request_len;
		let (codec, incoming, mut outgoing) = ChannelCodec::new(limit, STREAM_BUFFER, "grpc");
		let codec = Arc::new(codec);

		let read_codec = codec.clone();
		let read_closed = codec.closed();
		spawn_in_span(async move {
			loop {
				let received = tokio::select! {
					_ = read_closed.cancelled() => break,
					received = inbound.message() => received,
				};
				match received {
					Ok(Some(envelope)) => {
						let Ok(frame) = String::from_utf8(envelope.payload) else {
							continue;
						};
						if incoming.send(frame).await.is_err() {
							break;
						}
					},
					// half-close: stop feeding, let in-flight work drain
					Ok(None) => break,
					Err(_) => {
						read_codec.close();
						break;
					},
				}
			}
		});

		let (reply_tx, reply_rx) = tokio::sync::mpsc::channel(STREAM_BUFFER);
		let write_codec = codec.clone();
		let write_closed = codec.closed();
		spawn_in_span(async move {
			loop {
				tokio::select! {
					frame = outgoing.recv() => match frame {
						Some(frame) => {
							let envelope = Envelope { payload: frame.into_bytes() };
							if reply_tx.send(Ok(envelope)).await.is_err() {
								write_codec.close();
								break;
							}
						},
						None => break,
					},
					_ = write_closed.cancelled() => {
						while let Ok(frame) = outgoing.try_recv() {
							let envelope = Envelope { payload: frame.into_bytes() };
							if reply_tx.send(Ok(envelope)).await.is_err() {
								break;
							}
						}
						break;
					},
				}
			}
		});

		let server = self.server.clone();
		spawn_in_span(async move {
			server.serve_codec(codec, ServeOptions::multi_shot()).await;
		});

		Ok(Response::new(ReceiverStream::new(reply_rx)))
	}
}

/// A bound gRPC endpoint; `port 0` resolves to the kernel-assigned port.
pub struct GrpcEndpoint {
	addr: SocketAddr,
	cancel: CancellationToken,
	handle: tokio::task::JoinHandle<()>,
}

impl GrpcEndpoint {
	pub async fn bind(server: Arc<Server>, config: GrpcConfig) -> io::Result<GrpcEndpoint> {
		let listener =
			tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
		let addr = listener.local_addr()?;
		info!(%addr, "gRPC endpoint ready");

		let cancel = CancellationToken::new();
		let shutdown = cancel.clone();
		let service = node_rpc_server::NodeRpcServer::new(NodeRpcService::new(server));
		let handle = spawn_in_span(async move {
			let router = tonic::transport::Server::builder().add_service(service);
			let _ = router
				.serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
					shutdown.cancelled().await;
				})
				.await;
		});

		Ok(GrpcEndpoint {
			addr,
			cancel,
			handle,
		})
	}

	pub fn addr(&self) -> SocketAddr {
		self.addr
	}

	pub async fn stop(self) {
		self.cancel.cancel();
		let _ = self.handle.await;
	}
}

/// Service glue in the shape `tonic-build` emits.
pub mod node_rpc_server {
	#![allow(unused_variables, dead_code, missing_docs)]
	use tonic::codegen::*;

	#[async_trait]
	pub trait NodeRpc: std::marker::Send + std::marker::Sync + 'static {
		async fn call(
			&self,
			request: tonic::Request<super::Envelope>,
		) -> std::result::Result<tonic::Response<super::Envelope>, tonic::Status>;
		type BiCallStream: tonic::codegen::tokio_stream::Stream<
				Item = std::result::Result<super::Envelope, tonic::Status>,
			> + std::marker::Send
			+ 'static;
		async fn bi_call(
			&self,
			request: tonic::Request<tonic::Streaming<super::Envelope>>,
		) -> std::result::Result<tonic::Response<Self::BiCallStream>, tonic::Status>;
	}

	#[derive(Debug)]
	pub struct NodeRpcServer<T> {
		inner: Arc<T>,
	}

	impl<T> NodeRpcServer<T> {
		pub fn new(inner: T) -> Self {
			Self::from_arc(Arc::new(inner))
		}

		pub fn from_arc(inner: Arc<T>) -> Self {
			Self { inner }
		}
	}

	impl<T, B> tonic::codegen::Service<http::Request<B>> for NodeRpcServer<T>
	where
		T: NodeRpc,
		B: Body + std::marker::Send + 'static,
		B::Error: Into<StdError> + std::marker::Send + 'static,
	{
		type Response = http::Response<tonic::body::BoxBody>;
		type Error = std::convert::Infallible;
		type Future = BoxFuture<Self::Response, Self::Error>;

		fn poll_ready(
			&mut self,
			_cx: &mut Context<'_>,
		) -> Poll<std::result::Result<(), Self::Error>> {
			Poll::Ready(Ok(()))
		}

		fn call(&mut self, req: http::Request<B>) -> Self::Future {
			match req.uri().path() {
				"/lattice.rpc.NodeRpc/Call" => {
					#[allow(non_camel_case_types)]
					struct CallSvc<T: NodeRpc>(pub Arc<T>);
					impl<T: NodeRpc> tonic::server::UnaryService<super::Envelope> for CallSvc<T> {
						type Response = super::Envelope;
						type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
						fn call(
							&mut self,
							request: tonic::Request<super::Envelope>,
						) -> Self::Future {
							let inner = Arc::clone(&self.0);
							let fut = async move { <T as NodeRpc>::call(&inner, request).await };
							Box::pin(fut)
						}
					}
					let inner = self.inner.clone();
					let fut = async move {
						let method = CallSvc(inner);
						let codec = tonic::codec::ProstCodec::default();
						let mut grpc = tonic::server::Grpc::new(codec);
						let res = grpc.unary(method, req).await;
						Ok(res)
					};
					Box::pin(fut)
				},
				"/lattice.rpc.NodeRpc/BiCall" => {
					#[allow(non_camel_case_types)]
					struct BiCallSvc<T: NodeRpc>(pub Arc<T>);
					impl<T: NodeRpc> tonic::server::StreamingService<super::Envelope> for BiCallSvc<T> {
						type Response = super::Envelope;
						type ResponseStream = T::BiCallStream;
						type Future =
							BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;
						fn call(
							&mut self,
							request: tonic::Request<tonic::Streaming<super::Envelope>>,
						) -> Self::Future {
							let inner = Arc::clone(&self.0);
							let fut =
								async move { <T as NodeRpc>::bi_call(&inner, request).await };
							Box::pin(fut)
						}
					}
					let inner = self.inner.clone();
					let fut = async move {
						let method = BiCallSvc(inner);
						let codec = tonic::codec::ProstCodec::default();
						let mut grpc = tonic::server::Grpc::new(codec);
						let res = grpc.streaming(method, req).await;
						Ok(res)
					};
					Box::pin(fut)
				},
				_ => Box::pin(async move {
					Ok(http::Response::builder()
						.status(200)
						.header("grpc-status", tonic::Code::Unimplemented as i32)
						.header(
							http::header::CONTENT_TYPE,
							tonic::metadata::GRPC_CONTENT_TYPE,
						)
						.body(empty_body())
						.unwrap())
				}),
			}
		}
	}

	impl<T> Clone for NodeRpcServer<T> {
		fn clone(&self) -> Self {
			Self {
				inner: self.inner.clone(),
			}
		}
	}

	pub const SERVICE_NAME: &str = "lattice.rpc.NodeRpc";

	impl<T> tonic::server::NamedService for NodeRpcServer<T> {
		const NAME: &'static str = SERVICE_NAME;
	}
}

/// Client glue in the shape `tonic-build` emits.
pub mod node_rpc_client {
	#![allow(unused_variables, dead_code, missing_docs)]
	use tonic::codegen::*;

	#[derive(Debug, Clone)]
	pub struct NodeRpcClient<T> {
		inner: tonic::client::Grpc<T>,
	}

	impl NodeRpcClient<tonic::transport::Channel> {
		pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
		where
			D: TryInto<tonic::transport::Endpoint>,
			D::Error: Into<StdError>,
		{
			let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
			Ok(Self::new(conn))
		}
	}

	impl<T> NodeRpcClient<T>
	where
		T: tonic::client::GrpcService<tonic::body::BoxBody>,
		T::Error: Into<StdError>,
		T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
		<T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
	{
		pub fn new(inner: T) -> Self {
			let inner = tonic::client::Grpc::new(inner);
			Self { inner }
		}

		pub async fn call(
			&mut self,
			request: impl tonic::IntoRequest<super::Envelope>,
		) -> std::result::Result<tonic::Response<super::Envelope>, tonic::Status> {
			self.inner.ready().await.map_err(|e| {
				tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
			})?;
			let codec = tonic::codec::ProstCodec::default();
			let path = http::uri::PathAndQuery::from_static("/lattice.rpc.NodeRpc/Call");
			let mut req = request.into_request();
			req.extensions_mut()
				.insert(GrpcMethod::new("lattice.rpc.NodeRpc", "Call"));
			self.inner.unary(req, path, codec).await
		}

		pub async fn bi_call(
			&mut self,
			request: impl tonic::IntoStreamingRequest<Message = super::Envelope>,
		) -> std::result::Result<
			tonic::Response<tonic::codec::Streaming<super::Envelope>>,
			tonic::Status,
		> {
			self.inner.ready().await.map_err(|e| {
				tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
			})?;
			let codec = tonic::codec::ProstCodec::default();
			let path = http::uri::PathAndQuery::from_static("/lattice.rpc.NodeRpc/BiCall");
			let mut req = request.into_streaming_request();
			req.extensions_mut()
				.insert(GrpcMethod::new("lattice.rpc.NodeRpc", "BiCall"));
			self.inner.streaming(req, path, codec).await
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::{Arity, Module, Registry};
	use serde_json::{json, Value};

	fn test_server() -> Arc<Server> {
		let registry = Registry::new();
		registry
			.register(
				"test",
				Module::new()
					.method("ping", Arity::exact(0), |_ctx, _params| async {
						Ok(Value::String("pong".to_string()))
					})
					.subscription("ticks", Arity::any(), |sink, _params| async move {
						for tick in 0..2u64 {
							let _ = sink.send(json!(tick)).await;
						}
						Ok(())
					}),
			)
			.unwrap();
		Server::new(registry, Default::default())
	}

	fn envelope(payload: &str) -> Envelope {
		Envelope {
			payload: payload.as_bytes().to_vec(),
		}
	}

	fn payload_str(envelope: &Envelope) -> &str {
		std::str::from_utf8(&envelope.payload).unwrap()
	}

	#[tokio::test]
	async fn unary_call_round_trips() {
		let endpoint = GrpcEndpoint::bind(
			test_server(),
			GrpcConfig {
				host: "127.0.0.1".to_string(),
				port: 0,
			},
		)
		.await
		.unwrap();

		let mut client =
			node_rpc_client::NodeRpcClient::connect(format!("http://{}", endpoint.addr()))
				.await
				.unwrap();

		let response = client
			.call(envelope(r#"{"jsonrpc":"2.0","id":1,"method":"test_ping"}"#))
			.await
			.unwrap();
		assert_eq!(
			payload_str(response.get_ref()),
			r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#
		);

		endpoint.stop().await;
	}

	#[tokio::test]
	async fn unary_call_refuses_subscriptions() {
		let endpoint = GrpcEndpoint::bind(
			test_server(),
			GrpcConfig {
				host: "127.0.0.1".to_string(),
				port: 0,
			},
		)
		.await
		.unwrap();

		let mut client =
			node_rpc_client::NodeRpcClient::connect(format!("http://{}", endpoint.addr()))
				.await
				.unwrap();

		let response = client
			.call(envelope(
				r#"{"jsonrpc":"2.0","id":1,"method":"test_subscribe","params":["ticks"]}"#,
			))
			.await
			.unwrap();
		assert!(payload_str(response.get_ref()).contains("notifications not supported"));

		endpoint.stop().await;
	}

	#[tokio::test]
	async fn bidirectional_stream_supports_subscriptions() {
		let endpoint = GrpcEndpoint::bind(
			test_server(),
			GrpcConfig {
				host: "127.0.0.1".to_string(),
				port: 0,
			},
		)
		.await
		.unwrap();

		let mut client =
			node_rpc_client::NodeRpcClient::connect(format!("http://{}", endpoint.addr()))
				.await
				.unwrap();

		// keep the send stream open while notifications flow; half-closing
		// it ends the session like a WebSocket close would
		let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel(4);
		outbound_tx
			.send(envelope(
				r#"{"jsonrpc":"2.0","id":10,"method":"test_subscribe","params":["ticks"]}"#,
			))
			.await
			.unwrap();
		let mut inbound = client
			.bi_call(ReceiverStream::new(outbound_rx))
			.await
			.unwrap()
			.into_inner();

		let reply = inbound.message().await.unwrap().unwrap();
		let response: Value = serde_json::from_str(payload_str(&reply)).unwrap();
		let sub_id = response["result"].as_str().unwrap().to_string();
		assert!(sub_id.starts_with("0x"));

		for expected in 0..2u64 {
			let event = inbound.message().await.unwrap().unwrap();
			let event: Value = serde_json::from_str(payload_str(&event)).unwrap();
			assert_eq!(event["method"], "test_subscription");
			assert_eq!(event["params"]["result"], json!(expected));
		}

		drop(outbound_tx);
		assert!(inbound.message().await.unwrap().is_none());

		endpoint.stop().await;
	}

	#[tokio::test]
	async fn stream_half_close_drains_responses() {
		let endpoint = GrpcEndpoint::bind(
			test_server(),
			GrpcConfig {
				host: "127.0.0.1".to_string(),
				port: 0,
			},
		)
		.await
		.unwrap();

		let mut client =
			node_rpc_client::NodeRpcClient::connect(format!("http://{}", endpoint.addr()))
				.await
				.unwrap();

		let outbound = tokio_stream::iter(vec![
			envelope(r#"{"jsonrpc":"2.0","id":1,"method":"test_ping"}"#),
			envelope(r#"{"jsonrpc":"2.0","id":2,"method":"test_ping"}"#),
		]);
		let mut inbound = client.bi_call(outbound).await.unwrap().into_inner();

		let mut ids = Vec::new();
		while let Some(reply) = inbound.message().await.unwrap() {
			let response: Value = serde_json::from_str(payload_str(&reply)).unwrap();
			ids.push(response["id"].as_u64().unwrap());
		}
		ids.sort_unstable();
		assert_eq!(ids, vec![1, 2]);

		endpoint.stop().await;
	}
}
