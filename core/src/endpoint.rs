//! Endpoint lifecycle: starting and stopping HTTP and WebSocket listeners
//! at runtime, plus the `admin` namespace exposing those operations.
//!
//! Every started endpoint gets its own [`Server`] over a registry filtered
//! by the requested namespace allow-list; stopping drains in-flight work
//! before the listener goes away. The IPC and gRPC endpoints bind at
//! process start and are not managed here.

use std::{net::SocketAddr, sync::{Arc, Weak}};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warp::Filter;

use crate::{
	error::RpcError,
	registry::{Arity, CallCtx, Module, Registry},
	server::Server,
	transport::{handle_rejection, http, ws},
	types::{HttpConfig, ServerLimits, WsConfig},
	utils::spawn_in_span,
};

#[derive(Debug, Error)]
pub enum EndpointError {
	#[error("endpoint already running on {0}")]
	AlreadyRunning(SocketAddr),
	#[error("endpoint is not running")]
	NotRunning,
	#[error("invalid listen address {0}")]
	InvalidAddress(String),
	#[error("bind failed: {0}")]
	Bind(String),
}

struct Running {
	addr: SocketAddr,
	server: Arc<Server>,
	cancel: CancellationToken,
	handle: tokio::task::JoinHandle<()>,
}

/// How long to wait for the listener to finish draining before detaching.
/// A stop issued through `admin_stopHTTP` arrives on the very listener it
/// is stopping, so its own request holds the drain open until it answers.
const LISTENER_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

async fn stop_running(running: Running) {
	running.cancel.cancel();

	// the stop itself may be executing as one of the server's own workers,
	// so both drains are bounded rather than awaited to completion
	if tokio::time::timeout(LISTENER_DRAIN_TIMEOUT, running.server.stop())
		.await
		.is_err()
	{
		warn!("request drain timed out while stopping endpoint");
	}

	let mut handle = running.handle;
	if tokio::time::timeout(LISTENER_DRAIN_TIMEOUT, &mut handle)
		.await
		.is_err()
	{
		spawn_in_span(async move {
			let _ = handle.await;
		});
	}
}

fn listen_addr(host: &str, port: u16) -> Result<SocketAddr, EndpointError> {
	format!("{host}:{port}")
		.parse()
		.map_err(|_| EndpointError::InvalidAddress(format!("{host}:{port}")))
}

/// Runtime-startable HTTP endpoint.
pub struct HttpEndpoint {
	registry: Arc<Registry>,
	limits: ServerLimits,
	running: AsyncMutex<Option<Running>>,
}

impl HttpEndpoint {
	pub fn new(registry: Arc<Registry>, limits: ServerLimits) -> Self {
		HttpEndpoint {
			registry,
			limits,
			running: AsyncMutex::new(None),
		}
	}

	/// Binds the endpoint; `port 0` resolves to the kernel-assigned port,
	/// returned for callers to probe. `apis` filters the served namespaces,
	/// empty meaning all. `ws` additionally mounts the WebSocket upgrade on
	/// the same port.
	pub async fn start(
		&self,
		config: HttpConfig,
		ws: Option<WsConfig>,
		apis: &[String],
	) -> Result<SocketAddr, EndpointError> {
		let mut running = self.running.lock().await;
		if let Some(running) = running.as_ref() {
			return Err(EndpointError::AlreadyRunning(running.addr));
		}

		let server = Server::new(self.registry.filtered(apis), self.limits.clone());
		let routes = http::routes(server.clone(), config.clone(), ws);
		let addr = listen_addr(&config.host, config.port)?;

		let cancel = CancellationToken::new();
		let signal = cancel.clone();
		let (bound, serve) = warp::serve(routes)
			.try_bind_with_graceful_shutdown(addr, async move { signal.cancelled().await })
			.map_err(|e| EndpointError::Bind(e.to_string()))?;
		let handle = spawn_in_span(serve);
		info!(addr = %bound, "HTTP endpoint ready");

		*running = Some(Running {
			addr: bound,
			server,
			cancel,
			handle,
		});
		Ok(bound)
	}

	/// Closes the listener and waits for in-flight requests to drain.
	pub async fn stop(&self) -> Result<(), EndpointError> {
		let mut running = self.running.lock().await;
		let running = running.take().ok_or(EndpointError::NotRunning)?;
		stop_running(running).await;
		Ok(())
	}

	pub async fn addr(&self) -> Option<SocketAddr> {
		self.running.lock().await.as_ref().map(|r| r.addr)
	}
}

/// Runtime-startable standalone WebSocket endpoint.
pub struct WsEndpoint {
	registry: Arc<Registry>,
	limits: ServerLimits,
	running: AsyncMutex<Option<Running>>,
}

impl WsEndpoint {
	pub fn new(registry: Arc<Registry>, limits: ServerLimits) -> Self {
		WsEndpoint {
			registry,
			limits,
			running: AsyncMutex::new(None),
		}
	}

	pub async fn start(
		&self,
		config: WsConfig,
		apis: &[String],
	) -> Result<SocketAddr, EndpointError> {
		let mut running = self.running.lock().await;
		if let Some(running) = running.as_ref() {
			return Err(EndpointError::AlreadyRunning(running.addr));
		}

		let server = Server::new(self.registry.filtered(apis), self.limits.clone());
		let addr = listen_addr(&config.host, config.port)?;
		let routes = ws::route(server.clone(), Some(config)).recover(handle_rejection);

		let cancel = CancellationToken::new();
		let signal = cancel.clone();
		let (bound, serve) = warp::serve(routes)
			.try_bind_with_graceful_shutdown(addr, async move { signal.cancelled().await })
			.map_err(|e| EndpointError::Bind(e.to_string()))?;
		let handle = spawn_in_span(serve);
		info!(addr = %bound, "WebSocket endpoint ready");

		*running = Some(Running {
			addr: bound,
			server,
			cancel,
			handle,
		});
		Ok(bound)
	}

	pub async fn stop(&self) -> Result<(), EndpointError> {
		let mut running = self.running.lock().await;
		let running = running.take().ok_or(EndpointError::NotRunning)?;
		stop_running(running).await;
		Ok(())
	}

	pub async fn addr(&self) -> Option<SocketAddr> {
		self.running.lock().await.as_ref().map(|r| r.addr)
	}
}

/// One node's startable endpoints plus the registry they serve. Building
/// this registers the `admin` namespace.
pub struct NodeServices {
	pub registry: Arc<Registry>,
	pub http: HttpEndpoint,
	pub ws: WsEndpoint,
	http_defaults: HttpConfig,
	ws_defaults: WsConfig,
}

impl NodeServices {
	pub fn new(
		registry: Arc<Registry>,
		limits: ServerLimits,
		http_defaults: HttpConfig,
		ws_defaults: WsConfig,
	) -> Arc<Self> {
		let services = Arc::new(NodeServices {
			registry: registry.clone(),
			http: HttpEndpoint::new(registry.clone(), limits.clone()),
			ws: WsEndpoint::new(registry.clone(), limits),
			http_defaults,
			ws_defaults,
		});
		registry
			.register("admin", admin_module(Arc::downgrade(&services)))
			.expect("admin registration cannot fail");
		services
	}
}

fn optional_string(params: &[Value], index: usize, what: &str) -> Result<Option<String>, RpcError> {
	match params.get(index) {
		None | Some(Value::Null) => Ok(None),
		Some(Value::String(value)) => Ok(Some(value.clone())),
		Some(_) => Err(RpcError::InvalidParams(format!("{what} must be a string"))),
	}
}

fn optional_port(params: &[Value], index: usize) -> Result<Option<u16>, RpcError> {
	match params.get(index) {
		None | Some(Value::Null) => Ok(None),
		Some(Value::Number(value)) => value
			.as_u64()
			.and_then(|port| u16::try_from(port).ok())
			.map(Some)
			.ok_or_else(|| RpcError::InvalidParams("port out of range".to_string())),
		Some(_) => Err(RpcError::InvalidParams("port must be a number".to_string())),
	}
}

fn split_list(value: Option<String>) -> Vec<String> {
	value
		.map(|value| {
			value
				.split(',')
				.map(str::trim)
				.filter(|entry| !entry.is_empty())
				.map(str::to_string)
				.collect()
		})
		.unwrap_or_default()
}

fn upgraded(weak: &Weak<NodeServices>) -> Result<Arc<NodeServices>, RpcError> {
	weak.upgrade()
		.ok_or_else(|| RpcError::Internal("node services dropped".to_string()))
}

/// `admin_startHTTP(host?, port?, cors?, apis?, vhosts?)` and friends.
/// List-valued parameters are comma-separated strings.
fn admin_module(services: Weak<NodeServices>) -> Module {
	let start_http = services.clone();
	let stop_http = services.clone();
	let start_ws = services.clone();
	let stop_ws = services;

	Module::new()
		.method(
			"startHTTP",
			Arity::between(0, 5),
			move |_ctx: CallCtx, params: Vec<Value>| {
				let services = start_http.clone();
				async move {
					let services = upgraded(&services)?;
					let mut config = services.http_defaults.clone();
					if let Some(host) = optional_string(&params, 0, "host")? {
						config.host = host;
					}
					if let Some(port) = optional_port(&params, 1)? {
						config.port = port;
					}
					if let Some(cors) = optional_string(&params, 2, "cors")? {
						config.cors = split_list(Some(cors));
					}
					let apis = split_list(optional_string(&params, 3, "apis")?);
					if let Some(vhosts) = optional_string(&params, 4, "vhosts")? {
						config.vhosts = split_list(Some(vhosts));
					}
					services
						.http
						.start(config, None, &apis)
						.await
						.map_err(|e| RpcError::server(e.to_string()))?;
					Ok(Value::Bool(true))
				}
			},
		)
		.method("stopHTTP", Arity::exact(0), move |_ctx, _params| {
			let services = stop_http.clone();
			async move {
				let services = upgraded(&services)?;
				services
					.http
					.stop()
					.await
					.map_err(|e| RpcError::server(e.to_string()))?;
				Ok(Value::Bool(true))
			}
		})
		.method(
			"startWS",
			Arity::between(0, 4),
			move |_ctx: CallCtx, params: Vec<Value>| {
				let services = start_ws.clone();
				async move {
					let services = upgraded(&services)?;
					let mut config = services.ws_defaults.clone();
					if let Some(host) = optional_string(&params, 0, "host")? {
						config.host = host;
					}
					if let Some(port) = optional_port(&params, 1)? {
						config.port = port;
					}
					let apis = split_list(optional_string(&params, 2, "apis")?);
					if let Some(origins) = optional_string(&params, 3, "origins")? {
						config.origins = split_list(Some(origins));
					}
					services
						.ws
						.start(config, &apis)
						.await
						.map_err(|e| RpcError::server(e.to_string()))?;
					Ok(Value::Bool(true))
				}
			},
		)
		.method("stopWS", Arity::exact(0), move |_ctx, _params| {
			let services = stop_ws.clone();
			async move {
				let services = upgraded(&services)?;
				services
					.ws
					.stop()
					.await
					.map_err(|e| RpcError::server(e.to_string()))?;
				Ok(Value::Bool(true))
			}
		})
}
