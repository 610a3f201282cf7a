//! Demo node wiring every transport of the RPC framework: a synthetic
//! `chain` service with a `newHeads` subscription, the `system` namespace,
//! and the `admin` endpoint controls, served over IPC, HTTP, WebSocket and
//! gRPC under one shutdown controller.

use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use lattice_rpc_core::{
	endpoint::NodeServices,
	registry::{Arity, Module, Registry},
	server::Server,
	shutdown::{self, Controller},
	telemetry::otlp,
	transport::grpc::GrpcEndpoint,
	utils::{default_subscriber, json_subscriber, spawn_in_span},
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn, Level};

use crate::cli::CliOpts;

mod cli;
mod config;

const HEAD_INTERVAL_SECS: u64 = 2;

fn system_module(version: &'static str) -> Module {
	Module::new()
		.method("version", Arity::exact(0), move |_ctx, _params| async move {
			Ok(Value::String(version.to_string()))
		})
		.method("health", Arity::exact(0), |_ctx, _params| async {
			Ok(json!({"healthy": true}))
		})
}

/// Synthetic chain: the head number advances on a timer and fans out to
/// `chain_newHeads` subscribers.
fn chain_module(shutdown: Controller<String>) -> Module {
	let head = Arc::new(AtomicU64::new(0));
	let (head_tx, _) = broadcast::channel(16);

	let ticker_head = head.clone();
	let ticker_tx = head_tx.clone();
	spawn_in_span(shutdown.with_cancel(async move {
		let mut interval =
			tokio::time::interval(std::time::Duration::from_secs(HEAD_INTERVAL_SECS));
		loop {
			interval.tick().await;
			let number = ticker_head.fetch_add(1, Ordering::AcqRel) + 1;
			let _ = ticker_tx.send(json!({ "number": number }));
		}
	}));

	Module::new()
		.method("blockNumber", Arity::exact(0), move |_ctx, _params| {
			let head = head.clone();
			async move { Ok(json!(head.load(Ordering::Acquire))) }
		})
		.subscription("newHeads", Arity::exact(0), move |sink, _params| {
			let mut events = head_tx.subscribe();
			async move {
				spawn_in_span(async move {
					loop {
						tokio::select! {
							_ = sink.closed() => break,
							event = events.recv() => match event {
								Ok(payload) => {
									if sink.send(payload).await.is_err() {
										break;
									}
								},
								Err(broadcast::error::RecvError::Lagged(_)) => continue,
								Err(broadcast::error::RecvError::Closed) => break,
							},
						}
					}
				});
				Ok(())
			}
		})
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	let opts = CliOpts::parse();
	let config = config::load(&opts)?;

	let level: Level = opts
		.verbosity
		.parse()
		.wrap_err("Invalid verbosity level")?;
	if opts.logs_json {
		tracing::subscriber::set_global_default(json_subscriber(level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(level))?;
	}

	let version = clap::crate_version!();
	info!(version, "Starting lattice node");

	let shutdown: Controller<String> = Controller::new();

	let registry = Registry::new();
	registry
		.register("system", system_module(version))
		.wrap_err("Unable to register system service")?;
	registry
		.register("chain", chain_module(shutdown.clone()))
		.wrap_err("Unable to register chain service")?;

	let services = NodeServices::new(
		registry.clone(),
		config.limits.clone(),
		config.http.clone(),
		config.ws.clone(),
	);

	// IPC and gRPC bind at process start; HTTP and WebSocket go through
	// the runtime-startable endpoints that admin_* also drives.
	let server = Server::new(registry.clone(), config.limits.clone());

	#[cfg(unix)]
	let ipc = lattice_rpc_core::transport::ipc::IpcEndpoint::bind(
		server.clone(),
		config.ipc.clone(),
	)
	.wrap_err("Unable to bind IPC endpoint")?;

	let grpc = GrpcEndpoint::bind(server.clone(), config.grpc.clone())
		.await
		.wrap_err("Unable to bind gRPC endpoint")?;

	services
		.http
		.start(config.http.clone(), None, &[])
		.await
		.wrap_err("Unable to start HTTP endpoint")?;
	services
		.ws
		.start(config.ws.clone(), &[])
		.await
		.wrap_err("Unable to start WebSocket endpoint")?;

	if !opts.no_telemetry {
		let attributes = vec![("version", version.to_string()), ("role", "node".to_string())];
		let exporter = otlp::initialize(attributes, config.otel.clone())
			.wrap_err("Unable to initialize OpenTelemetry service")?;
		spawn_in_span(exporter.run(server.metrics(), server.cancel_token()));
	}

	let signal_shutdown = shutdown.clone();
	spawn_in_span(async move {
		shutdown::user_signal().await;
		let _ = signal_shutdown.trigger_shutdown("user signal received".to_string());
	});

	let reason = shutdown.triggered_shutdown().await;
	info!(%reason, "Shutting down");

	if let Err(error) = services.http.stop().await {
		warn!(%error, "HTTP endpoint was not running");
	}
	if let Err(error) = services.ws.stop().await {
		warn!(%error, "WebSocket endpoint was not running");
	}
	// stopping the server first closes long-lived IPC and gRPC codecs, so
	// the listeners below can drain instead of waiting on live streams
	server.stop().await;
	grpc.stop().await;
	#[cfg(unix)]
	ipc.stop().await;

	info!("Shutdown complete");
	Ok(())
}
