use color_eyre::{eyre::WrapErr, Result};
use lattice_rpc_core::{
	telemetry::otlp::OtelConfig,
	types::{GrpcConfig, HttpConfig, IpcConfig, ServerLimits, WsConfig},
};
use serde::{Deserialize, Serialize};

use crate::cli::CliOpts;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
	pub http: HttpConfig,
	pub ws: WsConfig,
	pub ipc: IpcConfig,
	pub grpc: GrpcConfig,
	pub limits: ServerLimits,
	pub otel: OtelConfig,
}

/// Loads the config file when given, then applies CLI overrides on top.
pub fn load(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut config: RuntimeConfig = match &opts.config {
		Some(path) => confy::load_path(path)
			.wrap_err_with(|| format!("Unable to load config from {}", path.display()))?,
		None => RuntimeConfig::default(),
	};

	if let Some(port) = opts.http_port {
		config.http.port = port;
	}
	if let Some(port) = opts.ws_port {
		config.ws.port = port;
	}
	if let Some(port) = opts.grpc_port {
		config.grpc.port = port;
	}
	if let Some(path) = &opts.ipc_path {
		config.ipc.path = path.clone();
	}
	Ok(config)
}
