use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, about = "Lattice multi-transport JSON-RPC node")]
pub struct CliOpts {
	/// Path to the configuration file
	#[arg(long)]
	pub config: Option<PathBuf>,
	/// HTTP listen port override
	#[arg(long)]
	pub http_port: Option<u16>,
	/// WebSocket listen port override
	#[arg(long)]
	pub ws_port: Option<u16>,
	/// gRPC listen port override
	#[arg(long)]
	pub grpc_port: Option<u16>,
	/// IPC socket path override
	#[arg(long)]
	pub ipc_path: Option<PathBuf>,
	/// Log level (error, warn, info, debug, trace)
	#[arg(long, default_value = "info")]
	pub verbosity: String,
	/// Emit logs as JSON
	#[arg(long)]
	pub logs_json: bool,
	/// Disable metrics export
	#[arg(long)]
	pub no_telemetry: bool,
}
