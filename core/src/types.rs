//! Configuration types shared by the server and its transports.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Hard cap on one request body / frame, in bytes.
pub const MAX_REQUEST_CONTENT_LENGTH: usize = 5 * 1024 * 1024;
/// Requests allowed in flight per server before admission kicks in.
pub const PENDING_REQUEST_LIMIT: usize = 200_000;
/// Subscriptions allowed per multi-shot connection.
pub const MAX_SUBSCRIPTIONS_PER_CONN: usize = 3_000;
/// Concurrently open WebSocket connections per endpoint.
pub const MAX_WEBSOCKET_CONNECTIONS: usize = 3_000;
/// Events buffered per subscription before backpressure / dropping.
pub const SUBSCRIPTION_BUFFER: usize = 100;

/// Admission-control knobs. Fixed at startup; admin operations thread the
/// same limits into endpoints they start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerLimits {
	pub max_request_len: usize,
	pub pending_request_limit: usize,
	pub max_subscriptions_per_conn: usize,
	pub max_ws_connections: usize,
	pub subscription_buffer: usize,
}

impl Default for ServerLimits {
	fn default() -> Self {
		ServerLimits {
			max_request_len: MAX_REQUEST_CONTENT_LENGTH,
			pending_request_limit: PENDING_REQUEST_LIMIT,
			max_subscriptions_per_conn: MAX_SUBSCRIPTIONS_PER_CONN,
			max_ws_connections: MAX_WEBSOCKET_CONNECTIONS,
			subscription_buffer: SUBSCRIPTION_BUFFER,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
	pub host: String,
	pub port: u16,
	/// CORS allow-list; empty disables cross-origin access, `*` allows any.
	pub cors: Vec<String>,
	/// Virtual hostnames accepted in the `Host` header; `*` disables the check.
	pub vhosts: Vec<String>,
	pub read_timeout_secs: u64,
	pub write_timeout_secs: u64,
	/// Request headers recorded on the request span.
	pub tracing_headers: Vec<String>,
}

impl Default for HttpConfig {
	fn default() -> Self {
		HttpConfig {
			host: "127.0.0.1".to_string(),
			port: 8545,
			cors: vec![],
			vhosts: vec!["localhost".to_string()],
			read_timeout_secs: 30,
			write_timeout_secs: 30,
			tracing_headers: vec![],
		}
	}
}

impl HttpConfig {
	pub fn read_timeout(&self) -> Duration {
		Duration::from_secs(self.read_timeout_secs)
	}

	pub fn write_timeout(&self) -> Duration {
		Duration::from_secs(self.write_timeout_secs)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
	pub host: String,
	pub port: u16,
	/// Origin allow-list; `*` accepts any, empty defaults to localhost and
	/// the host's own name.
	pub origins: Vec<String>,
	/// Seconds a connection may stay silent before it is closed; 0 disables.
	pub read_deadline_secs: u64,
}

impl Default for WsConfig {
	fn default() -> Self {
		WsConfig {
			host: "127.0.0.1".to_string(),
			port: 8546,
			origins: vec![],
			read_deadline_secs: 0,
		}
	}
}

impl WsConfig {
	pub fn read_deadline(&self) -> Option<Duration> {
		(self.read_deadline_secs > 0).then(|| Duration::from_secs(self.read_deadline_secs))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
	pub path: PathBuf,
}

impl Default for IpcConfig {
	fn default() -> Self {
		IpcConfig {
			path: PathBuf::from("/tmp/lattice-rpc.ipc"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
	pub host: String,
	pub port: u16,
}

impl Default for GrpcConfig {
	fn default() -> Self {
		GrpcConfig {
			host: "127.0.0.1".to_string(),
			port: 8547,
		}
	}
}
