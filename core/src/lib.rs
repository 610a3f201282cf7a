//! Multi-transport JSON-RPC 2.0 server framework.
//!
//! One dispatcher core serves four transports — IPC, HTTP, WebSocket and
//! gRPC — through per-connection codecs. Services are descriptor tables
//! registered under a namespace; multi-shot transports additionally carry
//! publish/subscribe subscriptions with buffered activation.
//!
//! ```text
//! bytes ── codec ── [request…] ── dispatcher ── registry ── callable ──┐
//!                                                                       │
//! peer ◄── codec ◄── [response/notification…] ◄── notifier ◄────────────┘
//! ```
//!
//! A service is a [`registry::Module`]; plug it into a [`registry::Registry`],
//! hand that to a [`server::Server`] and bind the transports you need:
//!
//! ```no_run
//! use std::sync::Arc;
//! use lattice_rpc_core::{
//! 	registry::{Arity, Module, Registry},
//! 	server::Server,
//! 	transport::ipc::IpcEndpoint,
//! 	types::IpcConfig,
//! };
//!
//! # fn main() -> std::io::Result<()> {
//! let registry = Registry::new();
//! registry
//! 	.register(
//! 		"chain",
//! 		Module::new().method("head", Arity::exact(0), |_ctx, _params| async {
//! 			Ok(serde_json::json!(42))
//! 		}),
//! 	)
//! 	.expect("chain service registers");
//!
//! let server = Server::new(registry, Default::default());
//! # #[cfg(unix)]
//! let _ipc = IpcEndpoint::bind(server, IpcConfig::default())?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod notifier;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod utils;

pub use error::{CodecError, RegistryError, RpcError};
pub use registry::MODULE_VERSION;
pub use server::{ServeOptions, Server};
