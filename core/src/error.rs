//! Error taxonomy shared by the dispatcher, codecs and transports.

use serde_json::Value;
use thiserror::Error;

/// JSON-RPC error codes, following the official numbering.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;

/// Error that is reported back to the JSON-RPC client.
///
/// Every variant maps onto one numeric code; `Application` carries the code
/// chosen by the callable.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
	#[error("{0}")]
	Parse(String),
	#[error("{0}")]
	InvalidRequest(String),
	#[error("the method {0} does not exist/is not available")]
	MethodNotFound(String),
	#[error("no {topic:?} subscription in {namespace} namespace")]
	SubscriptionNotFound { namespace: String, topic: String },
	#[error("{0}")]
	InvalidParams(String),
	#[error("{0}")]
	Internal(String),
	#[error("server is shutting down")]
	Shutdown,
	/// Error produced by a callable. Code defaults to [`SERVER_ERROR`].
	#[error("{message}")]
	Application {
		code: i64,
		message: String,
		data: Option<Value>,
	},
}

impl RpcError {
	pub fn code(&self) -> i64 {
		match self {
			RpcError::Parse(_) => PARSE_ERROR,
			RpcError::InvalidRequest(_) => INVALID_REQUEST,
			RpcError::MethodNotFound(_) => METHOD_NOT_FOUND,
			RpcError::SubscriptionNotFound { .. } => METHOD_NOT_FOUND,
			RpcError::InvalidParams(_) => INVALID_PARAMS,
			RpcError::Internal(_) | RpcError::Shutdown => INTERNAL_ERROR,
			RpcError::Application { code, .. } => *code,
		}
	}

	pub fn data(&self) -> Option<&Value> {
		match self {
			RpcError::Application { data, .. } => data.as_ref(),
			_ => None,
		}
	}

	/// Callable-level error with the default server error code.
	pub fn server(message: impl Into<String>) -> Self {
		RpcError::Application {
			code: SERVER_ERROR,
			message: message.into(),
			data: None,
		}
	}
}

/// Failure of the framing layer below the dispatcher.
#[derive(Debug, Error)]
pub enum CodecError {
	/// The peer or the local side tore the connection down.
	#[error("connection closed")]
	Closed,
	/// A single frame exceeded the configured request size limit.
	#[error("request exceeds the configured limit of {limit} bytes")]
	Oversized { limit: usize },
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
}

/// Registration-time failures. These are programmer errors and surface
/// before any transport is bound.
#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("service name cannot be empty")]
	EmptyName,
	#[error("service {0:?} exports no callables")]
	NoCallables(String),
}
