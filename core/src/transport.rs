//! Transport adapters.
//!
//! Every transport turns its native connection into a codec and hands it to
//! the dispatcher; nothing below this module knows which wire the bytes
//! travelled.

use hyper::StatusCode;
use serde_json::Value;
use warp::{Rejection, Reply};

use crate::{
	error::RpcError,
	message::{self, Response},
};

pub mod grpc;
pub mod http;
#[cfg(unix)]
pub mod ipc;
pub mod ws;

/// Typed rejections raised by the HTTP/WebSocket filter chains.
#[derive(Debug)]
pub enum ApiReject {
	/// `Host` header not in the virtual-host allow-list.
	ForbiddenHost,
	/// Missing or non-JSON `Content-Type`.
	UnsupportedContentType,
	/// WebSocket origin not allowed.
	ForbiddenOrigin,
	/// WebSocket connection cap reached.
	TooManyConnections,
}

impl warp::reject::Reject for ApiReject {}

/// Maps typed rejections onto status codes with JSON-RPC error bodies, so
/// a client always gets a parseable answer.
pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Rejection> {
	let (status, err) = if let Some(reject) = rejection.find::<ApiReject>() {
		match reject {
			ApiReject::ForbiddenHost => (
				StatusCode::FORBIDDEN,
				RpcError::InvalidRequest("invalid host specified".to_string()),
			),
			ApiReject::UnsupportedContentType => (
				StatusCode::UNSUPPORTED_MEDIA_TYPE,
				RpcError::InvalidRequest("unsupported content type".to_string()),
			),
			ApiReject::ForbiddenOrigin => (
				StatusCode::FORBIDDEN,
				RpcError::InvalidRequest("origin not allowed".to_string()),
			),
			ApiReject::TooManyConnections => (
				StatusCode::TOO_MANY_REQUESTS,
				RpcError::server("too many connections"),
			),
		}
	} else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
		(
			StatusCode::PAYLOAD_TOO_LARGE,
			RpcError::Parse("request body exceeds the configured limit".to_string()),
		)
	} else {
		return Err(rejection);
	};

	let body = message::serialize_responses(&[Response::failure(Value::Null, &err)], false);
	Ok(warp::reply::with_status(
		warp::reply::with_header(body, "content-type", "application/json"),
		status,
	))
}
