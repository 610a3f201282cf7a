//! HTTP transport: one request body is one codec's entire input.
//!
//! `POST /` carries a single JSON-RPC message (possibly a batch) and is
//! served with `serve_single_request`, subscriptions off. The handler chain
//! enforces content type, virtual-host allow-listing, the body size limit
//! and CORS, and wraps every request in a tracing span that re-parses the
//! buffered response to tag failures.

use std::{convert::Infallible, net::IpAddr, sync::Arc};

use hyper::body::Bytes;
use tracing::{error, field, info_span, Instrument, Span};
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::{
	codec::BufferedCodec,
	error::RpcError,
	message::{self, Response},
	server::{ServeOptions, Server},
	transport::{handle_rejection, ApiReject},
	types::{HttpConfig, WsConfig},
};

pub(crate) fn with_server(
	server: Arc<Server>,
) -> impl Filter<Extract = (Arc<Server>,), Error = Infallible> + Clone {
	warp::any().map(move || server.clone())
}

/// The full HTTP route set: health probe, the RPC endpoint, and the
/// WebSocket upgrade when the endpoint is configured to share the port.
pub fn routes(
	server: Arc<Server>,
	config: HttpConfig,
	ws: Option<WsConfig>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	let cors = cors_config(&config);
	health_route()
		.or(rpc_route(server.clone(), config))
		.or(super::ws::route(server, ws))
		.recover(handle_rejection)
		.with(cors)
}

fn health_route() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::head()
		.or(warp::get())
		.and(warp::path("health"))
		.map(|_| warp::reply::with_status("", StatusCode::OK))
}

pub(crate) fn rpc_route(
	server: Arc<Server>,
	config: HttpConfig,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	let limit = server.limits().max_request_len as u64;
	let handler_config = config.clone();
	warp::path::end()
		.and(warp::post())
		.and(vhost_filter(config.vhosts))
		.and(content_type_filter())
		.and(warp::body::content_length_limit(limit))
		.and(warp::body::bytes())
		.and(warp::header::headers_cloned())
		.and(with_server(server))
		.and(warp::any().map(move || handler_config.clone()))
		.and_then(handle_rpc)
}

fn cors_config(config: &HttpConfig) -> warp::cors::Builder {
	let mut cors = warp::cors()
		.allow_header("content-type")
		.allow_methods(vec!["GET", "POST", "OPTIONS"]);
	if config.cors.iter().any(|origin| origin == "*") {
		cors = cors.allow_any_origin();
	} else {
		for origin in &config.cors {
			cors = cors.allow_origin(origin.as_str());
		}
	}
	cors
}

fn vhost_filter(vhosts: Vec<String>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
	warp::header::optional::<String>("host")
		.and_then(move |host: Option<String>| {
			let vhosts = vhosts.clone();
			async move {
				if host_allowed(host.as_deref(), &vhosts) {
					Ok(())
				} else {
					Err(warp::reject::custom(ApiReject::ForbiddenHost))
				}
			}
		})
		.untuple_one()
}

fn content_type_filter() -> impl Filter<Extract = (), Error = Rejection> + Clone {
	warp::header::optional::<String>("content-type")
		.and_then(|content_type: Option<String>| async move {
			let is_json = content_type
				.as_deref()
				.map(|value| value.to_ascii_lowercase().starts_with("application/json"))
				.unwrap_or(false);
			if is_json {
				Ok(())
			} else {
				Err(warp::reject::custom(ApiReject::UnsupportedContentType))
			}
		})
		.untuple_one()
}

/// Virtual-host policy: `*` disables the check, absent headers and IP
/// literals are always accepted, names match case-insensitively.
fn host_allowed(host: Option<&str>, vhosts: &[String]) -> bool {
	if vhosts.iter().any(|vhost| vhost == "*") {
		return true;
	}
	let Some(host) = host else { return true };
	let name = if let Some(rest) = host.strip_prefix('[') {
		rest.split(']').next().unwrap_or("")
	} else {
		host.split(':').next().unwrap_or("")
	};
	if name.parse::<IpAddr>().is_ok() {
		return true;
	}
	vhosts.iter().any(|vhost| vhost.eq_ignore_ascii_case(name))
}

async fn handle_rpc(
	body: Bytes,
	headers: warp::http::HeaderMap,
	server: Arc<Server>,
	config: HttpConfig,
) -> Result<warp::reply::Response, Rejection> {
	let Ok(body) = String::from_utf8(body.to_vec()) else {
		let err = RpcError::Parse("request body is not valid UTF-8".to_string());
		return Ok(json_error_reply(&err));
	};

	let method = message::first_method_name(&body).unwrap_or_else(|| "unknown".to_string());
	let captured_headers = capture_headers(&headers, &config.tracing_headers);
	let span = info_span!(
		"rpc_request",
		resource = %format!("POST / {method}"),
		rpc.method = %method,
		http.headers = %captured_headers,
		rpc.error_code = field::Empty,
		rpc.error_message = field::Empty,
	);

	let reply = async {
		let codec = Arc::new(BufferedCodec::new(body, "http"));
		let served = tokio::time::timeout(
			config.write_timeout(),
			server.serve_single_request(codec.clone(), ServeOptions::single_shot()),
		)
		.await;
		if served.is_err() {
			error!(rpc.method = %method, "rpc request timed out");
			return json_error_reply(&RpcError::server("request timed out"));
		}

		let output = codec.take_output().unwrap_or_default();
		record_outcome(&output);
		json_reply(output)
	}
	.instrument(span)
	.await;

	Ok(reply)
}

fn capture_headers(headers: &warp::http::HeaderMap, names: &[String]) -> String {
	names
		.iter()
		.filter_map(|name| {
			headers
				.get(name.as_str())
				.and_then(|value| value.to_str().ok())
				.map(|value| format!("{name}={value}"))
		})
		.collect::<Vec<_>>()
		.join(",")
}

/// Re-parses the buffered response body; error responses are tagged on the
/// request span and logged, batch elements individually under child spans.
fn record_outcome(output: &str) {
	if output.is_empty() {
		return;
	}
	if let Ok(response) = serde_json::from_str::<Response>(output) {
		if let Some(error_object) = &response.error {
			let span = Span::current();
			span.record("rpc.error_code", error_object.code);
			span.record("rpc.error_message", error_object.message.as_str());
			error!(
				code = error_object.code,
				message = %error_object.message,
				"rpc request failed"
			);
		}
		return;
	}
	if let Ok(batch) = serde_json::from_str::<Vec<Response>>(output) {
		for (index, response) in batch.iter().enumerate() {
			if let Some(error_object) = &response.error {
				let child = info_span!("rpc_batch_element", index);
				child.in_scope(|| {
					error!(
						code = error_object.code,
						message = %error_object.message,
						"rpc batch element failed"
					);
				});
			}
		}
	}
}

fn json_reply(output: String) -> warp::reply::Response {
	warp::http::Response::builder()
		.status(StatusCode::OK)
		.header("content-type", "application/json")
		.body(hyper::Body::from(output))
		.expect("static response construction cannot fail")
}

fn json_error_reply(err: &RpcError) -> warp::reply::Response {
	let body = message::serialize_responses(
		&[Response::failure(serde_json::Value::Null, err)],
		false,
	);
	json_reply(body)
}
