//! JSON-RPC 2.0 wire messages.
//!
//! Parsing is element-wise: one malformed entry of a batch carries its own
//! fault marker and does not discard its siblings. Response and notification
//! builders stamp the `jsonrpc` member so every outgoing value is a complete
//! envelope.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{value::RawValue, Value};

use crate::error::RpcError;

/// Method suffix that opens a subscription.
pub const SUBSCRIBE_SUFFIX: &str = "_subscribe";
/// Method suffix that cancels a subscription.
pub const UNSUBSCRIBE_SUFFIX: &str = "_unsubscribe";
/// Method suffix used for outgoing subscription notifications.
pub const NOTIFICATION_SUFFIX: &str = "_subscription";
/// Separator between service namespace and method name.
pub const NAMESPACE_SEPARATOR: char = '_';

/// The `jsonrpc` member. Always `"2.0"`; anything else fails deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct V2;

impl Serialize for V2 {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str("2.0")
	}
}

impl<'de> Deserialize<'de> for V2 {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let version = <&str>::deserialize(deserializer)?;
		if version != "2.0" {
			return Err(de::Error::custom("unknown jsonrpc version"));
		}
		Ok(V2)
	}
}

/// One parsed incoming request.
///
/// `id` is `None` for client notifications, which are executed but never
/// answered. A pre-dispatch validation failure is carried in `fault` so the
/// dispatcher can answer it without looking the method up.
#[derive(Debug, Clone)]
pub struct RpcRequest {
	pub id: Option<Value>,
	pub method: String,
	pub params: Option<Value>,
	pub fault: Option<RpcError>,
}

/// Classified call shape, derived from the method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind<'a> {
	/// `<namespace>_subscribe`; the topic is the first parameter.
	Subscribe { namespace: &'a str },
	/// `<namespace>_unsubscribe`; the subscription id is the first parameter.
	Unsubscribe { namespace: &'a str },
	/// `<namespace>_<method>`.
	Method { namespace: &'a str, method: &'a str },
	/// No namespace separator in the name.
	Bare,
}

impl RpcRequest {
	fn faulty(id: Option<Value>, fault: RpcError) -> Self {
		RpcRequest {
			id: Some(id.unwrap_or(Value::Null)),
			method: String::new(),
			params: None,
			fault: Some(fault),
		}
	}

	/// The id to key an error response with: the request id, or `null`.
	pub fn error_id(&self) -> Value {
		self.id.clone().unwrap_or(Value::Null)
	}

	pub fn is_notification(&self) -> bool {
		self.id.is_none() && self.fault.is_none()
	}

	pub fn kind(&self) -> CallKind<'_> {
		if let Some(namespace) = self.method.strip_suffix(SUBSCRIBE_SUFFIX) {
			if !namespace.is_empty() {
				return CallKind::Subscribe { namespace };
			}
		}
		if let Some(namespace) = self.method.strip_suffix(UNSUBSCRIBE_SUFFIX) {
			if !namespace.is_empty() {
				return CallKind::Unsubscribe { namespace };
			}
		}
		match self.method.split_once(NAMESPACE_SEPARATOR) {
			Some((namespace, method)) if !namespace.is_empty() && !method.is_empty() => {
				CallKind::Method { namespace, method }
			},
			_ => CallKind::Bare,
		}
	}

	/// Positional parameter list. Absent params mean an empty list.
	pub fn params_list(&self) -> Result<Vec<Value>, RpcError> {
		match &self.params {
			None | Some(Value::Null) => Ok(vec![]),
			Some(Value::Array(values)) => Ok(values.clone()),
			Some(_) => Err(RpcError::InvalidParams(
				"parameters must be an array".to_string(),
			)),
		}
	}
}

#[derive(Deserialize)]
struct Envelope<'a> {
	#[serde(borrow)]
	jsonrpc: Option<&'a str>,
	#[serde(borrow)]
	id: Option<&'a RawValue>,
	method: Option<String>,
	params: Option<Value>,
}

/// Parses one wire message into its requests.
///
/// Returns the ordered request list and whether the message was a batch.
/// Top-level failures (malformed JSON, an empty batch) abort the whole
/// message and are answered with a single error keyed to a `null` id.
pub fn parse_message(raw: &str) -> Result<(Vec<RpcRequest>, bool), RpcError> {
	let value: Value =
		serde_json::from_str(raw).map_err(|e| RpcError::Parse(format!("invalid JSON: {e}")))?;

	match value {
		Value::Array(elements) => {
			if elements.is_empty() {
				return Err(RpcError::InvalidRequest("empty batch".to_string()));
			}
			let requests = elements.into_iter().map(parse_element).collect();
			Ok((requests, true))
		},
		element => Ok((vec![parse_element(element)], false)),
	}
}

fn parse_element(element: Value) -> RpcRequest {
	if !element.is_object() {
		return RpcRequest::faulty(
			None,
			RpcError::InvalidRequest("request is not an object".to_string()),
		);
	}
	// Round-trip through the borrowing envelope keeps id validation strict
	// without cloning the raw id text.
	let raw = element.to_string();
	let envelope: Envelope = match serde_json::from_str(&raw) {
		Ok(envelope) => envelope,
		Err(e) => {
			return RpcRequest::faulty(
				None,
				RpcError::InvalidRequest(format!("invalid request object: {e}")),
			)
		},
	};

	if let Some(version) = envelope.jsonrpc {
		if version != "2.0" {
			return RpcRequest::faulty(
				None,
				RpcError::InvalidRequest(format!("unknown jsonrpc version {version:?}")),
			);
		}
	}

	let id = match envelope.id {
		None => None,
		Some(raw_id) => match serde_json::from_str::<Value>(raw_id.get()) {
			Ok(id @ (Value::Null | Value::String(_) | Value::Number(_))) => Some(id),
			_ => {
				return RpcRequest::faulty(
					None,
					RpcError::InvalidRequest(
						"request id must be a string, a number or null".to_string(),
					),
				)
			},
		},
	};

	let Some(method) = envelope.method else {
		return RpcRequest::faulty(id, RpcError::InvalidRequest("no method specified".to_string()));
	};

	RpcRequest {
		id,
		method,
		params: envelope.params,
		fault: None,
	}
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
	pub code: i64,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

impl From<&RpcError> for ErrorObject {
	fn from(err: &RpcError) -> Self {
		ErrorObject {
			code: err.code(),
			message: err.to_string(),
			data: err.data().cloned(),
		}
	}
}

/// One outgoing response, carrying exactly one of `result` and `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub jsonrpc: V2,
	pub id: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorObject>,
}

impl Response {
	pub fn success(id: Value, result: Value) -> Self {
		Response {
			jsonrpc: V2,
			id,
			result: Some(result),
			error: None,
		}
	}

	pub fn failure(id: Value, err: &RpcError) -> Self {
		Response {
			jsonrpc: V2,
			id,
			result: None,
			error: Some(ErrorObject::from(err)),
		}
	}

	pub fn is_error(&self) -> bool {
		self.error.is_some()
	}
}

#[derive(Debug, Clone, Serialize)]
struct NotificationParams<'a> {
	subscription: &'a str,
	result: &'a Value,
}

/// Serializes a subscription notification frame:
/// `{"jsonrpc":"2.0","method":"<namespace>_subscription","params":{...}}`.
pub fn notification(namespace: &str, subscription_id: &str, result: &Value) -> String {
	#[derive(Serialize)]
	struct Notification<'a> {
		jsonrpc: V2,
		method: String,
		params: NotificationParams<'a>,
	}

	serde_json::to_string(&Notification {
		jsonrpc: V2,
		method: format!("{namespace}{NOTIFICATION_SUFFIX}"),
		params: NotificationParams {
			subscription: subscription_id,
			result,
		},
	})
	.expect("notification serialization cannot fail")
}

/// Serializes a response, or a whole batch as one JSON array.
pub fn serialize_responses(responses: &[Response], is_batch: bool) -> String {
	if is_batch {
		serde_json::to_string(responses).expect("response serialization cannot fail")
	} else {
		serde_json::to_string(&responses[0]).expect("response serialization cannot fail")
	}
}

/// Extracts the first method name of a message body, for request labeling.
/// Batches are labeled `<method>_batch` after their first element.
pub fn first_method_name(body: &str) -> Option<String> {
	#[derive(Deserialize)]
	struct Probe {
		method: Option<String>,
	}

	let value: Value = serde_json::from_str(body).ok()?;
	match value {
		Value::Object(_) => serde_json::from_value::<Probe>(value).ok()?.method,
		Value::Array(elements) => {
			let first = elements.into_iter().next()?;
			let probe: Probe = serde_json::from_value(first).ok()?;
			let method = probe.method?;
			Some(format!("{method}_batch"))
		},
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test]
	fn single_request_parses() {
		let (requests, is_batch) = parse_message(
			r#"{"jsonrpc":"2.0","id":1,"method":"test_echo","params":["hello",42]}"#,
		)
		.unwrap();
		assert!(!is_batch);
		assert_eq!(requests.len(), 1);
		let request = &requests[0];
		assert!(request.fault.is_none());
		assert_eq!(request.id, Some(Value::from(1)));
		assert_eq!(request.method, "test_echo");
		assert_eq!(request.params_list().unwrap().len(), 2);
	}

	#[test]
	fn malformed_json_is_a_parse_error() {
		let err = parse_message("{this is not json").unwrap_err();
		assert_eq!(err.code(), crate::error::PARSE_ERROR);
	}

	#[test]
	fn empty_batch_is_invalid_request() {
		let err = parse_message("[]").unwrap_err();
		assert_eq!(err.code(), crate::error::INVALID_REQUEST);
	}

	#[test_case(r#"{"jsonrpc":"2.0","id":1,"method":"a_b"}"# => true; "number id")]
	#[test_case(r#"{"jsonrpc":"2.0","id":"x","method":"a_b"}"# => true; "string id")]
	#[test_case(r#"{"jsonrpc":"2.0","id":null,"method":"a_b"}"# => true; "null id")]
	#[test_case(r#"{"jsonrpc":"2.0","id":{},"method":"a_b"}"# => false; "object id")]
	#[test_case(r#"{"jsonrpc":"2.0","id":[1],"method":"a_b"}"# => false; "array id")]
	#[test_case(r#"{"jsonrpc":"2.0","id":true,"method":"a_b"}"# => false; "bool id")]
	fn id_must_be_string_number_or_null(raw: &str) -> bool {
		let (requests, _) = parse_message(raw).unwrap();
		requests[0].fault.is_none()
	}

	#[test]
	fn wrong_version_is_rejected() {
		let (requests, _) =
			parse_message(r#"{"jsonrpc":"1.0","id":1,"method":"a_b"}"#).unwrap();
		assert!(requests[0].fault.is_some());
	}

	#[test]
	fn absent_version_is_accepted() {
		let (requests, _) = parse_message(r#"{"id":10,"method":"test_subscribe"}"#).unwrap();
		assert!(requests[0].fault.is_none());
	}

	#[test]
	fn absent_id_is_a_notification() {
		let (requests, _) =
			parse_message(r#"{"jsonrpc":"2.0","method":"test_ping"}"#).unwrap();
		assert!(requests[0].is_notification());
	}

	#[test]
	fn bad_batch_element_does_not_poison_siblings() {
		let (requests, is_batch) = parse_message(
			r#"[{"jsonrpc":"2.0","id":1,"method":"rpc_modules"},42,{"jsonrpc":"2.0","id":3,"method":"a_b"}]"#,
		)
		.unwrap();
		assert!(is_batch);
		assert_eq!(requests.len(), 3);
		assert!(requests[0].fault.is_none());
		assert!(requests[1].fault.is_some());
		assert!(requests[2].fault.is_none());
	}

	fn kind_of(method: &str) -> String {
		let request = RpcRequest {
			id: Some(Value::from(1)),
			method: method.to_string(),
			params: None,
			fault: None,
		};
		format!("{:?}", request.kind())
	}

	#[test]
	fn method_names_classify() {
		assert_eq!(kind_of("eth_subscribe"), r#"Subscribe { namespace: "eth" }"#);
		assert_eq!(
			kind_of("eth_unsubscribe"),
			r#"Unsubscribe { namespace: "eth" }"#
		);
		assert_eq!(
			kind_of("test_echo"),
			r#"Method { namespace: "test", method: "echo" }"#
		);
		assert_eq!(kind_of("bogus"), "Bare");
		assert_eq!(kind_of("subscribe"), "Bare");
	}

	#[test]
	fn success_response_shape_is_stable() {
		let response = Response::success(Value::from(1), serde_json::json!({"x": 1}));
		assert_eq!(
			serde_json::to_string(&response).unwrap(),
			r#"{"jsonrpc":"2.0","id":1,"result":{"x":1}}"#
		);
	}

	#[test]
	fn error_response_shape_is_stable() {
		let response = Response::failure(
			Value::from(2),
			&RpcError::MethodNotFound("test_nope".to_string()),
		);
		assert_eq!(
			serde_json::to_string(&response).unwrap(),
			r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"the method test_nope does not exist/is not available"}}"#
		);
	}

	#[test]
	fn notification_shape_is_stable() {
		let frame = notification("test", "0xdead", &Value::from(7));
		assert_eq!(
			frame,
			r#"{"jsonrpc":"2.0","method":"test_subscription","params":{"subscription":"0xdead","result":7}}"#
		);
	}

	#[test]
	fn first_method_name_labels_batches() {
		assert_eq!(
			first_method_name(r#"{"jsonrpc":"2.0","id":1,"method":"test_echo"}"#).as_deref(),
			Some("test_echo")
		);
		assert_eq!(
			first_method_name(r#"[{"jsonrpc":"2.0","id":1,"method":"test_echo"}]"#).as_deref(),
			Some("test_echo_batch")
		);
		assert_eq!(first_method_name("not json"), None);
	}
}
