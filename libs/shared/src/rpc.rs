//! NDJSON JSON-RPC 2.0 envelope types used on the line-oriented transport
//! between this process and an agent subprocess (see the AgentSession line
//! protocol).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A single line read off the subprocess's stdout: either a response to a
/// request this side issued, or a server-initiated request/notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IncomingLine {
    /// Server-initiated call or notification: a `method` with an optional
    /// `id` (requests carry one, e.g. `requestPermission`; notifications,
    /// e.g. `sessionUpdate`, don't). Tried first: `method` is mandatory
    /// here, so a plain response (no `method`) never matches this arm,
    /// whereas `Response` below only requires `id` and would otherwise
    /// swallow a `requestPermission` call (which also has an `id`) before
    /// this variant ever got a chance.
    Call {
        #[serde(default)]
        jsonrpc: Option<String>,
        method: String,
        #[serde(default)]
        id: Option<RequestId>,
        #[serde(default)]
        params: Option<Value>,
    },
    Response {
        #[serde(default)]
        jsonrpc: Option<String>,
        id: RequestId,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RpcError>,
    },
}

impl IncomingLine {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_omitted_params_when_none() {
        let req = RpcRequest::new(RequestId::Number(1), "initialize", None);
        let json = serde_json::to_string(&req)
            .unwrap_or_else(|error| panic!("serializable: {error}"));
        assert!(!json.contains("params"));
    }

    #[test]
    fn incoming_response_line_parses_as_response_variant() {
        let line = r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#;
        match IncomingLine::parse(line).unwrap_or_else(|error| panic!("valid line: {error}")) {
            IncomingLine::Response { id, result, .. } => {
                assert_eq!(id, RequestId::Number(1));
                assert!(result.is_some());
            }
            IncomingLine::Call { .. } => panic!("expected a response"),
        }
    }

    #[test]
    fn incoming_notification_line_parses_as_call_variant_with_no_id() {
        let line = r#"{"jsonrpc":"2.0","method":"sessionUpdate","params":{}}"#;
        match IncomingLine::parse(line).unwrap_or_else(|error| panic!("valid line: {error}")) {
            IncomingLine::Call { method, id, .. } => {
                assert_eq!(method, "sessionUpdate");
                assert!(id.is_none());
            }
            IncomingLine::Response { .. } => panic!("expected a call"),
        }
    }

    #[test]
    fn incoming_request_permission_call_is_not_mistaken_for_a_response() {
        let line = r#"{"jsonrpc":"2.0","id":7,"method":"requestPermission","params":{"options":[]}}"#;
        match IncomingLine::parse(line).unwrap_or_else(|error| panic!("valid line: {error}")) {
            IncomingLine::Call { method, id, .. } => {
                assert_eq!(method, "requestPermission");
                assert_eq!(id, Some(RequestId::Number(7)));
            }
            IncomingLine::Response { .. } => {
                panic!("a line with both id and method must parse as Call, not Response")
            }
        }
    }

    #[test]
    fn incoming_error_response_carries_the_message() {
        let line = r#"{"jsonrpc":"2.0","id":"abc","error":{"code":-32000,"message":"invalid conversation history"}}"#;
        match IncomingLine::parse(line).unwrap_or_else(|error| panic!("valid line: {error}")) {
            IncomingLine::Response { error: Some(e), .. } => {
                assert!(e.message.contains("invalid conversation history"));
            }
            _ => panic!("expected an error response"),
        }
    }
}
