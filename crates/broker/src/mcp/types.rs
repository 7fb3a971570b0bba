//! MCP protocol types
//!
//! JSON-RPC 2.0 envelopes and the MCP-specific payloads the broker speaks on
//! both sides: toward downstream servers (as a client) and toward external
//! sessions (as a server). Protocol revision 2024-11-05.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision the broker negotiates with downstreams and announces to
/// external sessions.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Name the broker self-identifies with during handshakes.
pub const BROKER_NAME: &str = "McpBroker";

// =============================================================================
// JSON-RPC 2.0 Types
// =============================================================================

/// JSON-RPC request ID - can be string, number, or null
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcId {
    String(String),
    Number(i64),
    Null,
}

/// JSON-RPC 2.0 request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request with the given id.
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Build a notification (no id, no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    /// True if this envelope is a notification.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a successful response
    pub fn success(id: Option<JsonRpcId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<JsonRpcId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    // Standard JSON-RPC error codes
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self {
            code: Self::PARSE_ERROR,
            message: msg.into(),
            data: None,
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self {
            code: Self::INVALID_REQUEST,
            message: msg.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: Self::METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self {
            code: Self::INVALID_PARAMS,
            message: msg.into(),
            data: None,
        }
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self {
            code: Self::INTERNAL_ERROR,
            message: msg.into(),
            data: None,
        }
    }

    /// Attach a machine-readable reason under `data.reason`.
    pub fn with_reason(mut self, reason: &str) -> Self {
        self.data = Some(serde_json::json!({ "reason": reason }));
        self
    }
}

// =============================================================================
// MCP Handshake Types
// =============================================================================

/// Client info sent during initialize
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Server info returned during initialize
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Capabilities a client or server declares during the handshake.
///
/// The broker declares all three sections toward downstreams; toward external
/// sessions it only announces `tools`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
}

impl Capabilities {
    /// The capability set the broker declares when connecting downstream.
    pub fn declared_by_broker() -> Self {
        Self {
            tools: Some(serde_json::json!({})),
            resources: Some(serde_json::json!({})),
            prompts: Some(serde_json::json!({})),
        }
    }
}

/// Initialize request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Capabilities,
    pub client_info: ClientInfo,
}

/// Initialize response result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub server_info: ServerInfo,
}

// =============================================================================
// MCP Tool Types
// =============================================================================

/// A tool exactly as a downstream server reports it in `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, alias = "input_schema")]
    pub input_schema: Value,
}

/// tools/list response body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsListResult {
    pub tools: Vec<RawTool>,
}

/// tools/call request params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// A content block in a tool-call result returned to external sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text { text: String },
}

/// tools/call response body sent to external sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<Content>,
}

impl ToolCallResult {
    /// Wrap a raw downstream result. String results pass through unchanged;
    /// anything else is re-encoded as pretty JSON.
    pub fn wrap(result: Value) -> Self {
        let text = match result {
            Value::String(s) => s,
            other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
        };
        Self {
            content: vec![Content::Text { text }],
        }
    }
}

// =============================================================================
// Aggregated Catalog Types
// =============================================================================

/// One entry in the broker's aggregated tool catalog.
///
/// `exposed_name` is what external sessions see (conflict-prefixed where
/// needed); `original_name` is what the owning downstream expects, so routing
/// never has to re-parse the prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Tool {
    pub exposed_name: String,
    pub original_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub server_name: String,
    pub server_tags: BTreeSet<String>,
}

impl Tool {
    /// Render the catalog entry the way `tools/list` exposes it.
    pub fn to_listing(&self) -> Value {
        serde_json::json!({
            "name": self.exposed_name,
            "description": self.description.clone().unwrap_or_default(),
            "inputSchema": self.input_schema,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_parsing() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/list",
            "params": {}
        }"#;

        let req: JsonRpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "tools/list");
        assert_eq!(req.id, Some(JsonRpcId::Number(1)));
        assert!(!req.is_notification());
    }

    #[test]
    fn test_notification_has_no_id() {
        let req = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(req.is_notification());
        let encoded = serde_json::to_string(&req).unwrap();
        assert!(!encoded.contains("\"id\""));
    }

    #[test]
    fn test_json_rpc_response_success() {
        let resp =
            JsonRpcResponse::success(Some(JsonRpcId::Number(1)), serde_json::json!({"tools": []}));

        assert!(resp.result.is_some());
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_json_rpc_error_reason() {
        let resp = JsonRpcResponse::error(
            Some(JsonRpcId::Number(1)),
            JsonRpcError::internal_error("Access denied").with_reason("access_denied"),
        );

        let err = resp.error.unwrap();
        assert_eq!(err.code, JsonRpcError::INTERNAL_ERROR);
        assert_eq!(err.data.unwrap()["reason"], "access_denied");
    }

    #[test]
    fn test_raw_tool_accepts_both_schema_keys() {
        let camel: RawTool =
            serde_json::from_str(r#"{"name":"a","inputSchema":{"type":"object"}}"#).unwrap();
        let snake: RawTool =
            serde_json::from_str(r#"{"name":"b","input_schema":{"type":"object"}}"#).unwrap();
        assert_eq!(camel.input_schema, snake.input_schema);

        let neither: RawTool = serde_json::from_str(r#"{"name":"c"}"#).unwrap();
        assert_eq!(neither.input_schema, Value::Null);
    }

    #[test]
    fn test_tool_call_result_wrap_string_passthrough() {
        let wrapped = ToolCallResult::wrap(Value::String("hi".to_string()));
        match &wrapped.content[0] {
            Content::Text { text } => assert_eq!(text, "hi"),
        }
    }

    #[test]
    fn test_tool_call_result_wrap_object_pretty_printed() {
        let wrapped = ToolCallResult::wrap(serde_json::json!({"answer": 42}));
        match &wrapped.content[0] {
            Content::Text { text } => {
                assert!(text.contains("\"answer\": 42"));
            }
        }
    }
}
