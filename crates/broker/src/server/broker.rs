//! Broker MCP endpoint
//!
//! Dispatches the MCP methods external sessions may call and applies the
//! tag-based access filter to everything tool-shaped. Transport-agnostic:
//! session shells feed it one decoded line at a time and write back whatever
//! response it returns.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::auth::{ClientContext, JwtVerifier};
use crate::error::BrokerError;
use crate::mcp::aggregator::{AggregatorError, ToolAggregator};
use crate::mcp::types::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolCallParams, ToolCallResult, BROKER_NAME,
    PROTOCOL_VERSION,
};

/// Upper bound on the number of keys in a tool-call arguments object.
const MAX_ARGUMENT_KEYS: usize = 100;

/// Per-connection state a session shell threads through the dispatcher.
pub struct Session {
    pub id: Uuid,
    pub context: Option<ClientContext>,
    dev_mode_warned: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            context: None,
            dev_mode_warned: false,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// The MCP-facing endpoint shared by all sessions.
pub struct BrokerServer {
    aggregator: Arc<ToolAggregator>,
    verifier: Option<Arc<JwtVerifier>>,
    require_auth: bool,
}

impl BrokerServer {
    pub fn new(
        aggregator: Arc<ToolAggregator>,
        verifier: Option<Arc<JwtVerifier>>,
        require_auth: bool,
    ) -> Self {
        Self {
            aggregator,
            verifier,
            require_auth,
        }
    }

    /// Handle one raw line from a session. Returns `None` when no response
    /// should be written (notifications, or invalid requests without an id).
    pub async fn handle_line(&self, session: &mut Session, line: &str) -> Option<JsonRpcResponse> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let envelope: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    None,
                    JsonRpcError::parse_error(format!("invalid JSON: {}", e)),
                ));
            }
        };

        // Requests must decode to a proper envelope; the id (when present)
        // is echoed even on rejection.
        let id = envelope.get("id").map(|v| {
            serde_json::from_value(v.clone()).unwrap_or(crate::mcp::types::JsonRpcId::Null)
        });
        let request: JsonRpcRequest = match serde_json::from_value(envelope) {
            Ok(r) => r,
            Err(_) => {
                return id.map(|id| {
                    JsonRpcResponse::error(
                        Some(id),
                        JsonRpcError::invalid_request("malformed JSON-RPC request"),
                    )
                });
            }
        };

        if request.is_notification() {
            tracing::debug!(session = %session.id, method = %request.method, "notification absorbed");
            return None;
        }

        let id = request.id.clone();
        let outcome = self.dispatch(session, &request).await;
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                tracing::debug!(
                    session = %session.id,
                    method = %request.method,
                    error = %e,
                    "request failed"
                );
                JsonRpcResponse::error(id, e.to_json_rpc())
            }
        })
    }

    async fn dispatch(
        &self,
        session: &mut Session,
        request: &JsonRpcRequest,
    ) -> Result<Value, BrokerError> {
        match request.method.as_str() {
            "initialize" => Ok(self.handle_initialize()),
            "ping" => Ok(serde_json::json!({})),
            "authenticate" => self.handle_authenticate(session, request.params.as_ref()),
            "tools/list" => self.handle_tools_list(session).await,
            "tools/call" => self.handle_tools_call(session, request.params.as_ref()).await,
            other => Err(BrokerError::MethodNotFound(other.to_string())),
        }
    }

    fn handle_initialize(&self) -> Value {
        serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": BROKER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    fn handle_authenticate(
        &self,
        session: &mut Session,
        params: Option<&Value>,
    ) -> Result<Value, BrokerError> {
        let token = params
            .and_then(|p| p.get("token"))
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::InvalidToolParams("missing 'token'".to_string()))?;

        let verifier = self
            .verifier
            .as_ref()
            .ok_or(BrokerError::AuthenticationFailed)?;

        let verified = verifier
            .verify(token)
            .map_err(|_| BrokerError::InvalidToken)?;

        tracing::info!(
            session = %session.id,
            subject = %verified.subject,
            "session authenticated"
        );
        let context = ClientContext::new(verified.subject.clone(), verified.allowed_tags);
        session.context = Some(context);

        Ok(serde_json::json!({ "ok": true, "subject": verified.subject }))
    }

    async fn handle_tools_list(&self, session: &mut Session) -> Result<Value, BrokerError> {
        let catalog = self.aggregator.aggregate().await;
        let visible = self.filter_visible(session, &catalog)?;

        let tools: Vec<Value> = visible.iter().map(|t| t.to_listing()).collect();
        Ok(serde_json::json!({ "tools": tools }))
    }

    /// Apply the access filter to a catalog snapshot.
    fn filter_visible<'a>(
        &self,
        session: &mut Session,
        catalog: &'a [crate::mcp::types::Tool],
    ) -> Result<Vec<&'a crate::mcp::types::Tool>, BrokerError> {
        match &session.context {
            Some(context) => Ok(catalog
                .iter()
                .filter(|t| context.has_access_to_tags(&t.server_tags))
                .collect()),
            None => {
                if self.require_auth {
                    return Err(BrokerError::AuthenticationRequired);
                }
                if !session.dev_mode_warned {
                    tracing::warn!(
                        session = %session.id,
                        "unauthenticated session sees the full catalog (development mode)"
                    );
                    session.dev_mode_warned = true;
                }
                Ok(catalog.iter().collect())
            }
        }
    }

    async fn handle_tools_call(
        &self,
        session: &mut Session,
        params: Option<&Value>,
    ) -> Result<Value, BrokerError> {
        let params = params.ok_or_else(|| {
            BrokerError::InvalidToolParams("missing params".to_string())
        })?;
        let call: ToolCallParams = serde_json::from_value(params.clone())
            .map_err(|e| BrokerError::InvalidToolParams(e.to_string()))?;

        validate_tool_name(&call.name)?;
        let arguments = validate_arguments(call.arguments)?;

        self.authorize_call(session, &call.name).await?;

        let result = self
            .aggregator
            .call_tool(&call.name, arguments)
            .await
            .map_err(|e| match e {
                AggregatorError::ToolNotFound(name) => BrokerError::ToolNotFound(name),
                other => match BrokerError::from(other) {
                    BrokerError::ToolExecutionFailed { cause, .. } => {
                        BrokerError::ToolExecutionFailed {
                            tool: call.name.clone(),
                            cause,
                        }
                    }
                    mapped => mapped,
                },
            })?;

        let wrapped = ToolCallResult::wrap(result);
        Ok(serde_json::to_value(wrapped).unwrap_or(Value::Null))
    }

    /// Fail-safe authorization: unknown tools and unresolvable tags deny.
    async fn authorize_call(&self, session: &Session, exposed_name: &str) -> Result<(), BrokerError> {
        let context = match &session.context {
            Some(context) => context,
            None => {
                if self.require_auth {
                    return Err(BrokerError::AuthenticationRequired);
                }
                return Ok(()); // development mode
            }
        };

        let tags = self
            .aggregator
            .get_tool_server_tags(exposed_name)
            .await
            .ok_or(BrokerError::AccessDenied)?;

        if !context.has_access_to_tags(&tags) {
            tracing::info!(
                session = %session.id,
                subject = %context.subject,
                tool = %exposed_name,
                "tool call denied"
            );
            return Err(BrokerError::AccessDenied);
        }
        Ok(())
    }
}

fn validate_tool_name(name: &str) -> Result<(), BrokerError> {
    if name.is_empty() {
        return Err(BrokerError::InvalidToolParams(
            "tool name cannot be empty".to_string(),
        ));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(BrokerError::InvalidToolParams(format!(
            "invalid tool name '{}'",
            name
        )));
    }
    Ok(())
}

fn validate_arguments(arguments: Value) -> Result<Value, BrokerError> {
    match &arguments {
        Value::Null => Ok(Value::Object(serde_json::Map::new())),
        Value::Object(map) => {
            if map.len() > MAX_ARGUMENT_KEYS {
                return Err(BrokerError::InvalidToolParams(format!(
                    "arguments object has {} keys, limit is {}",
                    map.len(),
                    MAX_ARGUMENT_KEYS
                )));
            }
            Ok(arguments)
        }
        _ => Err(BrokerError::InvalidToolParams(
            "arguments must be an object".to_string(),
        )),
    }
}
