//! Session-facing error taxonomy
//!
//! Internal errors from the auth, aggregation, and downstream layers are
//! converted here into JSON-RPC error objects. Access denial and tool
//! failure share `-32603` but are distinguished by `data.reason`; nothing in
//! an outgoing error exposes stack traces or process details.

use crate::mcp::aggregator::AggregatorError;
use crate::mcp::downstream::DownstreamError;
use crate::mcp::manager::ManagerError;
use crate::mcp::types::JsonRpcError;

/// Application error type for broker sessions
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    // Authentication errors
    #[error("Authentication failed")]
    AuthenticationFailed,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Authentication required")]
    AuthenticationRequired,
    #[error("Access denied")]
    AccessDenied,

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),
    #[error("Tool execution failed for '{tool}': {cause}")]
    ToolExecutionFailed { tool: String, cause: String },
    #[error("Invalid tool params: {0}")]
    InvalidToolParams(String),

    // Protocol errors
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    // Client errors
    #[error("No downstream server named '{0}'")]
    ClientNotFound(String),
    #[error("Downstream timed out")]
    ClientTimeout,
    #[error("Downstream connection closed")]
    ConnectionClosed,

    // Server errors
    #[error("Downstream not available")]
    ServerNotAvailable,
}

impl BrokerError {
    /// Machine-readable discriminator carried in `data.reason`.
    pub fn reason(&self) -> &'static str {
        match self {
            BrokerError::AuthenticationFailed => "authentication_failed",
            BrokerError::InvalidToken => "invalid_token",
            BrokerError::AuthenticationRequired => "authentication_required",
            BrokerError::AccessDenied => "access_denied",
            BrokerError::ToolNotFound(_) => "tool_not_found",
            BrokerError::ToolExecutionFailed { .. } => "tool_execution_failed",
            BrokerError::InvalidToolParams(_) => "invalid_tool_params",
            BrokerError::MethodNotFound(_) => "method_not_found",
            BrokerError::ClientNotFound(_) => "client_not_found",
            BrokerError::ClientTimeout => "client_timeout",
            BrokerError::ConnectionClosed => "connection_closed",
            BrokerError::ServerNotAvailable => "server_not_available",
        }
    }

    /// Map onto the JSON-RPC error object sent to the session.
    pub fn to_json_rpc(&self) -> JsonRpcError {
        let error = match self {
            BrokerError::MethodNotFound(method) => JsonRpcError::method_not_found(method),
            BrokerError::InvalidToolParams(msg) => JsonRpcError::invalid_params(msg.clone()),
            BrokerError::AccessDenied => JsonRpcError::internal_error("Access denied"),
            other => JsonRpcError::internal_error(other.to_string()),
        };
        error.with_reason(self.reason())
    }
}

impl From<AggregatorError> for BrokerError {
    fn from(err: AggregatorError) -> Self {
        match err {
            AggregatorError::ToolNotFound(name) => BrokerError::ToolNotFound(name),
            AggregatorError::Manager(inner) => inner.into(),
        }
    }
}

impl From<ManagerError> for BrokerError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::ClientNotFound(name) => BrokerError::ClientNotFound(name),
            ManagerError::Downstream(inner) => inner.into(),
        }
    }
}

impl From<DownstreamError> for BrokerError {
    fn from(err: DownstreamError) -> Self {
        match err {
            DownstreamError::Timeout => BrokerError::ClientTimeout,
            DownstreamError::Closed => BrokerError::ConnectionClosed,
            DownstreamError::NotReady => BrokerError::ServerNotAvailable,
            DownstreamError::Rpc(msg) => BrokerError::ToolExecutionFailed {
                tool: String::new(),
                cause: msg,
            },
            other => BrokerError::ToolExecutionFailed {
                tool: String::new(),
                cause: other.to_string(),
            },
        }
    }
}

/// Result type alias for broker session handlers
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::JsonRpcError as Rpc;

    #[test]
    fn test_access_denied_maps_to_internal_error_with_reason() {
        let err = BrokerError::AccessDenied.to_json_rpc();
        assert_eq!(err.code, Rpc::INTERNAL_ERROR);
        assert_eq!(err.message, "Access denied");
        assert_eq!(err.data.unwrap()["reason"], "access_denied");
    }

    #[test]
    fn test_tool_failure_distinguished_from_access_denial() {
        let err = BrokerError::ToolExecutionFailed {
            tool: "echo".to_string(),
            cause: "boom".to_string(),
        }
        .to_json_rpc();
        assert_eq!(err.code, Rpc::INTERNAL_ERROR);
        assert_eq!(err.data.unwrap()["reason"], "tool_execution_failed");
    }

    #[test]
    fn test_invalid_params_uses_dedicated_code() {
        let err = BrokerError::InvalidToolParams("bad name".to_string()).to_json_rpc();
        assert_eq!(err.code, Rpc::INVALID_PARAMS);
    }
}
