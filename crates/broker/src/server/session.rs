//! Session shell
//!
//! Runs one external client's connection: reads newline-delimited JSON-RPC
//! from the transport, feeds it to the [`BrokerServer`], and writes back
//! responses. The shell is generic over the transport halves so the same
//! loop serves Unix-socket connections and plain stdio.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::server::broker::{BrokerServer, Session};

/// Why a session loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// The client closed its end of the transport.
    Eof,
    /// The transport failed mid-session.
    StreamError,
}

/// Serve one session until the client disconnects.
pub async fn run_session<R, W>(server: Arc<BrokerServer>, reader: R, mut writer: W) -> SessionExit
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = Session::new();
    let mut lines = BufReader::new(reader).lines();

    tracing::info!(session = %session.id, "session opened");

    let exit = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break SessionExit::Eof,
            Err(e) => {
                tracing::warn!(session = %session.id, error = %e, "session read failed");
                break SessionExit::StreamError;
            }
        };

        let Some(response) = server.handle_line(&mut session, &line).await else {
            continue;
        };

        let mut payload = match serde_json::to_string(&response) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(session = %session.id, error = %e, "response encoding failed");
                continue;
            }
        };
        payload.push('\n');

        if let Err(e) = writer.write_all(payload.as_bytes()).await {
            tracing::warn!(session = %session.id, error = %e, "session write failed");
            break SessionExit::StreamError;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(session = %session.id, error = %e, "session flush failed");
            break SessionExit::StreamError;
        }
    };

    tracing::info!(session = %session.id, ?exit, "session closed");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::mcp::aggregator::ToolAggregator;
    use crate::mcp::manager::{ClientManager, SupervisorSettings};

    fn test_server() -> Arc<BrokerServer> {
        let manager = ClientManager::new(Vec::new(), SupervisorSettings::default());
        let aggregator = Arc::new(ToolAggregator::new(manager));
        Arc::new(BrokerServer::new(aggregator, None, false))
    }

    #[tokio::test]
    async fn test_session_answers_and_exits_on_eof() {
        let server = test_server();
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n".to_vec();
        let mut output = Vec::new();

        let exit = run_session(server, &input[..], &mut output).await;
        assert_eq!(exit, SessionExit::Eof);

        let response: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_session_ignores_notifications() {
        let server = test_server();
        let input = b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n".to_vec();
        let mut output = Vec::new();

        let exit = run_session(server, &input[..], &mut output).await;
        assert_eq!(exit, SessionExit::Eof);
        assert!(output.is_empty());
    }
}
