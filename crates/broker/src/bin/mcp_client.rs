//! Per-client STDIO bridge
//!
//! Every external AI client runs its own `mcp_client`, which speaks MCP over
//! its stdin/stdout and relays each line to the shared broker over the
//! rendezvous Unix socket. This is how many clients get private sessions
//! while the downstream processes behind the broker are started exactly
//! once.
//!
//! The bridge discovers a bearer token from `MCP_CLIENT_JWT` or
//! `~/.mcp/client.json` and authenticates the session before relaying any
//! client traffic. With no token the session runs unauthenticated and the
//! broker decides whether to allow that.
//!
//! Exits 0 when the client closes stdin, 1 on a broker stream error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use mcp_broker::config;

/// Connect retry schedule toward a broker that may still be starting.
const CONNECT_BASE_DELAY_MS: u64 = 100;
const CONNECT_MAX_DELAY: Duration = Duration::from_secs(5);
const CONNECT_RETRIES: usize = 5;

#[derive(Debug, Deserialize)]
struct ClientCredentials {
    jwt: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout belongs to the MCP conversation; log to stderr only.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let socket_path = std::env::var("MCP_BROKER_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config::default_socket_path());

    let retry_strategy = ExponentialBackoff::from_millis(CONNECT_BASE_DELAY_MS)
        .max_delay(CONNECT_MAX_DELAY)
        .take(CONNECT_RETRIES)
        .map(jitter);

    let stream = match Retry::spawn(retry_strategy, || UnixStream::connect(&socket_path)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(path = %socket_path.display(), error = %e, "cannot reach broker");
            return ExitCode::FAILURE;
        }
    };

    let (broker_read, mut broker_write) = stream.into_split();
    let mut broker_lines = BufReader::new(broker_read).lines();

    // Authenticate before any client traffic so the session's tool view is
    // settled from the first request on.
    if let Some(token) = discover_token() {
        let auth_id = format!("auth-{}", Uuid::new_v4());
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": auth_id,
            "method": "authenticate",
            "params": { "token": token },
        });
        let mut payload = request.to_string();
        payload.push('\n');

        if broker_write.write_all(payload.as_bytes()).await.is_err() {
            tracing::error!("broker connection lost during authentication");
            return ExitCode::FAILURE;
        }

        match broker_lines.next_line().await {
            Ok(Some(line)) => {
                let response: serde_json::Value = serde_json::from_str(&line).unwrap_or_default();
                if response.get("error").is_some() {
                    tracing::warn!(error = %response["error"], "authentication rejected");
                } else {
                    tracing::debug!(subject = %response["result"]["subject"], "authenticated");
                }
            }
            _ => {
                tracing::error!("broker closed the connection during authentication");
                return ExitCode::FAILURE;
            }
        }
    } else {
        tracing::warn!("no client token found, session is unauthenticated");
    }

    // Relay both directions until one side closes.
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            from_client = stdin_lines.next_line() => {
                match from_client {
                    Ok(Some(line)) => {
                        let mut payload = line;
                        payload.push('\n');
                        if broker_write.write_all(payload.as_bytes()).await.is_err() {
                            tracing::error!("broker write failed");
                            return ExitCode::FAILURE;
                        }
                    }
                    Ok(None) => return ExitCode::SUCCESS,
                    Err(e) => {
                        tracing::error!(error = %e, "stdin read failed");
                        return ExitCode::FAILURE;
                    }
                }
            }
            from_broker = broker_lines.next_line() => {
                match from_broker {
                    Ok(Some(line)) => {
                        let mut payload = line;
                        payload.push('\n');
                        if stdout.write_all(payload.as_bytes()).await.is_err()
                            || stdout.flush().await.is_err()
                        {
                            tracing::error!("stdout write failed");
                            return ExitCode::FAILURE;
                        }
                    }
                    Ok(None) => {
                        tracing::error!("broker closed the connection");
                        return ExitCode::FAILURE;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "broker read failed");
                        return ExitCode::FAILURE;
                    }
                }
            }
        }
    }
}

/// Token discovery: `MCP_CLIENT_JWT`, then `~/.mcp/client.json`.
fn discover_token() -> Option<String> {
    if let Ok(token) = std::env::var("MCP_CLIENT_JWT") {
        if !token.trim().is_empty() {
            return Some(token);
        }
    }

    let path = dirs::home_dir()?.join(".mcp/client.json");
    let contents = std::fs::read_to_string(path).ok()?;
    let credentials: ClientCredentials = serde_json::from_str(&contents).ok()?;
    Some(credentials.jwt)
}
