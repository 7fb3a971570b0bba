//! Downstream MCP client
//!
//! One [`DownstreamClient`] owns one child process speaking JSON-RPC 2.0 over
//! newline-delimited stdio. All access to the child's pipes and the
//! pending-request table is serialized through a single actor task; callers
//! talk to it over a command channel and get their replies through oneshot
//! slots registered in the pending table.
//!
//! The actor's select loop consumes new commands, child stdout chunks, the
//! child's exit, and a sweep timer that releases timed-out waiters. Child
//! death is a normal branch of the loop, not an exceptional path: every
//! pending waiter is resolved with [`DownstreamError::Closed`] and the
//! supervisor is notified.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::config::ServerConfig;
use crate::mcp::types::{
    Capabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcId, JsonRpcRequest,
    ServerInfo, ToolsListResult, RawTool, BROKER_NAME, PROTOCOL_VERSION,
};

/// Deadline for the initialize handshake.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a tools/list round trip.
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a tools/call round trip.
const CALL_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a shutdown waits for the child to exit before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Resolution of the deadline sweep timer.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Command channel depth per downstream.
const COMMAND_BUFFER: usize = 32;

/// Error type for downstream client operations
#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("Process spawn failed: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Downstream returned error: {0}")]
    Rpc(String),

    #[error("Downstream connection closed")]
    Closed,

    #[error("Downstream not ready")]
    NotReady,

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Invalid response from downstream")]
    InvalidResponse,
}

/// Result type for downstream client operations
pub type DownstreamResult<T> = Result<T, DownstreamError>;

/// Lifecycle state of one downstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Starting,
    Initializing,
    Ready,
    Closing,
    Dead,
}

/// Notification the supervisor receives when a child terminates.
#[derive(Debug, Clone)]
pub struct DeathNotice {
    pub server: String,
    /// True for clean exits and broker-initiated shutdowns; the supervisor
    /// only schedules reconnects for non-graceful deaths.
    pub graceful: bool,
}

enum ActorCommand {
    ListTools(oneshot::Sender<DownstreamResult<Vec<RawTool>>>),
    CallTool {
        name: String,
        arguments: Value,
        reply: oneshot::Sender<DownstreamResult<Value>>,
    },
    Shutdown,
}

enum Waiter {
    Initialize,
    SpeculativeTools,
    ListTools(oneshot::Sender<DownstreamResult<Vec<RawTool>>>),
    CallTool(oneshot::Sender<DownstreamResult<Value>>),
}

struct Pending {
    waiter: Waiter,
    deadline: Instant,
}

/// Accumulates raw child-output bytes and yields complete lines.
///
/// Partial data without a terminating newline stays buffered and is prepended
/// to the next chunk.
#[derive(Default)]
pub(crate) struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }
}

/// Handle to one supervised downstream MCP server.
pub struct DownstreamClient {
    config: ServerConfig,
    cmd_tx: mpsc::Sender<ActorCommand>,
    state: Arc<RwLock<ClientState>>,
    server_info: Arc<RwLock<Option<ServerInfo>>>,
}

impl DownstreamClient {
    /// Spawn the configured child process, complete the MCP handshake, and
    /// return a ready handle. Fails if the child cannot be spawned or does
    /// not answer `initialize` within the deadline.
    pub async fn start(
        config: ServerConfig,
        death_tx: mpsc::Sender<DeathNotice>,
    ) -> DownstreamResult<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            DownstreamError::Spawn(format!("failed to spawn {}: {}", config.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DownstreamError::Spawn("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownstreamError::Spawn("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownstreamError::Spawn("failed to capture stderr".to_string()))?;

        spawn_stderr_pump(config.name.clone(), stderr);

        let state = Arc::new(RwLock::new(ClientState::Starting));
        let server_info = Arc::new(RwLock::new(None));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();

        let actor = Actor {
            name: config.name.clone(),
            child,
            stdin,
            pending: HashMap::new(),
            next_id: 0,
            tools: None,
            state: state.clone(),
            server_info: server_info.clone(),
            death_tx,
            ready_tx: Some(ready_tx),
            closing: false,
            dead: false,
        };
        tokio::spawn(actor.run(stdout, cmd_rx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                config,
                cmd_tx,
                state,
                server_info,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DownstreamError::Closed),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().await.clone()
    }

    /// Fetch the downstream's tool list. Served from the client's cache when
    /// one is present; otherwise issues a `tools/list` round trip.
    pub async fn list_tools(&self) -> DownstreamResult<Vec<RawTool>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorCommand::ListTools(tx))
            .await
            .map_err(|_| DownstreamError::Closed)?;
        rx.await.map_err(|_| DownstreamError::Closed)?
    }

    /// Invoke a tool by its downstream name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> DownstreamResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorCommand::CallTool {
                name: name.to_string(),
                arguments,
                reply: tx,
            })
            .await
            .map_err(|_| DownstreamError::Closed)?;
        rx.await.map_err(|_| DownstreamError::Closed)?
    }

    /// Ask the actor to terminate its child and wind down.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ActorCommand::Shutdown).await;
    }
}

struct Actor {
    name: String,
    child: Child,
    stdin: ChildStdin,
    pending: HashMap<u64, Pending>,
    next_id: u64,
    tools: Option<Vec<RawTool>>,
    state: Arc<RwLock<ClientState>>,
    server_info: Arc<RwLock<Option<ServerInfo>>>,
    death_tx: mpsc::Sender<DeathNotice>,
    ready_tx: Option<oneshot::Sender<DownstreamResult<()>>>,
    closing: bool,
    dead: bool,
}

impl Actor {
    async fn run(mut self, mut stdout: ChildStdout, mut cmd_rx: mpsc::Receiver<ActorCommand>) {
        self.set_state(ClientState::Initializing).await;
        if let Err(e) = self.send_initialize().await {
            tracing::warn!(server = %self.name, error = %e, "failed to send initialize");
            self.fail_init(e).await;
            return;
        }

        let mut assembler = LineAssembler::default();
        let mut chunk = [0u8; 4096];
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                return;
                            }
                        }
                        // All handles dropped: wind the child down.
                        None => {
                            self.terminate(true).await;
                            return;
                        }
                    }
                }
                read = stdout.read(&mut chunk) => {
                    match read {
                        Ok(0) => {
                            // EOF: the child closed its end.
                            self.on_child_exit().await;
                            return;
                        }
                        Ok(n) => {
                            for line in assembler.feed(&chunk[..n]) {
                                if self.handle_line(&line).await {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(server = %self.name, error = %e, "stdout read failed");
                            self.on_child_exit().await;
                            return;
                        }
                    }
                }
                status = self.child.wait() => {
                    let graceful = matches!(&status, Ok(s) if s.success()) || self.closing;
                    tracing::info!(server = %self.name, ?status, "child process exited");
                    self.finish_dead(graceful).await;
                    return;
                }
                _ = sweep.tick() => {
                    if self.sweep_deadlines().await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns true when the actor should stop.
    async fn handle_command(&mut self, cmd: ActorCommand) -> bool {
        match cmd {
            ActorCommand::ListTools(reply) => {
                if *self.state.read().await != ClientState::Ready {
                    let _ = reply.send(Err(DownstreamError::NotReady));
                    return false;
                }
                if let Some(tools) = &self.tools {
                    let _ = reply.send(Ok(tools.clone()));
                    return false;
                }
                if let Err(e) = self
                    .send_request(
                        "tools/list",
                        None,
                        Waiter::ListTools(reply),
                        LIST_TOOLS_TIMEOUT,
                    )
                    .await
                {
                    tracing::warn!(server = %self.name, error = %e, "tools/list write failed");
                }
                false
            }
            ActorCommand::CallTool {
                name,
                arguments,
                reply,
            } => {
                if *self.state.read().await != ClientState::Ready {
                    let _ = reply.send(Err(DownstreamError::NotReady));
                    return false;
                }
                let params = serde_json::json!({ "name": name, "arguments": arguments });
                if let Err(e) = self
                    .send_request(
                        "tools/call",
                        Some(params),
                        Waiter::CallTool(reply),
                        CALL_TOOL_TIMEOUT,
                    )
                    .await
                {
                    tracing::warn!(server = %self.name, error = %e, "tools/call write failed");
                }
                false
            }
            ActorCommand::Shutdown => {
                self.terminate(true).await;
                true
            }
        }
    }

    async fn send_initialize(&mut self) -> DownstreamResult<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities::declared_by_broker(),
            client_info: ClientInfo {
                name: BROKER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        self.send_request(
            "initialize",
            Some(serde_json::to_value(params)?),
            Waiter::Initialize,
            INIT_TIMEOUT,
        )
        .await
    }

    /// Assign the next request id, register the waiter, and write the request.
    async fn send_request(
        &mut self,
        method: &str,
        params: Option<Value>,
        waiter: Waiter,
        timeout: Duration,
    ) -> DownstreamResult<()> {
        self.next_id += 1;
        let id = self.next_id;

        let request = JsonRpcRequest::new(JsonRpcId::Number(id as i64), method, params);
        let mut payload = serde_json::to_string(&request)?;
        payload.push('\n');

        self.pending.insert(
            id,
            Pending {
                waiter,
                deadline: Instant::now() + timeout,
            },
        );

        if let Err(e) = self.write_payload(&payload).await {
            if let Some(pending) = self.pending.remove(&id) {
                resolve(pending.waiter, Err(DownstreamError::Closed));
            }
            return Err(e);
        }
        Ok(())
    }

    async fn send_notification(&mut self, method: &str, params: Option<Value>) -> DownstreamResult<()> {
        let request = JsonRpcRequest::notification(method, params);
        let mut payload = serde_json::to_string(&request)?;
        payload.push('\n');
        self.write_payload(&payload).await
    }

    async fn write_payload(&mut self, payload: &str) -> DownstreamResult<()> {
        self.stdin.write_all(payload.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Process one complete line of child output. Returns true when the actor
    /// should stop (the handshake failed and the child was torn down).
    async fn handle_line(&mut self, line: &str) -> bool {
        if line.is_empty() {
            return false;
        }
        if !line.starts_with('{') {
            // Non-protocol output interleaved on stdout.
            tracing::debug!(server = %self.name, output = %line, "ignoring non-JSON line");
            return false;
        }

        let envelope: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(server = %self.name, error = %e, "dropping malformed JSON line");
                return false;
            }
        };

        // Requests and notifications originated by the child carry a method;
        // the broker does not act on them.
        if envelope.get("method").is_some() {
            tracing::debug!(
                server = %self.name,
                method = %envelope["method"],
                "ignoring child-originated message"
            );
            return false;
        }

        let Some(id) = envelope.get("id").and_then(Value::as_u64) else {
            tracing::debug!(server = %self.name, "dropping response without usable id");
            return false;
        };

        let Some(pending) = self.pending.remove(&id) else {
            tracing::debug!(server = %self.name, id, "dropping response with unknown id");
            return false;
        };

        let rpc_error = envelope.get("error").map(|e| {
            e.get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string()
        });
        let result = envelope.get("result").cloned();

        match pending.waiter {
            Waiter::Initialize => {
                return self.complete_initialize(result, rpc_error).await;
            }
            Waiter::SpeculativeTools => match parse_tools(result, rpc_error) {
                Ok(tools) => {
                    tracing::debug!(server = %self.name, count = tools.len(), "tool list prefetched");
                    self.tools = Some(tools);
                }
                Err(e) => {
                    tracing::debug!(server = %self.name, error = %e, "tool prefetch failed");
                }
            },
            Waiter::ListTools(reply) => {
                let parsed = parse_tools(result, rpc_error);
                if let Ok(tools) = &parsed {
                    self.tools = Some(tools.clone());
                }
                let _ = reply.send(parsed);
            }
            Waiter::CallTool(reply) => {
                let outcome = match rpc_error {
                    Some(msg) => Err(DownstreamError::Rpc(msg)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = reply.send(outcome);
            }
        }
        false
    }

    /// Returns true when the actor should stop (handshake failure).
    async fn complete_initialize(
        &mut self,
        result: Option<Value>,
        rpc_error: Option<String>,
    ) -> bool {
        if let Some(msg) = rpc_error {
            self.fail_init(DownstreamError::InitializationFailed(msg)).await;
            return true;
        }

        let parsed: Result<InitializeResult, _> =
            serde_json::from_value(result.unwrap_or(Value::Null));
        let init = match parsed {
            Ok(init) => init,
            Err(e) => {
                self.fail_init(DownstreamError::InitializationFailed(e.to_string()))
                    .await;
                return true;
            }
        };

        tracing::info!(
            server = %self.name,
            downstream_name = %init.server_info.name,
            downstream_version = %init.server_info.version,
            protocol = %init.protocol_version,
            "downstream initialized"
        );
        *self.server_info.write().await = Some(init.server_info);

        if let Err(e) = self.send_notification("notifications/initialized", None).await {
            self.fail_init(DownstreamError::InitializationFailed(e.to_string()))
                .await;
            return true;
        }
        // Speculative prefetch so the first aggregation pass is cheap.
        if let Err(e) = self
            .send_request("tools/list", None, Waiter::SpeculativeTools, LIST_TOOLS_TIMEOUT)
            .await
        {
            tracing::debug!(server = %self.name, error = %e, "tool prefetch write failed");
        }

        self.set_state(ClientState::Ready).await;
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(Ok(()));
        }
        false
    }

    /// Release waiters whose deadline has passed. Returns true when the actor
    /// should stop (initialization itself timed out).
    async fn sweep_deadlines(&mut self) -> bool {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            match pending.waiter {
                Waiter::Initialize => {
                    tracing::warn!(server = %self.name, "initialize timed out");
                    self.fail_init(DownstreamError::InitializationFailed(
                        "initialization timeout".to_string(),
                    ))
                    .await;
                    return true;
                }
                Waiter::SpeculativeTools => {
                    tracing::debug!(server = %self.name, "tool prefetch timed out");
                }
                waiter => {
                    tracing::warn!(server = %self.name, id, "request timed out");
                    resolve(waiter, Err(DownstreamError::Timeout));
                }
            }
        }
        false
    }

    async fn fail_init(&mut self, error: DownstreamError) {
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(Err(error));
        }
        self.terminate(false).await;
    }

    /// Kill or wait out the child, then settle into the dead state.
    async fn terminate(&mut self, graceful: bool) {
        self.closing = true;
        self.set_state(ClientState::Closing).await;
        self.resolve_all_pending();

        // Closing stdin asks a well-behaved server to exit on its own.
        let _ = self.stdin.shutdown().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.name, ?status, "child exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.name, error = %e, "error waiting for child");
            }
            Err(_) => {
                tracing::warn!(server = %self.name, "killing unresponsive child");
                let _ = self.child.kill().await;
                let _ = self.child.wait().await;
            }
        }

        self.finish_dead(graceful).await;
    }

    async fn on_child_exit(&mut self) {
        // The child closed stdout; give it a moment to fully exit before
        // forcing the issue.
        let graceful = match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => status.success() || self.closing,
            Ok(Err(_)) => self.closing,
            Err(_) => {
                let _ = self.child.kill().await;
                let _ = self.child.wait().await;
                self.closing
            }
        };
        self.finish_dead(graceful).await;
    }

    async fn finish_dead(&mut self, graceful: bool) {
        if self.dead {
            return;
        }
        self.dead = true;
        self.resolve_all_pending();
        self.set_state(ClientState::Dead).await;
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(Err(DownstreamError::Closed));
        }
        let _ = self
            .death_tx
            .send(DeathNotice {
                server: self.name.clone(),
                graceful,
            })
            .await;
    }

    fn resolve_all_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            resolve(pending.waiter, Err(DownstreamError::Closed));
        }
    }

    async fn set_state(&self, state: ClientState) {
        *self.state.write().await = state;
    }
}

fn resolve(waiter: Waiter, outcome: DownstreamResult<Value>) {
    match waiter {
        Waiter::Initialize | Waiter::SpeculativeTools => {}
        Waiter::ListTools(reply) => {
            let _ = reply.send(outcome.and_then(|v| parse_tools(Some(v), None)));
        }
        Waiter::CallTool(reply) => {
            let _ = reply.send(outcome);
        }
    }
}

fn parse_tools(
    result: Option<Value>,
    rpc_error: Option<String>,
) -> DownstreamResult<Vec<RawTool>> {
    if let Some(msg) = rpc_error {
        return Err(DownstreamError::Rpc(msg));
    }
    let result = result.ok_or(DownstreamError::InvalidResponse)?;
    let parsed: ToolsListResult =
        serde_json::from_value(result).map_err(|_| DownstreamError::InvalidResponse)?;
    Ok(parsed.tools)
}

/// Drain and log the child's stderr so it never blocks on a full pipe.
fn spawn_stderr_pump(server: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if trimmed.contains("ERROR") || trimmed.contains("FATAL") {
                        tracing::warn!(server = %server, stderr = %trimmed);
                    } else {
                        tracing::debug!(server = %server, stderr = %trimmed);
                    }
                }
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_assembler_splits_complete_lines() {
        let mut assembler = LineAssembler::default();
        let lines = assembler.feed(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_line_assembler_buffers_partial_lines() {
        let mut assembler = LineAssembler::default();
        assert!(assembler.feed(b"{\"par").is_empty());
        assert!(assembler.feed(b"tial\":t").is_empty());
        let lines = assembler.feed(b"rue}\nnext");
        assert_eq!(lines, vec!["{\"partial\":true}"]);
        let lines = assembler.feed(b"\n");
        assert_eq!(lines, vec!["next"]);
    }

    #[test]
    fn test_line_assembler_trims_carriage_returns() {
        let mut assembler = LineAssembler::default();
        let lines = assembler.feed(b"  {\"a\":1}\r\n");
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_parse_tools_from_result() {
        let result = serde_json::json!({
            "tools": [
                {"name": "echo", "inputSchema": {"type": "object"}}
            ]
        });
        let tools = parse_tools(Some(result), None).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[test]
    fn test_parse_tools_propagates_rpc_error() {
        let err = parse_tools(None, Some("boom".to_string())).unwrap_err();
        assert!(matches!(err, DownstreamError::Rpc(_)));
    }

    #[test]
    fn test_parse_tools_rejects_malformed_result() {
        let err = parse_tools(Some(serde_json::json!({"tools": "nope"})), None).unwrap_err();
        assert!(matches!(err, DownstreamError::InvalidResponse));
    }
}
