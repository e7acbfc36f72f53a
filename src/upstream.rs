//! Upstream server lifecycle: one instance per configured child MCP server.
//!
//! Each upstream owns its child process, its framed stdio connection and its
//! in-flight request map. Two pump tasks run per connection: the receive
//! pump resolves responses against pending waiters and forwards
//! upstream-originated requests and notifications to the router through an
//! event channel; the stderr pump re-emits the child's stderr into the
//! structured log. An optional health loop probes the upstream with `ping`
//! and drives supervised restart with exponential backoff.
//!
//! State machine:
//!
//! ```text
//! new → starting → running ⇄ unhealthy → restarting → running
//!                     │
//!                     └──→ stopping → stopped        (failed on spawn or
//!                                                     handshake errors)
//! ```

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ProxyConfig, ServerConfig};
use crate::error::ProxyError;
use crate::framing::{frame_pair, FrameReader, FrameWriter};
use crate::jsonrpc::{
    classify, error_response, notification_message, request_message, JsonRpcId, MessageKind,
    RpcError, UPSTREAM_TIMEOUT, UPSTREAM_TRANSPORT_ERROR,
};

/// Lifecycle state of an upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpstreamState {
    New = 0,
    Starting = 1,
    Running = 2,
    Unhealthy = 3,
    Restarting = 4,
    Stopping = 5,
    Stopped = 6,
    Failed = 7,
}

impl UpstreamState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => UpstreamState::Starting,
            2 => UpstreamState::Running,
            3 => UpstreamState::Unhealthy,
            4 => UpstreamState::Restarting,
            5 => UpstreamState::Stopping,
            6 => UpstreamState::Stopped,
            7 => UpstreamState::Failed,
            _ => UpstreamState::New,
        }
    }

    fn label(self) -> &'static str {
        match self {
            UpstreamState::New => "new",
            UpstreamState::Starting => "starting",
            UpstreamState::Running => "running",
            UpstreamState::Unhealthy => "unhealthy",
            UpstreamState::Restarting => "restarting",
            UpstreamState::Stopping => "stopping",
            UpstreamState::Stopped => "stopped",
            UpstreamState::Failed => "failed",
        }
    }
}

/// Traffic surfaced by an upstream's receive pump that is not a response to
/// one of our own requests. The router consumes these.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// The upstream initiated a request (for example `roots/list`).
    Request { server_id: String, message: Value },
    /// The upstream emitted a notification.
    Notification { server_id: String, message: Value },
    /// A response whose id matches no pending request.
    OrphanResponse { server_id: String, message: Value },
}

/// One live connection to the child process.
struct Conn {
    writer: Arc<FrameWriter>,
    child: Child,
    generation: u64,
    recv_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

/// Restart backoff starts here and doubles per failed attempt.
const RESTART_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Backoff ceiling for a persistently broken upstream.
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// One managed upstream MCP server.
pub struct UpstreamServer {
    config: ServerConfig,
    proxy: Arc<ProxyConfig>,
    events: mpsc::UnboundedSender<UpstreamEvent>,
    state: AtomicU8,
    conn: Mutex<Option<Conn>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Value>>>,
    next_id: AtomicI64,
    generation: AtomicU64,
    init_result: Mutex<Option<Value>>,
    last_init_params: Mutex<Option<Value>>,
    restart_lock: Mutex<()>,
    health_started: AtomicBool,
    shutdown_token: CancellationToken,
}

impl UpstreamServer {
    pub fn new(
        config: ServerConfig,
        proxy: Arc<ProxyConfig>,
        events: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            proxy,
            events,
            state: AtomicU8::new(UpstreamState::New as u8),
            conn: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(0),
            generation: AtomicU64::new(0),
            init_result: Mutex::new(None),
            last_init_params: Mutex::new(None),
            restart_lock: Mutex::new(()),
            health_started: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> UpstreamState {
        UpstreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the upstream has completed its handshake and can take traffic.
    pub fn is_running(&self) -> bool {
        self.state() == UpstreamState::Running
    }

    pub async fn init_result(&self) -> Option<Value> {
        self.init_result.lock().await.clone()
    }

    fn set_state(&self, state: UpstreamState) {
        self.state.store(state as u8, Ordering::Release);
        trace!(server_id = %self.config.id, state = state.label(), "upstream state");
    }

    /// Spawn the child process and wire up its stdio. Idempotent while a
    /// connection is live.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        let mut conn_guard = self.conn.lock().await;
        if conn_guard.is_some() {
            return Ok(());
        }
        self.set_state(UpstreamState::Starting);

        let spawn_err = |reason: String| ProxyError::Spawn {
            server_id: self.config.id.clone(),
            reason,
        };
        let program = self.config.command.first().ok_or_else(|| {
            self.set_state(UpstreamState::Failed);
            spawn_err("empty command".to_string())
        })?;

        let mut cmd = Command::new(program);
        cmd.args(&self.config.command[1..])
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            self.set_state(UpstreamState::Failed);
            spawn_err(e.to_string())
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_err("failed to capture stderr".to_string()))?;

        let pid = child.id();
        let (reader, writer) = frame_pair(stdout, stdin, &*self.config.id, self.config.stdio_mode);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let recv_task = tokio::spawn(self.clone().receive_pump(reader, generation));
        let stderr_task = tokio::spawn(stderr_pump(self.config.id.clone(), stderr));

        *conn_guard = Some(Conn {
            writer: Arc::new(writer),
            child,
            generation,
            recv_task,
            stderr_task,
        });
        drop(conn_guard);

        self.maybe_spawn_health_loop();
        info!(server_id = %self.config.id, pid = pid.unwrap_or(0), "upstream process spawned");
        Ok(())
    }

    /// Run the MCP initialize handshake, derived from the client's original
    /// `initialize` params. The result is cached for capability aggregation.
    pub async fn initialize(self: &Arc<Self>, client_params: &Value) -> Result<Value, RpcError> {
        if self.is_running() {
            if let Some(cached) = self.init_result().await {
                return Ok(cached);
            }
        }

        *self.last_init_params.lock().await = Some(client_params.clone());
        let payload = init_payload(client_params);

        match self
            .request_with_timeout("initialize", Some(payload), self.config.startup_timeout)
            .await
        {
            Ok(result) => {
                *self.init_result.lock().await = Some(result.clone());
                if let Err(e) = self.notify("notifications/initialized", None).await {
                    debug!(server_id = %self.config.id, error = %e, "initialized notification failed");
                }
                self.set_state(UpstreamState::Running);
                info!(server_id = %self.config.id, "upstream initialized");
                Ok(result)
            }
            Err(e) => {
                self.set_state(UpstreamState::Failed);
                warn!(server_id = %self.config.id, error = %e, "upstream initialize failed");
                Err(e)
            }
        }
    }

    /// Send a request and await its response, bounded by the configured
    /// response timeout. Upstream error objects are relayed verbatim.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.request_with_timeout(method, params, self.proxy.response_timeout)
            .await
    }

    async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, RpcError> {
        let writer = match self.writer().await {
            Some(writer) => writer,
            None => return Err(self.transport_error("not running")),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = request_message(id, method, params);
        if let Err(e) = writer.write_message(&message).await {
            self.pending.lock().await.remove(&id);
            return Err(self.transport_error(&e.to_string()));
        }

        let response = match tokio::time::timeout(deadline, rx).await {
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(RpcError::new(
                    UPSTREAM_TIMEOUT,
                    format!(
                        "upstream '{}' timed out on {} after {:.1}s",
                        self.config.id,
                        method,
                        deadline.as_secs_f64()
                    ),
                ));
            }
            // The pending entry was dropped without a response.
            Ok(Err(_)) => return Err(self.transport_error("connection lost")),
            Ok(Ok(response)) => response,
        };

        if let Some(error) = response.get("error") {
            return Err(RpcError::from_wire(error));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Send a notification (no id, no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProxyError> {
        self.send_raw(&notification_message(method, params)).await
    }

    /// Send a pre-built message, used for relayed client responses and
    /// broadcast notifications.
    pub async fn send_raw(&self, message: &Value) -> Result<(), ProxyError> {
        let writer = self.writer().await.ok_or_else(|| ProxyError::NotRunning {
            server_id: self.config.id.clone(),
        })?;
        writer
            .write_message(message)
            .await
            .map_err(|e| ProxyError::Transport {
                server_id: self.config.id.clone(),
                reason: e.to_string(),
            })
    }

    async fn writer(&self) -> Option<Arc<FrameWriter>> {
        self.conn.lock().await.as_ref().map(|c| c.writer.clone())
    }

    fn transport_error(&self, reason: &str) -> RpcError {
        RpcError::new(
            UPSTREAM_TRANSPORT_ERROR,
            format!("upstream '{}' transport error: {}", self.config.id, reason),
        )
    }

    /// Read loop for one connection. Responses complete pending waiters;
    /// everything else is handed to the router.
    async fn receive_pump(self: Arc<Self>, mut reader: FrameReader, generation: u64) {
        loop {
            match reader.read_message().await {
                Ok(Some(message)) => self.route_inbound(message).await,
                Ok(None) => {
                    debug!(server_id = %self.config.id, "upstream closed its stream");
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    warn!(server_id = %self.config.id, error = %e, "dropping malformed upstream frame");
                }
                Err(e) => {
                    warn!(server_id = %self.config.id, error = %e, "upstream stream error");
                    break;
                }
            }
        }
        self.on_disconnect(generation).await;
    }

    async fn route_inbound(&self, message: Value) {
        match classify(&message) {
            Ok(MessageKind::Response { id }) => {
                let waiter = match id {
                    JsonRpcId::Number(n) => self.pending.lock().await.remove(&n),
                    // We only ever allocate integer ids toward upstreams.
                    JsonRpcId::String(_) => None,
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => {
                        let _ = self.events.send(UpstreamEvent::OrphanResponse {
                            server_id: self.config.id.clone(),
                            message,
                        });
                    }
                }
            }
            Ok(MessageKind::Request { .. }) => {
                let _ = self.events.send(UpstreamEvent::Request {
                    server_id: self.config.id.clone(),
                    message,
                });
            }
            Ok(MessageKind::Notification { .. }) => {
                let _ = self.events.send(UpstreamEvent::Notification {
                    server_id: self.config.id.clone(),
                    message,
                });
            }
            Err(e) => {
                warn!(server_id = %self.config.id, error = %e, "unclassifiable message from upstream");
            }
        }
    }

    /// Tear down after the receive pump observed EOF or a stream error.
    ///
    /// Generation guards against a stale pump racing a restart that has
    /// already installed a fresh connection.
    async fn on_disconnect(self: Arc<Self>, generation: u64) {
        if self.shutdown_token.is_cancelled()
            || matches!(self.state(), UpstreamState::Stopping | UpstreamState::Stopped)
        {
            return;
        }

        let taken = {
            let mut guard = self.conn.lock().await;
            if guard.as_ref().is_some_and(|c| c.generation == generation) {
                guard.take()
            } else {
                None
            }
        };
        let Some(mut conn) = taken else { return };

        conn.stderr_task.abort();
        let _ = conn.child.start_kill();
        let _ = conn.child.wait().await;

        *self.init_result.lock().await = None;
        self.fail_pending(UPSTREAM_TRANSPORT_ERROR, "connection to upstream lost")
            .await;

        if self.proxy.healthcheck_interval.is_zero() {
            self.set_state(UpstreamState::Failed);
            warn!(server_id = %self.config.id, "upstream exited; restart supervision is disabled");
        } else {
            self.set_state(UpstreamState::Unhealthy);
            let server = self.clone();
            tokio::spawn(server.restart_with_backoff());
        }
    }

    /// Complete every in-flight request with a synthesized error response.
    async fn fail_pending(&self, code: i32, reason: &str) {
        let drained: Vec<(i64, oneshot::Sender<Value>)> =
            self.pending.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        warn!(
            server_id = %self.config.id,
            count = drained.len(),
            reason = reason,
            "failing in-flight upstream requests"
        );
        for (id, tx) in drained {
            let response = error_response(
                Some(&JsonRpcId::Number(id)),
                &RpcError::new(code, format!("upstream '{}': {}", self.config.id, reason)),
            );
            let _ = tx.send(response);
        }
    }

    fn maybe_spawn_health_loop(self: &Arc<Self>) {
        let interval = self.proxy.healthcheck_interval;
        if interval.is_zero() || self.health_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let probe_timeout = self.proxy.healthcheck_timeout;
        let server = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = server.shutdown_token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if server.state() != UpstreamState::Running {
                    continue;
                }
                match server.request_with_timeout("ping", None, probe_timeout).await {
                    Ok(_) => trace!(server_id = %server.config.id, "health probe ok"),
                    Err(e) => {
                        warn!(server_id = %server.config.id, error = %e, "health probe failed");
                        server.fail_pending(UPSTREAM_TRANSPORT_ERROR, "upstream unhealthy").await;
                        server.set_state(UpstreamState::Unhealthy);
                        server.drop_conn().await;
                        server.clone().restart_with_backoff().await;
                    }
                }
            }
        });
    }

    /// Drop the current connection without the graceful escalation, killing
    /// the child outright. Used when the upstream is already deemed dead.
    async fn drop_conn(&self) {
        let taken = self.conn.lock().await.take();
        if let Some(mut conn) = taken {
            conn.recv_task.abort();
            conn.stderr_task.abort();
            let _ = conn.child.start_kill();
            let _ = conn.child.wait().await;
        }
        *self.init_result.lock().await = None;
    }

    /// Respawn and re-initialize, doubling the delay between failed attempts
    /// up to the ceiling. Serialized so concurrent triggers coalesce.
    fn restart_with_backoff(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let Ok(_guard) = self.restart_lock.try_lock() else {
                return;
            };
            let params = self
                .last_init_params
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| json!({}));

            let mut backoff = RESTART_BACKOFF_INITIAL;
            loop {
                if self.shutdown_token.is_cancelled() {
                    return;
                }
                self.set_state(UpstreamState::Restarting);
                info!(server_id = %self.config.id, "attempting upstream restart");

                let outcome = match self.start().await {
                    Ok(()) => self.initialize(&params).await.map(|_| ()).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                match outcome {
                    Ok(()) => {
                        info!(server_id = %self.config.id, "upstream restarted");
                        return;
                    }
                    Err(reason) => {
                        warn!(
                            server_id = %self.config.id,
                            error = %reason,
                            retry_in_secs = backoff.as_secs(),
                            "restart attempt failed"
                        );
                        self.drop_conn().await;
                        tokio::select! {
                            _ = self.shutdown_token.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
                    }
                }
            }
        }
        .boxed()
    }

    /// Graceful shutdown: protocol-level `shutdown` request, then SIGTERM,
    /// then kill, each stage bounded by the configured grace period.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown_token.cancel();
        if self.state() == UpstreamState::Stopped {
            return;
        }
        self.set_state(UpstreamState::Stopping);

        let grace = self.config.shutdown_grace;
        if self.writer().await.is_some() {
            if let Err(e) = self.request_with_timeout("shutdown", None, grace).await {
                debug!(server_id = %self.config.id, error = %e, "graceful shutdown request failed");
            }
        }
        self.fail_pending(UPSTREAM_TRANSPORT_ERROR, "proxy shutting down")
            .await;

        let taken = self.conn.lock().await.take();
        if let Some(mut conn) = taken {
            conn.recv_task.abort();
            conn.stderr_task.abort();
            terminate_child(&self.config.id, &mut conn.child, grace).await;
        }
        *self.init_result.lock().await = None;
        self.set_state(UpstreamState::Stopped);
        info!(server_id = %self.config.id, "upstream stopped");
    }
}

/// Derive the upstream initialize payload from the client's params, renaming
/// the client so upstream logs can identify traffic that came through the
/// proxy.
fn init_payload(client_params: &Value) -> Value {
    let mut payload = if client_params.is_object() {
        client_params.clone()
    } else {
        json!({})
    };
    let client_info = payload.get("clientInfo").cloned().unwrap_or_else(|| json!({}));
    let name = client_info
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("mcp-client");
    let version = client_info
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or("0.0");
    payload["clientInfo"] = json!({
        "name": format!("{name}-through-proxy"),
        "version": version,
    });
    payload
}

/// Forward the child's stderr lines into the structured log.
async fn stderr_pump(server_id: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(server_id = %server_id, line = %line, "upstream stderr"),
            Ok(None) => break,
            Err(e) => {
                debug!(server_id = %server_id, error = %e, "stderr pump ended");
                break;
            }
        }
    }
}

async fn terminate_child(server_id: &str, child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(server_id = %server_id, error = ?e, "SIGTERM failed");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(
                server_id = %server_id,
                code = status.code().unwrap_or(-1),
                "upstream exited"
            );
            return;
        }
        Ok(Err(e)) => warn!(server_id = %server_id, error = %e, "wait on upstream failed"),
        Err(_) => warn!(server_id = %server_id, "upstream did not exit within grace; killing"),
    }

    if let Err(e) = child.kill().await {
        warn!(server_id = %server_id, error = %e, "kill failed");
    }
    let _ = child.wait().await;
}
