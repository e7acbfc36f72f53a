//! Client-facing dispatcher.
//!
//! The router owns every upstream and the client's framed connection. One
//! read task feeds client messages into the serve loop; each request is
//! handled in its own task so a slow upstream cannot head-of-line-block the
//! client. Upstream-originated traffic arrives over an event channel from
//! the receive pumps and is remapped onto client-visible ids.
//!
//! Correlation state lives here and only here: the listing registries, and
//! the map from minted client ids back to `(upstream, original id)` for
//! requests that originate upstream.

pub mod capabilities;
pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{FramingError, ProxyError};
use crate::framing::{FrameReader, FrameWriter};
use crate::jsonrpc::{
    classify, error_response, notification_message, raw_id, result_response, JsonRpcId,
    MessageKind, RpcError, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
    PARSE_ERROR, RATE_LIMITED, UNAUTHORIZED,
};
use crate::security::{AuthGate, RateLimiter};
use crate::upstream::{UpstreamEvent, UpstreamServer};

use capabilities::aggregate_capabilities;
use registry::{
    decode_resource_uri, encode_resource_uri, paginate, proxy_name, split_proxy_name, Registry,
};

/// Name the proxy reports in its own `serverInfo`.
pub const PROXY_NAME: &str = "mcp-manifold";
pub const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fallback when the client's initialize does not carry a version.
const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// Hook invoked with the requested level when the client sends
/// `logging/setLevel`; wired to the subscriber reload handle by `main`.
pub type SetLevelHook = Box<dyn Fn(&str) + Send + Sync>;

/// An upstream-originated request in flight toward the client.
struct RelayedRequest {
    server_id: String,
    /// The id the upstream used, restored verbatim on the way back.
    upstream_id: Value,
}

#[derive(Clone, Copy)]
enum Listing {
    Tools,
    Resources,
    ResourceTemplates,
    Prompts,
}

impl Listing {
    fn method(self) -> &'static str {
        match self {
            Listing::Tools => "tools/list",
            Listing::Resources => "resources/list",
            Listing::ResourceTemplates => "resources/templates/list",
            Listing::Prompts => "prompts/list",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Listing::Tools => "tools",
            Listing::Resources => "resources",
            Listing::ResourceTemplates => "resourceTemplates",
            Listing::Prompts => "prompts",
        }
    }
}

#[derive(Clone, Copy)]
enum NamedCall {
    Tool,
    Prompt,
}

impl NamedCall {
    fn method(self) -> &'static str {
        match self {
            NamedCall::Tool => "tools/call",
            NamedCall::Prompt => "prompts/get",
        }
    }

    fn alt_name_key(self) -> &'static str {
        match self {
            NamedCall::Tool => "toolName",
            NamedCall::Prompt => "promptName",
        }
    }

    fn noun(self) -> &'static str {
        match self {
            NamedCall::Tool => "tool",
            NamedCall::Prompt => "prompt",
        }
    }
}

/// Orchestrates all traffic between the single MCP client and the
/// configured upstream servers. Lives for one client session.
pub struct Router {
    config: Arc<ProxyConfig>,
    client: Arc<FrameWriter>,
    servers: Vec<Arc<UpstreamServer>>,
    auth: AuthGate,
    limiter: Arc<RateLimiter>,
    tools: Mutex<Registry>,
    prompts: Mutex<Registry>,
    resources: Mutex<Registry>,
    relay: Mutex<HashMap<String, RelayedRequest>>,
    relay_seq: AtomicU64,
    initialized: AtomicBool,
    on_set_level: Option<SetLevelHook>,
    shutdown: CancellationToken,
    // Keeps the event channel open even while no upstream is running.
    _events_tx: mpsc::UnboundedSender<UpstreamEvent>,
}

impl Router {
    pub fn new(
        config: ProxyConfig,
        client: Arc<FrameWriter>,
        events_tx: mpsc::UnboundedSender<UpstreamEvent>,
        on_set_level: Option<SetLevelHook>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let servers = config
            .servers
            .iter()
            .cloned()
            .map(|server_config| {
                UpstreamServer::new(server_config, config.clone(), events_tx.clone())
            })
            .collect();

        let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));
        let shutdown = CancellationToken::new();
        limiter.spawn_sweep_task(shutdown.clone());

        Arc::new(Self {
            auth: AuthGate::new(config.auth_token.clone()),
            limiter,
            client,
            servers,
            tools: Mutex::new(Registry::default()),
            prompts: Mutex::new(Registry::default()),
            resources: Mutex::new(Registry::default()),
            relay: Mutex::new(HashMap::new()),
            relay_seq: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            on_set_level,
            shutdown,
            _events_tx: events_tx,
            config,
        })
    }

    /// Run the session: consume client frames and upstream events until the
    /// client disconnects, then shut every upstream down.
    pub async fn serve(
        self: Arc<Self>,
        client_reader: FrameReader,
        mut events: mpsc::UnboundedReceiver<UpstreamEvent>,
    ) -> Result<(), ProxyError> {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let read_task = tokio::spawn(client_read_loop(
            client_reader,
            self.client.clone(),
            client_tx,
        ));

        loop {
            tokio::select! {
                maybe_message = client_rx.recv() => match maybe_message {
                    Some(message) => self.clone().dispatch_client_message(message),
                    None => break,
                },
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.handle_upstream_event(event).await,
                    None => break,
                },
            }
        }

        info!("client connection closed; shutting down upstreams");
        self.shutdown.cancel();
        self.shutdown_all().await;

        match read_task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProxyError::ClientStream(e)),
            Err(e) => Err(ProxyError::ClientStream(FramingError::Io(
                std::io::Error::other(e.to_string()),
            ))),
        }
    }

    /// Classify one client message and hand it to a handler task.
    fn dispatch_client_message(self: Arc<Self>, message: Value) {
        match classify(&message) {
            Ok(MessageKind::Request { id, method }) => {
                tokio::spawn(async move {
                    self.handle_client_request(id, method, message).await;
                });
            }
            Ok(MessageKind::Response { id }) => {
                tokio::spawn(async move {
                    self.handle_client_response(&id, message).await;
                });
            }
            Ok(MessageKind::Notification { method }) => {
                tokio::spawn(async move {
                    self.handle_client_notification(&method, message).await;
                });
            }
            Err(e) => {
                if let Some(id) = raw_id(&message) {
                    tokio::spawn(async move {
                        let error = RpcError::new(
                            INVALID_REQUEST,
                            format!("Invalid JSON-RPC message: {e}"),
                        );
                        if let Err(write_err) =
                            self.client.write_message(&error_response(Some(&id), &error)).await
                        {
                            warn!(error = %write_err, "failed to write error response");
                        }
                    });
                } else {
                    debug!(error = %e, "ignoring unclassifiable client payload");
                }
            }
        }
    }

    async fn handle_client_request(self: Arc<Self>, id: JsonRpcId, method: String, mut message: Value) {
        let outcome = match self.gate(&mut message, true) {
            Err(e) => Err(e),
            Ok(()) => {
                let params = message
                    .get("params")
                    .filter(|p| p.is_object())
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                self.route_request(&method, &params).await
            }
        };

        let payload = match outcome {
            Ok(result) => result_response(&id, result),
            Err(e) => error_response(Some(&id), &e),
        };
        if let Err(e) = self.client.write_message(&payload).await {
            warn!(method = %method, error = %e, "failed to write response to client");
        }
    }

    async fn route_request(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => self.handle_initialize(params).await,
            "ping" => Ok(json!({})),
            "shutdown" => {
                self.shutdown_all().await;
                Ok(json!({}))
            }
            "logging/setLevel" => self.handle_set_level(params).await,
            "tools/list" => self.handle_list(Listing::Tools, params).await,
            "resources/list" => self.handle_list(Listing::Resources, params).await,
            "resources/templates/list" => {
                self.handle_list(Listing::ResourceTemplates, params).await
            }
            "prompts/list" => self.handle_list(Listing::Prompts, params).await,
            "tools/call" => self.handle_named_call(NamedCall::Tool, params).await,
            "prompts/get" => self.handle_named_call(NamedCall::Prompt, params).await,
            "resources/read" => self.handle_resources_read(params).await,
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Method {other} is not supported by {PROXY_NAME}"),
            )),
        }
    }

    /// Auth and rate-limit gate. Strips the presented token before anything
    /// is forwarded upstream. Notifications skip the rate limit.
    fn gate(&self, message: &mut Value, enforce_rate_limit: bool) -> Result<(), RpcError> {
        let token = message
            .get("params")
            .and_then(|p| p.get("proxy"))
            .and_then(|p| p.get("authToken"))
            .and_then(Value::as_str)
            .map(String::from);

        if !self.auth.validate(token.as_deref()) {
            return Err(RpcError::new(UNAUTHORIZED, "Unauthorized"));
        }
        if enforce_rate_limit {
            let key = token.as_deref().unwrap_or("anonymous");
            if !self.limiter.allow(key) {
                return Err(RpcError::new(RATE_LIMITED, "Rate limit exceeded"));
            }
        }

        if let Some(proxy) = message
            .get_mut("params")
            .and_then(|p| p.get_mut("proxy"))
            .and_then(Value::as_object_mut)
        {
            proxy.remove("authToken");
        }
        Ok(())
    }

    /// Fan the client's initialize out to every configured upstream. A
    /// failed upstream is logged and left in its failed state; the session
    /// succeeds as long as at least one handshake completes.
    async fn handle_initialize(&self, params: &Value) -> Result<Value, RpcError> {
        let startups = self.servers.iter().map(|server| {
            let server = server.clone();
            let params = params.clone();
            async move {
                let outcome = match server.start().await {
                    Ok(()) => server.initialize(&params).await.map(|_| ()),
                    Err(e) => Err(e.to_rpc()),
                };
                (server, outcome)
            }
        });

        let mut healthy = 0usize;
        for (server, outcome) in join_all(startups).await {
            match outcome {
                Ok(()) => healthy += 1,
                Err(e) => {
                    warn!(server_id = %server.id(), error = %e, "upstream failed to initialize");
                }
            }
        }
        if healthy == 0 {
            return Err(RpcError::new(
                INTERNAL_ERROR,
                "No upstream server completed initialization",
            ));
        }
        self.initialized.store(true, Ordering::Release);

        let mut cached = Vec::new();
        for server in &self.servers {
            if let Some(result) = server.init_result().await {
                cached.push(result);
            }
        }
        let capabilities = aggregate_capabilities(cached.iter());
        let protocol_version = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);

        Ok(json!({
            "serverInfo": {"name": PROXY_NAME, "version": PROXY_VERSION},
            "capabilities": capabilities,
            "protocolVersion": protocol_version,
        }))
    }

    /// Aggregate one listing across all running upstreams, rewrite the
    /// exposed identifiers, rebuild the registries and apply pagination.
    /// Individual upstream failures degrade to partial results.
    async fn handle_list(&self, listing: Listing, params: &Value) -> Result<Value, RpcError> {
        let method = listing.method();
        let calls = self
            .servers
            .iter()
            .filter(|server| server.is_running())
            .map(|server| {
                let server = server.clone();
                let params = params.clone();
                async move {
                    let result = server.request(method, Some(params)).await;
                    (server, result)
                }
            });

        let mut aggregated: Vec<Value> = Vec::new();
        for (server, result) in join_all(calls).await {
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        server_id = %server.id(),
                        method = method,
                        error = %e,
                        "listing failed; omitting upstream from result"
                    );
                    continue;
                }
            };
            let items = extract_items(&result, listing.key());
            match listing {
                Listing::Tools => {
                    let mut registry = self.tools.lock().await;
                    self.wrap_named_items(&mut registry, server.id(), items, &mut aggregated);
                }
                Listing::Prompts => {
                    let mut registry = self.prompts.lock().await;
                    self.wrap_named_items(&mut registry, server.id(), items, &mut aggregated);
                }
                Listing::Resources => {
                    let mut registry = self.resources.lock().await;
                    registry.clear_server(server.id());
                    for mut item in items {
                        let Some(original) =
                            item.get("uri").and_then(Value::as_str).map(String::from)
                        else {
                            warn!(server_id = %server.id(), "skipping resource without a uri");
                            continue;
                        };
                        let exposed = encode_resource_uri(server.id(), &original);
                        item["uri"] = json!(exposed.clone());
                        attach_proxy_metadata(
                            &mut item,
                            json!({"serverId": server.id(), "originalUri": original.clone()}),
                        );
                        registry.insert(exposed, server.id().to_string(), original);
                        aggregated.push(item);
                    }
                }
                Listing::ResourceTemplates => {
                    // Templates are URI patterns; they are tagged with their
                    // origin but carry no rewrite.
                    for mut item in items {
                        attach_proxy_metadata(&mut item, json!({"serverId": server.id()}));
                        aggregated.push(item);
                    }
                }
            }
        }

        let (page, next_cursor) = paginate(aggregated, params)?;
        let mut result = Map::new();
        result.insert(listing.key().to_string(), Value::Array(page));
        if let Some(next) = next_cursor {
            result.insert("nextCursor".to_string(), json!(next));
        }
        Ok(Value::Object(result))
    }

    /// Namespace tool/prompt descriptors and rebuild one upstream's registry
    /// slice.
    fn wrap_named_items(
        &self,
        registry: &mut Registry,
        server_id: &str,
        items: Vec<Value>,
        aggregated: &mut Vec<Value>,
    ) {
        registry.clear_server(server_id);
        for mut item in items {
            let Some(original) = item.get("name").and_then(Value::as_str).map(String::from)
            else {
                warn!(server_id = %server_id, "skipping descriptor without a name");
                continue;
            };
            let exposed = proxy_name(&self.config.tool_separator, server_id, &original);
            item["name"] = json!(exposed.clone());
            attach_proxy_metadata(
                &mut item,
                json!({"serverId": server_id, "originalName": original.clone()}),
            );
            registry.insert(exposed, server_id.to_string(), original);
            aggregated.push(item);
        }
    }

    /// Route `tools/call` / `prompts/get` by namespaced name. The registry
    /// is authoritative; a separator split is accepted as a fallback for
    /// names learned out of band.
    async fn handle_named_call(&self, call: NamedCall, params: &Value) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .or_else(|| params.get(call.alt_name_key()))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RpcError::new(
                    INVALID_PARAMS,
                    format!("{} requires a {} name", call.method(), call.noun()),
                )
            })?;

        let registry = match call {
            NamedCall::Tool => &self.tools,
            NamedCall::Prompt => &self.prompts,
        };
        let resolved = registry.lock().await.resolve(name);
        let (server_id, original) = match resolved {
            Some(entry) => (entry.server_id, entry.original),
            None => match split_proxy_name(&self.config.tool_separator, name) {
                Some((server_id, original)) => (server_id.to_string(), original.to_string()),
                None => {
                    return Err(RpcError::new(
                        INVALID_PARAMS,
                        format!("Unknown {} {}", call.noun(), name),
                    ));
                }
            },
        };
        let server = self.server_by_id(&server_id).ok_or_else(|| {
            RpcError::new(
                INVALID_PARAMS,
                format!("Unknown {} namespace {}", call.noun(), server_id),
            )
        })?;

        let mut forward = params.clone();
        forward["name"] = json!(original);
        server.request(call.method(), Some(forward)).await
    }

    /// Route `resources/read` by decoding the namespaced URI, falling back
    /// to the registry for URIs the codec does not recognize.
    async fn handle_resources_read(&self, params: &Value) -> Result<Value, RpcError> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, "resources/read requires a uri"))?;

        let (server_id, original) = match decode_resource_uri(uri) {
            Some(route) => route,
            None => match self.resources.lock().await.resolve(uri) {
                Some(entry) => (entry.server_id, entry.original),
                None => {
                    return Err(RpcError::new(
                        INVALID_PARAMS,
                        format!("Unknown resource uri {uri}"),
                    ));
                }
            },
        };
        let server = self.server_by_id(&server_id).ok_or_else(|| {
            RpcError::new(
                INVALID_PARAMS,
                format!("Resource belongs to unknown server {server_id}"),
            )
        })?;

        let mut forward = params.clone();
        forward["uri"] = json!(original);
        server.request("resources/read", Some(forward)).await
    }

    /// Apply the level locally through the reload hook and broadcast to all
    /// running upstreams so their verbosity follows.
    async fn handle_set_level(&self, params: &Value) -> Result<Value, RpcError> {
        let level = params
            .get("level")
            .or_else(|| params.get("logLevel"))
            .and_then(Value::as_str);
        if let Some(level) = level {
            if let Some(hook) = &self.on_set_level {
                hook(level);
            }
            info!(level = %level, "log level updated by client");
        }

        let broadcasts = self
            .servers
            .iter()
            .filter(|server| server.is_running())
            .map(|server| {
                let server = server.clone();
                let params = params.clone();
                async move {
                    if let Err(e) = server.request("logging/setLevel", Some(params)).await {
                        debug!(server_id = %server.id(), error = %e, "logging/setLevel rejected upstream");
                    }
                }
            });
        join_all(broadcasts).await;
        Ok(json!({}))
    }

    /// Broadcast a client notification to every running upstream. Auth still
    /// applies, but there is no id to answer on, so failures only log.
    async fn handle_client_notification(&self, method: &str, mut message: Value) {
        if let Err(e) = self.gate(&mut message, false) {
            warn!(method = %method, error = %e, "dropping unauthorized client notification");
            return;
        }
        let payload = notification_message(method, message.get("params").cloned());
        let sends = self
            .servers
            .iter()
            .filter(|server| server.is_running())
            .map(|server| {
                let server = server.clone();
                let payload = payload.clone();
                async move {
                    if let Err(e) = server.send_raw(&payload).await {
                        debug!(server_id = %server.id(), error = %e, "notification broadcast failed");
                    }
                }
            });
        join_all(sends).await;
    }

    /// Route a client response back to the upstream that asked, restoring
    /// the upstream's original request id.
    async fn handle_client_response(&self, id: &JsonRpcId, message: Value) {
        let key = id.to_string();
        let route = self.relay.lock().await.remove(&key);
        let Some(route) = route else {
            debug!(id = %id, "client response for unknown request id");
            return;
        };
        let Some(server) = self.server_by_id(&route.server_id) else {
            warn!(server_id = %route.server_id, "upstream no longer registered for response routing");
            return;
        };

        let mut outbound = message;
        outbound["id"] = route.upstream_id;
        if let Err(e) = server.send_raw(&outbound).await {
            warn!(server_id = %server.id(), error = %e, "failed to relay client response upstream");
        }
    }

    async fn handle_upstream_event(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Request { server_id, message } => {
                self.forward_upstream_request(&server_id, message).await;
            }
            UpstreamEvent::Notification { server_id, message } => {
                self.forward_upstream_notification(&server_id, message).await;
            }
            UpstreamEvent::OrphanResponse { server_id, message } => {
                warn!(
                    server_id = %server_id,
                    id = %message.get("id").cloned().unwrap_or(serde_json::Value::Null),
                    "dropping upstream response with unknown id"
                );
            }
        }
    }

    /// Remap an upstream-originated request onto a client-visible id and
    /// forward it, tagging the origin so the client knows which upstream is
    /// asking.
    async fn forward_upstream_request(&self, server_id: &str, message: Value) {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(upstream_id) = message.get("id").cloned() else {
            return;
        };

        if !self.initialized.load(Ordering::Acquire) && method == "roots/list" {
            // The client cannot take requests before its own initialize has
            // completed; answer with an empty root set instead of stalling
            // the upstream's handshake.
            debug!(server_id = %server_id, "answering pre-initialize roots/list with an empty result");
            if let Some(server) = self.server_by_id(server_id) {
                let reply = json!({"jsonrpc": "2.0", "id": upstream_id, "result": {"roots": []}});
                if let Err(e) = server.send_raw(&reply).await {
                    debug!(server_id = %server_id, error = %e, "failed to answer roots/list");
                }
            }
            return;
        }

        let seq = self.relay_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let client_id = format!("{server_id}:{seq}");
        self.relay.lock().await.insert(
            client_id.clone(),
            RelayedRequest {
                server_id: server_id.to_string(),
                upstream_id,
            },
        );

        let mut payload = message;
        payload["id"] = json!(client_id);
        tag_origin(&mut payload, server_id);
        debug!(
            server_id = %server_id,
            method = %method,
            client_id = %payload["id"],
            "forwarding upstream request to client"
        );
        if let Err(e) = self.client.write_message(&payload).await {
            warn!(server_id = %server_id, error = %e, "failed to forward upstream request");
            if let Some(id) = payload["id"].as_str() {
                self.relay.lock().await.remove(id);
            }
        }
    }

    async fn forward_upstream_notification(&self, server_id: &str, message: Value) {
        let mut payload = message;
        tag_origin(&mut payload, server_id);
        if let Err(e) = self.client.write_message(&payload).await {
            warn!(server_id = %server_id, error = %e, "failed to forward upstream notification");
        }
    }

    async fn shutdown_all(&self) {
        join_all(self.servers.iter().map(|server| server.shutdown())).await;
    }

    fn server_by_id(&self, server_id: &str) -> Option<Arc<UpstreamServer>> {
        self.servers
            .iter()
            .find(|server| server.id() == server_id)
            .cloned()
    }
}

/// Pump the client stream into the serve loop. Recoverable frame errors get
/// a parse-error reply and the stream continues; EOF and IO errors end the
/// session.
async fn client_read_loop(
    mut reader: FrameReader,
    writer: Arc<FrameWriter>,
    tx: mpsc::UnboundedSender<Value>,
) -> Result<(), FramingError> {
    loop {
        match reader.read_message().await {
            Ok(Some(message)) => {
                if tx.send(message).is_err() {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "malformed client frame");
                let reply =
                    error_response(None, &RpcError::new(PARSE_ERROR, format!("Parse error: {e}")));
                if writer.write_message(&reply).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Pick list items out of an upstream result, tolerating the common shapes:
/// the canonical key, a `data` array, or a bare array.
fn extract_items(result: &Value, key: &str) -> Vec<Value> {
    if let Some(items) = result.get(key).and_then(Value::as_array) {
        return items.clone();
    }
    if let Some(items) = result.get("data").and_then(Value::as_array) {
        return items.clone();
    }
    if let Some(items) = result.as_array() {
        return items.clone();
    }
    Vec::new()
}

/// Attach `metadata.proxy` to a descriptor, creating the metadata object if
/// the upstream did not send one.
fn attach_proxy_metadata(item: &mut Value, proxy: Value) {
    let Some(obj) = item.as_object_mut() else {
        return;
    };
    let metadata = obj.entry("metadata").or_insert_with(|| json!({}));
    if !metadata.is_object() {
        *metadata = json!({});
    }
    if let Some(metadata) = metadata.as_object_mut() {
        metadata.insert("proxy".to_string(), proxy);
    }
}

/// Record the originating upstream in `params.proxy.server`.
fn tag_origin(message: &mut Value, server_id: &str) {
    let Some(obj) = message.as_object_mut() else {
        return;
    };
    let params = obj.entry("params").or_insert_with(|| json!({}));
    if !params.is_object() {
        *params = json!({});
    }
    let Some(params) = params.as_object_mut() else {
        return;
    };
    let proxy = params.entry("proxy").or_insert_with(|| json!({}));
    if !proxy.is_object() {
        *proxy = json!({});
    }
    if let Some(proxy) = proxy.as_object_mut() {
        proxy.insert("server".to_string(), json!(server_id));
    }
}
