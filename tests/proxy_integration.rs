//! End-to-end tests: a real `Router` with spawned `mock_upstream` child
//! processes, driven over an in-memory client stream speaking newline JSON.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;

use mcp_manifold::config::{ProxyConfig, ServerConfig, StdioMode};
use mcp_manifold::framing::frame_pair;
use mcp_manifold::router::registry::{encode_cursor, encode_resource_uri};
use mcp_manifold::router::Router;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

struct TestClient {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl TestClient {
    async fn send(&mut self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("client write failed");
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        loop {
            line.clear();
            let n = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for proxy output")
                .expect("client read failed");
            assert!(n > 0, "proxy closed the client stream unexpectedly");
            if !line.trim().is_empty() {
                return serde_json::from_str(line.trim()).expect("proxy wrote invalid JSON");
            }
        }
    }

    /// Read frames until one matches, skipping unrelated interleaved
    /// traffic (request/response ordering across tasks is not guaranteed).
    async fn recv_until(&mut self, mut pred: impl FnMut(&Value) -> bool) -> Value {
        for _ in 0..16 {
            let message = self.recv().await;
            if pred(&message) {
                return message;
            }
        }
        panic!("expected frame not observed within 16 messages");
    }

    /// Lockstep request helper: send, then wait for the response to that id.
    async fn call(&mut self, id: i64, method: &str, params: Value) -> Value {
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        self.recv_until(|m| m.get("id") == Some(&json!(id))).await
    }
}

fn mock_server(id: &str, env: &[(&str, &str)]) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        command: vec![env!("CARGO_BIN_EXE_mock_upstream").to_string()],
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        startup_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(1),
        stdio_mode: StdioMode::Newline,
    }
}

fn proxy_config(servers: Vec<ServerConfig>) -> ProxyConfig {
    ProxyConfig {
        servers,
        response_timeout: Duration::from_secs(5),
        ..ProxyConfig::default()
    }
}

async fn start_proxy(config: ProxyConfig) -> TestClient {
    let (client_side, proxy_side) = tokio::io::duplex(256 * 1024);
    let (proxy_read, proxy_write) = split(proxy_side);
    let (reader, writer) = frame_pair(proxy_read, proxy_write, "client", StdioMode::Auto);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let router = Router::new(config, Arc::new(writer), events_tx, None);
    tokio::spawn(router.serve(reader, events_rx));

    let (client_read, client_write) = split(client_side);
    TestClient {
        reader: BufReader::new(client_read),
        writer: client_write,
    }
}

fn initialize_params() -> Value {
    json!({
        "protocolVersion": "2025-06-18",
        "capabilities": {"roots": {}},
        "clientInfo": {"name": "test-client", "version": "1.0"}
    })
}

#[tokio::test]
async fn test_initialize_and_namespaced_tool_call() {
    let mut client = start_proxy(proxy_config(vec![mock_server("echo", &[])])).await;

    let response = client.call(1, "initialize", initialize_params()).await;
    let result = &response["result"];
    assert_eq!(result["serverInfo"]["name"], json!("mcp-manifold"));
    assert_eq!(result["protocolVersion"], json!("2025-06-18"));
    assert!(result["capabilities"]["tools"].is_object());
    assert_eq!(result["capabilities"]["logging"]["setLevel"], json!(true));

    let response = client.call(2, "tools/list", json!({})).await;
    let tools = response["result"]["tools"].as_array().expect("tools array");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], json!("echo::say"));
    assert_eq!(tools[0]["metadata"]["proxy"]["serverId"], json!("echo"));
    assert_eq!(tools[0]["metadata"]["proxy"]["originalName"], json!("say"));
    assert!(response["result"].get("nextCursor").is_none());

    let response = client
        .call(
            3,
            "tools/call",
            json!({"name": "echo::say", "arguments": {"msg": "hi"}}),
        )
        .await;
    // The upstream saw the original name and untouched arguments.
    assert_eq!(response["result"]["echo"]["name"], json!("say"));
    assert_eq!(response["result"]["echo"]["arguments"]["msg"], json!("hi"));

    let response = client
        .call(4, "logging/setLevel", json!({"level": "debug"}))
        .await;
    assert!(response["result"].is_object());

    let response = client.call(5, "ping", json!({})).await;
    assert_eq!(response["result"], json!({}));
}

#[tokio::test]
async fn test_cross_upstream_aggregation_with_cursor() {
    let config = proxy_config(vec![
        mock_server("a", &[("MOCK_TOOLS", "t1,t2")]),
        mock_server("b", &[("MOCK_TOOLS", "t3")]),
    ]);
    let mut client = start_proxy(config).await;
    client.call(1, "initialize", initialize_params()).await;

    let response = client.call(2, "tools/list", json!({"limit": 2})).await;
    let tools = response["result"]["tools"].as_array().expect("tools array");
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert_eq!(names, vec!["a::t1", "a::t2"]);
    assert_eq!(
        response["result"]["nextCursor"],
        json!(encode_cursor(2)),
    );

    let cursor = response["result"]["nextCursor"].as_str().expect("cursor").to_string();
    let response = client.call(3, "tools/list", json!({"cursor": cursor})).await;
    let tools = response["result"]["tools"].as_array().expect("tools array");
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert_eq!(names, vec!["b::t3"]);
    assert!(response["result"].get("nextCursor").is_none());
}

#[tokio::test]
async fn test_resource_read_with_encoded_uri() {
    let config = proxy_config(vec![mock_server(
        "fs",
        &[("MOCK_RESOURCE_URI", "file:///etc/hosts")],
    )]);
    let mut client = start_proxy(config).await;
    client.call(1, "initialize", initialize_params()).await;

    let response = client.call(2, "resources/list", json!({})).await;
    let resources = response["result"]["resources"].as_array().expect("resources");
    let exposed = resources[0]["uri"].as_str().expect("uri").to_string();
    assert_eq!(exposed, encode_resource_uri("fs", "file:///etc/hosts"));
    assert_eq!(
        resources[0]["metadata"]["proxy"]["originalUri"],
        json!("file:///etc/hosts")
    );

    let response = client.call(3, "resources/read", json!({"uri": exposed})).await;
    assert_eq!(
        response["result"]["contents"][0]["uri"],
        json!("file:///etc/hosts")
    );
}

#[tokio::test]
async fn test_upstream_originated_request_round_trip() {
    let config = proxy_config(vec![mock_server("x", &[("MOCK_TOOLS", "trigger_roots")])]);
    let mut client = start_proxy(config).await;
    client.call(1, "initialize", initialize_params()).await;

    client
        .send(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "x::trigger_roots"}
        }))
        .await;

    // The upstream's own request arrives with a minted id and its origin.
    let request = client
        .recv_until(|m| m.get("method") == Some(&json!("roots/list")))
        .await;
    assert_eq!(request["id"], json!("x:1"));
    assert_eq!(request["params"]["proxy"]["server"], json!("x"));

    client
        .send(json!({"jsonrpc": "2.0", "id": "x:1", "result": {"roots": []}}))
        .await;

    // The upstream got the response under its original id and acknowledged.
    let ack = client
        .recv_until(|m| m.get("method") == Some(&json!("mock/rootsAck")))
        .await;
    assert_eq!(ack["params"]["count"], json!(0));
    assert_eq!(ack["params"]["proxy"]["server"], json!("x"));
}

#[tokio::test]
async fn test_unknown_client_notification_is_broadcast() {
    let mut client = start_proxy(proxy_config(vec![mock_server("n", &[])])).await;
    client.call(1, "initialize", initialize_params()).await;

    client
        .send(json!({"jsonrpc": "2.0", "method": "custom/thing", "params": {"x": 1}}))
        .await;

    let seen = client
        .recv_until(|m| m.get("method") == Some(&json!("mock/sawNotification")))
        .await;
    assert_eq!(seen["params"]["method"], json!("custom/thing"));
    assert_eq!(seen["params"]["proxy"]["server"], json!("n"));
}

#[tokio::test]
async fn test_unknown_method_rejected() {
    let mut client = start_proxy(proxy_config(vec![mock_server("echo", &[])])).await;
    let response = client.call(1, "bogus/method", json!({})).await;
    assert_eq!(response["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn test_malformed_cursor_rejected() {
    let mut client = start_proxy(proxy_config(vec![mock_server("echo", &[])])).await;
    client.call(1, "initialize", initialize_params()).await;
    let response = client.call(2, "tools/list", json!({"cursor": "###"})).await;
    assert_eq!(response["error"]["code"], json!(-32602));
}

#[tokio::test]
async fn test_auth_and_rate_limit_gate() {
    let mut config = proxy_config(vec![mock_server("echo", &[])]);
    config.auth_token = Some("t".to_string());
    config.rate_limit_per_minute = Some(2);
    let mut client = start_proxy(config).await;

    // Missing token is rejected before any rate accounting.
    let response = client.call(1, "ping", json!({})).await;
    assert_eq!(response["error"]["code"], json!(-32001));

    let authed = json!({"proxy": {"authToken": "t"}});
    let response = client.call(2, "ping", authed.clone()).await;
    assert_eq!(response["result"], json!({}));
    let response = client.call(3, "ping", authed.clone()).await;
    assert_eq!(response["result"], json!({}));

    // Third authorized request in the same minute exceeds the quota.
    let response = client.call(4, "ping", authed).await;
    assert_eq!(response["error"]["code"], json!(-32002));
}

#[tokio::test]
async fn test_crash_fails_pending_and_restart_recovers() {
    let mut config = proxy_config(vec![mock_server("echo", &[("MOCK_TOOLS", "say,die")])]);
    config.healthcheck_interval = Duration::from_millis(500);
    config.healthcheck_timeout = Duration::from_secs(2);
    let mut client = start_proxy(config).await;
    client.call(1, "initialize", initialize_params()).await;

    // The upstream dies without answering; the in-flight call fails with a
    // transport error rather than hanging.
    let response = client
        .call(2, "tools/call", json!({"name": "echo::die"}))
        .await;
    assert_eq!(response["error"]["code"], json!(-32010));

    // Supervised restart brings a fresh child up; listing works again.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let response = client.call(3, "tools/list", json!({})).await;
    let tools = response["result"]["tools"].as_array().expect("tools array");
    assert!(tools.iter().any(|t| t["name"] == json!("echo::say")));
}

#[tokio::test]
async fn test_client_shutdown_request() {
    let mut client = start_proxy(proxy_config(vec![mock_server("echo", &[])])).await;
    client.call(1, "initialize", initialize_params()).await;

    let response = client.call(2, "shutdown", json!({})).await;
    assert_eq!(response["result"], json!({}));

    // With every upstream stopped, listings degrade to empty results.
    let response = client.call(3, "tools/list", json!({})).await;
    assert_eq!(response["result"]["tools"], json!([]));
}
