//! Minimal newline-framed MCP server used by the integration tests.
//!
//! Behavior switches via environment variables:
//! - `MOCK_SERVER_NAME`: reported `serverInfo.name` (default `mock-upstream`)
//! - `MOCK_TOOLS`: comma-separated tool names (default `say`)
//! - `MOCK_RESOURCE_URI`: the single advertised resource URI
//!
//! Two tool names are special: calling `trigger_roots` makes the server
//! issue a `roots/list` request of its own (acknowledged later with a
//! `mock/rootsAck` notification), and calling `die` makes the process exit
//! without responding.

use std::io::{BufRead, Write};

use serde_json::{json, Value};

const ROOTS_REQUEST_ID: i64 = 7;

fn main() {
    let name = std::env::var("MOCK_SERVER_NAME").unwrap_or_else(|_| "mock-upstream".to_string());
    let tools: Vec<String> = std::env::var("MOCK_TOOLS")
        .unwrap_or_else(|_| "say".to_string())
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    let resource_uri = std::env::var("MOCK_RESOURCE_URI")
        .unwrap_or_else(|_| "file:///etc/hosts".to_string());

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str);
        let id = message.get("id").cloned();

        match (method, id) {
            (Some("initialize"), Some(id)) => {
                respond(
                    &id,
                    json!({
                        "protocolVersion": message["params"]["protocolVersion"].clone(),
                        "capabilities": {
                            "tools": {"listChanged": false},
                            "resources": {"subscribe": false},
                            "prompts": {}
                        },
                        "serverInfo": {"name": name, "version": "0.1.0"}
                    }),
                );
            }
            (Some("tools/list"), Some(id)) => {
                let list: Vec<Value> = tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t,
                            "description": format!("mock tool {t}"),
                            "inputSchema": {"type": "object"}
                        })
                    })
                    .collect();
                respond(&id, json!({"tools": list}));
            }
            (Some("tools/call"), Some(id)) => {
                let tool = message["params"]["name"].as_str().unwrap_or_default();
                if tool == "die" {
                    std::process::exit(3);
                }
                if tool == "trigger_roots" {
                    send(json!({
                        "jsonrpc": "2.0",
                        "id": ROOTS_REQUEST_ID,
                        "method": "roots/list"
                    }));
                }
                respond(
                    &id,
                    json!({
                        "content": [{"type": "text", "text": "ok"}],
                        "echo": {
                            "name": tool,
                            "arguments": message["params"]["arguments"].clone()
                        }
                    }),
                );
            }
            (Some("resources/list"), Some(id)) => {
                respond(
                    &id,
                    json!({"resources": [{"uri": resource_uri, "name": "mock resource"}]}),
                );
            }
            (Some("resources/read"), Some(id)) => {
                respond(
                    &id,
                    json!({"contents": [{
                        "uri": message["params"]["uri"].clone(),
                        "text": "mock contents"
                    }]}),
                );
            }
            (Some("prompts/list"), Some(id)) => {
                respond(
                    &id,
                    json!({"prompts": [{"name": "greet", "description": "mock prompt"}]}),
                );
            }
            (Some("prompts/get"), Some(id)) => {
                respond(
                    &id,
                    json!({
                        "messages": [{"role": "user", "content": {"type": "text", "text": "hello"}}],
                        "echo": {"name": message["params"]["name"].clone()}
                    }),
                );
            }
            (Some("ping"), Some(id)) | (Some("logging/setLevel"), Some(id)) => {
                respond(&id, json!({}));
            }
            (Some("shutdown"), Some(id)) => {
                respond(&id, json!({}));
                std::process::exit(0);
            }
            (Some(_), Some(id)) => {
                send(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "Method not found"}
                }));
            }
            (Some("notifications/initialized"), None) => {}
            (Some(method), None) => {
                // Surface broadcast notifications so tests can observe them.
                send(json!({
                    "jsonrpc": "2.0",
                    "method": "mock/sawNotification",
                    "params": {"method": method}
                }));
            }
            (None, Some(id)) => {
                // A response to our own roots/list request.
                if id.as_i64() == Some(ROOTS_REQUEST_ID) {
                    let count = message["result"]["roots"]
                        .as_array()
                        .map(Vec::len)
                        .unwrap_or(0);
                    send(json!({
                        "jsonrpc": "2.0",
                        "method": "mock/rootsAck",
                        "params": {"count": count}
                    }));
                }
            }
            (None, None) => {}
        }
    }
}

fn respond(id: &Value, result: Value) {
    send(json!({"jsonrpc": "2.0", "id": id.clone(), "result": result}));
}

fn send(message: Value) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{message}");
    let _ = out.flush();
}
