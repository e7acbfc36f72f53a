//! CLI entry point: load config, initialise tracing, bind the router to
//! process stdio.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 runtime fatal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use mcp_manifold::config::{load_config, ProxyConfig, StdioMode};
use mcp_manifold::framing::frame_pair;
use mcp_manifold::router::{Router, SetLevelHook};

/// Aggregating proxy for Model Context Protocol servers.
#[derive(Parser)]
#[command(name = "mcp-manifold", version)]
struct Cli {
    /// Path to the JSON config file describing upstream MCP servers.
    #[arg(long)]
    config: PathBuf,
}

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mcp-manifold: {e}");
            return 1;
        }
    };

    let reload_handle = init_tracing(&config);
    let set_level: SetLevelHook = {
        let handle = reload_handle.clone();
        Box::new(move |level| {
            if let Err(e) = handle.reload(filter_for_level(level)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        })
    };

    // Stdout carries JSON-RPC; all diagnostics go to stderr.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (client_reader, client_writer) = frame_pair(
        tokio::io::stdin(),
        tokio::io::stdout(),
        "client",
        StdioMode::Auto,
    );
    let router = Router::new(config, Arc::new(client_writer), events_tx, Some(set_level));

    match router.serve(client_reader, events_rx).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "proxy terminated");
            eprintln!("mcp-manifold: {e}");
            2
        }
    }
}

/// Install the stderr subscriber. `RUST_LOG` overrides the configured level;
/// `structured_logging` selects JSON lines over the human format. Returns
/// the handle the router uses to apply `logging/setLevel`.
fn init_tracing(config: &ProxyConfig) -> FilterHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_lowercase()));
    let (filter, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);

    if config.structured_logging {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    handle
}

/// Map an MCP log level onto a tracing filter.
fn filter_for_level(level: &str) -> EnvFilter {
    let directive = match level.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "notice" | "info" => "info",
        "warning" | "warn" => "warn",
        "critical" | "alert" | "emergency" | "error" => "error",
        other => return EnvFilter::new(other.to_string()),
    };
    EnvFilter::new(directive)
}
