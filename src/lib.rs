//! mcp-manifold: an aggregating stdio proxy for the Model Context Protocol.
//!
//! To a single MCP client this process looks like one MCP server. Underneath
//! it spawns the configured upstream MCP servers as child processes, speaks
//! JSON-RPC 2.0 to each over stdio, and merges their tools, resources and
//! prompts into one namespaced view.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐      ┌──────────────────────────────┐      ┌────────────┐
//! │ MCP Client │─────▶│         mcp-manifold         │─────▶│ upstream a │
//! │  (stdio)   │◀─────│ framing · router · lifecycle │◀─────│ upstream b │
//! └────────────┘      └──────────────────────────────┘      └────────────┘
//! ```
//!
//! - [`framing`] reads and writes JSON-RPC frames over byte streams, with
//!   autodetection between `Content-Length` headers and newline-delimited
//!   JSON.
//! - [`upstream`] owns one child process per configured server: spawn,
//!   initialize handshake, request correlation, stderr forwarding, health
//!   probing and supervised restart.
//! - [`router`] is the client-facing dispatcher: capability aggregation,
//!   namespaced registries, cursor pagination, bidirectional id remapping
//!   and the auth/rate-limit gate.

pub mod config;
pub mod error;
pub mod framing;
pub mod jsonrpc;
pub mod router;
pub mod security;
pub mod upstream;
