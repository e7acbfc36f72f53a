//! Error types for the framing layer and the proxy runtime.
//!
//! `FramingError` covers wire-level failures while decoding or encoding a
//! single frame. `ProxyError` covers lifecycle and routing failures. Both
//! map onto JSON-RPC error codes where a client-visible reply is needed.

use crate::jsonrpc::{RpcError, INTERNAL_ERROR, UPSTREAM_TIMEOUT, UPSTREAM_TRANSPORT_ERROR};

/// Errors that can occur while reading or writing a single JSON-RPC frame.
///
/// A malformed frame does not close the stream; the reader stays positioned
/// at the next frame boundary. IO errors are terminal.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A frame body or line exceeds the per-message size bound.
    ///
    /// Checked before JSON parsing so crafted input cannot force allocation
    /// of oversized value trees.
    #[error("message exceeds maximum size of {max_bytes} bytes")]
    MessageTooLarge {
        /// The configured maximum frame size in bytes.
        max_bytes: usize,
    },

    /// The frame body is not valid JSON.
    #[error("malformed JSON frame: {reason}")]
    MalformedJson {
        /// Human-readable description of the parse failure.
        reason: String,
    },

    /// The `Content-Length` header block could not be parsed.
    #[error("malformed frame header: {reason}")]
    MalformedHeader {
        /// Human-readable description of the header failure.
        reason: String,
    },

    /// An underlying IO error on the byte stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Whether the stream remains usable after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FramingError::Io(_))
    }
}

/// Proxy runtime errors: upstream lifecycle, request correlation, shutdown.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The upstream child process could not be spawned.
    #[error("failed to spawn upstream '{server_id}': {reason}")]
    Spawn { server_id: String, reason: String },

    /// A send was attempted on an upstream that has no live connection.
    #[error("upstream '{server_id}' is not running")]
    NotRunning { server_id: String },

    /// An upstream request exceeded its deadline.
    #[error("upstream '{server_id}' timed out on {method}")]
    Timeout { server_id: String, method: String },

    /// The upstream connection failed mid-flight.
    #[error("upstream '{server_id}' transport error: {reason}")]
    Transport { server_id: String, reason: String },

    /// The client-side stream failed terminally.
    #[error("client stream error: {0}")]
    ClientStream(#[from] FramingError),
}

impl ProxyError {
    /// Map this failure onto the wire error object sent to the client.
    pub fn to_rpc(&self) -> RpcError {
        match self {
            ProxyError::Timeout { .. } => RpcError::new(UPSTREAM_TIMEOUT, self.to_string()),
            ProxyError::Spawn { .. }
            | ProxyError::NotRunning { .. }
            | ProxyError::Transport { .. } => {
                RpcError::new(UPSTREAM_TRANSPORT_ERROR, self.to_string())
            }
            ProxyError::ClientStream(_) => RpcError::new(INTERNAL_ERROR, self.to_string()),
        }
    }
}
