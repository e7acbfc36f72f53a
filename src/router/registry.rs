//! Namespaced identifier codecs and the listing registries.
//!
//! Tools and prompts are exposed as `<serverId><SEP><originalName>`.
//! Resources get an opaque URI, `proxy://resource/<base64url>`, carrying the
//! owning server and the original URI as a JSON payload. Cursors are
//! base64url-encoded `{"offset": n}` objects. All encodings are injective
//! and decode failures are clean `None`s, never panics.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::jsonrpc::{RpcError, INVALID_PARAMS};

/// URI scheme prefix for namespaced resources.
pub const RESOURCE_SCHEME: &str = "proxy://resource/";

/// Build the client-visible name for an upstream tool or prompt.
pub fn proxy_name(separator: &str, server_id: &str, original: &str) -> String {
    format!("{server_id}{separator}{original}")
}

/// Split a client-supplied name back into `(server_id, original_name)`.
/// Both halves must be non-empty.
pub fn split_proxy_name<'a>(separator: &str, name: &'a str) -> Option<(&'a str, &'a str)> {
    let (server_id, original) = name.split_once(separator)?;
    if server_id.is_empty() || original.is_empty() {
        return None;
    }
    Some((server_id, original))
}

/// Encode a namespaced resource URI.
pub fn encode_resource_uri(server_id: &str, uri: &str) -> String {
    let payload = json!({"server": server_id, "uri": uri});
    let token = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{RESOURCE_SCHEME}{token}")
}

/// Decode a namespaced resource URI into `(server_id, original_uri)`.
///
/// Tolerates padded base64 from clients that re-encode the token.
pub fn decode_resource_uri(uri: &str) -> Option<(String, String)> {
    let token = uri.strip_prefix(RESOURCE_SCHEME)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim_end_matches('=').as_bytes())
        .ok()?;
    let payload: Value = serde_json::from_slice(&bytes).ok()?;
    let server = payload.get("server")?.as_str()?.to_string();
    let original = payload.get("uri")?.as_str()?.to_string();
    Some((server, original))
}

/// Encode a pagination cursor for the given offset.
pub fn encode_cursor(offset: usize) -> String {
    let payload = json!({"offset": offset});
    URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes())
}

/// Decode a pagination cursor back to an offset.
pub fn decode_cursor(cursor: &str) -> Option<usize> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim_end_matches('=').as_bytes())
        .ok()?;
    let payload: Value = serde_json::from_slice(&bytes).ok()?;
    let offset = payload.get("offset")?.as_u64()?;
    usize::try_from(offset).ok()
}

/// Slice an aggregated listing according to `cursor` and `limit` params.
///
/// Returns the page and, when items remain past it, the next cursor. A
/// malformed cursor is a caller error; a missing or non-integer `limit`
/// means the full tail.
pub fn paginate(
    items: Vec<Value>,
    params: &Value,
) -> Result<(Vec<Value>, Option<String>), RpcError> {
    let offset = match params.get("cursor") {
        None | Some(Value::Null) => 0,
        Some(Value::String(cursor)) if cursor.is_empty() => 0,
        Some(Value::String(cursor)) => decode_cursor(cursor)
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("Malformed cursor '{cursor}'")))?,
        Some(_) => {
            return Err(RpcError::new(INVALID_PARAMS, "Cursor must be a string"));
        }
    };
    let limit = params
        .get("limit")
        .and_then(Value::as_u64)
        .map(|n| n.max(1) as usize);

    let total = items.len();
    if offset >= total {
        return Ok((Vec::new(), None));
    }
    let end = limit.map_or(total, |l| offset.saturating_add(l).min(total));
    let next = if end < total {
        Some(encode_cursor(end))
    } else {
        None
    };
    let page = items[offset..end].to_vec();
    Ok((page, next))
}

/// Where a namespaced identifier routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub server_id: String,
    /// Original tool/prompt name or resource URI on the owning upstream.
    pub original: String,
}

/// Authoritative mapping from exposed identifiers to upstream targets,
/// rebuilt on every listing call.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, RegistryEntry>,
}

impl Registry {
    /// Drop all entries owned by one upstream, ahead of repopulating them.
    /// Stale names must not survive a restart that changed the offering.
    pub fn clear_server(&mut self, server_id: &str) {
        self.entries.retain(|_, entry| entry.server_id != server_id);
    }

    pub fn insert(&mut self, exposed: String, server_id: String, original: String) {
        self.entries
            .insert(exposed, RegistryEntry { server_id, original });
    }

    pub fn resolve(&self, exposed: &str) -> Option<RegistryEntry> {
        self.entries.get(exposed).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;

    #[test]
    fn test_proxy_name_round_trip() {
        let name = proxy_name("::", "echo", "say");
        assert_eq!(name, "echo::say");
        assert_eq!(split_proxy_name("::", &name), Some(("echo", "say")));
    }

    #[test]
    fn test_alternate_separator_round_trip() {
        let name = proxy_name("__", "fs", "read_file");
        assert_eq!(name, "fs__read_file");
        assert_eq!(split_proxy_name("__", &name), Some(("fs", "read_file")));
    }

    #[test]
    fn test_split_rejects_degenerate_names() {
        assert_eq!(split_proxy_name("::", "no-separator"), None);
        assert_eq!(split_proxy_name("::", "::tail"), None);
        assert_eq!(split_proxy_name("::", "head::"), None);
    }

    #[test]
    fn test_split_keeps_separator_in_original_name() {
        // Only the first separator splits; the rest belongs to the name.
        assert_eq!(split_proxy_name("::", "a::b::c"), Some(("a", "b::c")));
    }

    #[test]
    fn test_resource_uri_round_trip() {
        let uri = encode_resource_uri("fs", "file:///etc/hosts");
        assert!(uri.starts_with(RESOURCE_SCHEME));
        assert_eq!(
            decode_resource_uri(&uri),
            Some(("fs".to_string(), "file:///etc/hosts".to_string()))
        );
    }

    #[test]
    fn test_resource_uri_exact_encoding() {
        // The payload is compact JSON with "server" before "uri".
        let uri = encode_resource_uri("fs", "file:///etc/hosts");
        let expected = URL_SAFE_NO_PAD.encode(br#"{"server":"fs","uri":"file:///etc/hosts"}"#);
        assert_eq!(uri, format!("{RESOURCE_SCHEME}{expected}"));
    }

    #[test]
    fn test_resource_uri_decode_rejects_garbage() {
        assert_eq!(decode_resource_uri("file:///plain"), None);
        assert_eq!(decode_resource_uri("proxy://resource/!!!not-base64!!!"), None);
        let not_json = format!("{RESOURCE_SCHEME}{}", URL_SAFE_NO_PAD.encode(b"not json"));
        assert_eq!(decode_resource_uri(&not_json), None);
        let missing_field = format!(
            "{RESOURCE_SCHEME}{}",
            URL_SAFE_NO_PAD.encode(br#"{"server":"fs"}"#)
        );
        assert_eq!(decode_resource_uri(&missing_field), None);
    }

    #[test]
    fn test_resource_uri_accepts_padded_token() {
        let uri = encode_resource_uri("fs", "file:///tmp/x");
        let padded = format!("{uri}==");
        assert_eq!(
            decode_resource_uri(&padded),
            Some(("fs".to_string(), "file:///tmp/x".to_string()))
        );
    }

    #[test]
    fn test_cursor_round_trip() {
        for offset in [0usize, 1, 2, 17, 10_000] {
            assert_eq!(decode_cursor(&encode_cursor(offset)), Some(offset));
        }
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert_eq!(decode_cursor("???"), None);
        assert_eq!(decode_cursor(&URL_SAFE_NO_PAD.encode(b"[1,2]")), None);
        assert_eq!(decode_cursor(&URL_SAFE_NO_PAD.encode(br#"{"offset":-3}"#)), None);
    }

    fn items(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"name": format!("t{i}")})).collect()
    }

    #[test]
    fn test_paginate_no_params_returns_everything() {
        let (page, next) = paginate(items(3), &json!({})).unwrap();
        assert_eq!(page.len(), 3);
        assert!(next.is_none());
    }

    #[test]
    fn test_paginate_limit_produces_next_cursor() {
        let (page, next) = paginate(items(3), &json!({"limit": 2})).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(next.as_deref(), Some(encode_cursor(2).as_str()));

        let (rest, next) = paginate(items(3), &json!({"cursor": encode_cursor(2)})).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0]["name"], json!("t2"));
        assert!(next.is_none());
    }

    #[test]
    fn test_paginate_offset_past_end_is_empty_without_cursor() {
        let (page, next) = paginate(items(3), &json!({"cursor": encode_cursor(7)})).unwrap();
        assert!(page.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn test_paginate_malformed_cursor_is_invalid_params() {
        let err = paginate(items(3), &json!({"cursor": "&&&"})).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        let err = paginate(items(3), &json!({"cursor": 5})).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[test]
    fn test_paginate_ignores_unusable_limit() {
        let (page, _) = paginate(items(4), &json!({"limit": "two"})).unwrap();
        assert_eq!(page.len(), 4);
        // Zero is clamped up rather than producing empty pages forever.
        let (page, next) = paginate(items(4), &json!({"limit": 0})).unwrap();
        assert_eq!(page.len(), 1);
        assert!(next.is_some());
    }

    #[test]
    fn test_registry_rebuild_clears_only_one_server() {
        let mut registry = Registry::default();
        registry.insert("a::t1".into(), "a".into(), "t1".into());
        registry.insert("a::t2".into(), "a".into(), "t2".into());
        registry.insert("b::t3".into(), "b".into(), "t3".into());

        registry.clear_server("a");
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("a::t1").is_none());
        assert_eq!(
            registry.resolve("b::t3"),
            Some(RegistryEntry {
                server_id: "b".into(),
                original: "t3".into()
            })
        );
    }
}
