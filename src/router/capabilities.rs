//! Capability aggregation for the client-facing initialize response.
//!
//! The proxy advertises the union of what its upstreams offer: boolean
//! flags are OR-ed, object-valued capabilities are merged key-wise. A
//! `logging` capability is always present since `logging/setLevel` is
//! implemented by the proxy itself.

use serde_json::{json, Map, Value};

/// Merge one upstream's `capabilities` object into the aggregate.
pub fn merge_capabilities(target: &mut Map<String, Value>, capabilities: &Value) {
    let Some(source) = capabilities.as_object() else {
        return;
    };
    for (key, value) in source {
        match value {
            Value::Bool(flag) => match target.get(key) {
                Some(Value::Bool(existing)) => {
                    let merged = *existing || *flag;
                    target.insert(key.clone(), Value::Bool(merged));
                }
                None => {
                    target.insert(key.clone(), Value::Bool(*flag));
                }
                // Upstreams that disagree on a capability's shape cannot be
                // merged; whatever is already in the slot wins.
                Some(_) => {}
            },
            Value::Object(_) => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| json!({}));
                if let Some(slot) = slot.as_object_mut() {
                    merge_capabilities(slot, value);
                }
            }
            other => {
                target.entry(key.clone()).or_insert_with(|| other.clone());
            }
        }
    }
}

/// Aggregate the cached initialize results of every upstream that completed
/// its handshake.
pub fn aggregate_capabilities<'a>(results: impl Iterator<Item = &'a Value>) -> Value {
    let mut merged = Map::new();
    for result in results {
        if let Some(capabilities) = result.get("capabilities") {
            merge_capabilities(&mut merged, capabilities);
        }
    }
    merged
        .entry("logging".to_string())
        .or_insert_with(|| json!({"setLevel": true}));
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_flags_are_ored() {
        let mut target = Map::new();
        merge_capabilities(&mut target, &json!({"experimental": false}));
        merge_capabilities(&mut target, &json!({"experimental": true}));
        merge_capabilities(&mut target, &json!({"experimental": false}));
        assert_eq!(target["experimental"], json!(true));
    }

    #[test]
    fn test_object_capabilities_merge_subfields() {
        let mut target = Map::new();
        merge_capabilities(&mut target, &json!({"tools": {"listChanged": true}}));
        merge_capabilities(&mut target, &json!({"tools": {"subscribe": true, "listChanged": false}}));
        assert_eq!(target["tools"]["listChanged"], json!(true));
        assert_eq!(target["tools"]["subscribe"], json!(true));
    }

    #[test]
    fn test_disjoint_capabilities_union() {
        let mut target = Map::new();
        merge_capabilities(&mut target, &json!({"tools": {}}));
        merge_capabilities(&mut target, &json!({"prompts": {}, "resources": {"subscribe": true}}));
        assert!(target.contains_key("tools"));
        assert!(target.contains_key("prompts"));
        assert_eq!(target["resources"]["subscribe"], json!(true));
    }

    #[test]
    fn test_aggregate_always_advertises_logging() {
        let results = [json!({"capabilities": {"tools": {}}})];
        let merged = aggregate_capabilities(results.iter());
        assert_eq!(merged["logging"]["setLevel"], json!(true));
        assert!(merged.get("tools").is_some());

        let empty: [Value; 0] = [];
        let merged = aggregate_capabilities(empty.iter());
        assert_eq!(merged["logging"]["setLevel"], json!(true));
    }

    #[test]
    fn test_aggregate_tolerates_missing_capabilities() {
        let results = [json!({"serverInfo": {"name": "x"}}), json!({"capabilities": {"prompts": {}}})];
        let merged = aggregate_capabilities(results.iter());
        assert!(merged.get("prompts").is_some());
    }

    #[test]
    fn test_nested_objects_merge_deeply() {
        let mut target = Map::new();
        merge_capabilities(&mut target, &json!({"resources": {"templates": {"list": true}}}));
        merge_capabilities(&mut target, &json!({"resources": {"templates": {"watch": true}}}));
        assert_eq!(target["resources"]["templates"]["list"], json!(true));
        assert_eq!(target["resources"]["templates"]["watch"], json!(true));
    }
}
