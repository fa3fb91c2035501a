//! Fingerprinter (C5).
//!
//! Each node's fingerprint is a SHA-1 hex digest of its module identity,
//! its normalized configuration, and the fingerprints of its direct
//! inputs — a direct port of `original_source/dataflow/calc.py`'s
//! `fingerprint_node` / `_format_ordered`.

use std::collections::HashMap;

use sha1::{Digest, Sha1};
use serde_json::{Map, Value};

use crate::registry::{ParamMap, Template};

/// Ordered normalization of a JSON value: mappings become
/// sorted `(key, recurse(value))` lists; arrays recurse element-wise,
/// preserving order; everything else passes through unchanged. Mappings
/// sort by key so that reordering fields never changes the fingerprint;
/// arrays never sort, so reordering a wire list into a `multiple=True`
/// terminal (represented by the input descriptor, not this function)
/// still changes it upstream.
fn format_ordered(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Array(
                entries
                    .into_iter()
                    .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), format_ordered(v)]))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(format_ordered).collect()),
        other => other.clone(),
    }
}

/// `string(normalized-config)`: a canonical textual form of
/// the ordered-normalized value. `serde_json::Value`'s own `to_string` is
/// already deterministic given a pre-sorted structure, so normalizing then
/// serializing is sufficient.
fn config_string(config: &ParamMap) -> String {
    format_ordered(&Value::Object(config.clone())).to_string()
}

/// Computes `module_id:module_version:config_str:input_descriptor` and
/// returns its SHA-1 hex digest.
pub fn fingerprint_node(
    module_id: &str,
    module_version: &str,
    effective_config: &ParamMap,
    // (target_terminal_id, source_terminal_id, source_node_fingerprint), in
    // wire-iteration order.
    input_descriptor: &[(String, String, String)],
) -> String {
    let mut parts = vec![
        module_id.to_string(),
        module_version.to_string(),
        config_string(effective_config),
    ];
    for (target, source, source_fp) in input_descriptor {
        parts.push(format!("[{target}, {source}, {source_fp}]"));
    }
    let digest_input = parts.join(":");

    let mut hasher = Sha1::new();
    hasher.update(digest_input.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Computes one fingerprint per node named in `order`, given `overrides`
/// (per-execution config overlaid on each node's template defaults, keyed
/// by node index as a string). `order`
/// need not cover every node in `template` — a scoped run only fingerprints
/// the backward-reachable subset — but it must be topological: a node's
/// wire sources must already be fingerprinted by the time it's visited.
pub fn fingerprint_template(
    template: &Template,
    overrides: &Map<String, Value>,
    order: &[usize],
) -> HashMap<usize, String> {
    let mut fingerprints: HashMap<usize, String> = HashMap::with_capacity(order.len());

    for &node in order {
        let template_module = &template.modules[node];

        let mut effective_config = template_module.config.clone();
        if let Some(Value::Object(node_overrides)) = overrides.get(&node.to_string()) {
            for (k, v) in node_overrides {
                effective_config.insert(k.clone(), v.clone());
            }
        }

        let input_descriptor: Vec<(String, String, String)> = template
            .wires_into(node)
            .map(|wire| {
                let source_fp = fingerprints
                    .get(&wire.source.0)
                    .cloned()
                    .expect("predecessors are fingerprinted before their dependents");
                (wire.target.1.clone(), wire.source.1.clone(), source_fp)
            })
            .collect();

        let fp = fingerprint_node(
            &template_module.module,
            &template_module.version,
            &effective_config,
            &input_descriptor,
        );
        fingerprints.insert(node, fp);
    }

    fingerprints
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> ParamMap {
        let mut map = Map::new();
        for (k, v) in pairs {
            map.insert((*k).to_string(), v.clone());
        }
        map
    }

    #[test]
    fn reordering_config_keys_does_not_change_fingerprint() {
        let a = params(&[("x", json!(1)), ("y", json!(2))]);
        let b = params(&[("y", json!(2)), ("x", json!(1))]);
        let fp_a = fingerprint_node("mod", "1", &a, &[]);
        let fp_b = fingerprint_node("mod", "1", &b, &[]);
        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn different_config_values_change_fingerprint() {
        let a = params(&[("x", json!(1))]);
        let b = params(&[("x", json!(2))]);
        assert_ne!(
            fingerprint_node("mod", "1", &a, &[]),
            fingerprint_node("mod", "1", &b, &[])
        );
    }

    #[test]
    fn reordering_multiple_wires_changes_fingerprint() {
        let config = params(&[]);
        let descriptor_a = vec![
            ("data".to_string(), "output".to_string(), "fp0".to_string()),
            ("data".to_string(), "output".to_string(), "fp1".to_string()),
        ];
        let descriptor_b = vec![
            ("data".to_string(), "output".to_string(), "fp1".to_string()),
            ("data".to_string(), "output".to_string(), "fp0".to_string()),
        ];
        assert_ne!(
            fingerprint_node("join", "1", &config, &descriptor_a),
            fingerprint_node("join", "1", &config, &descriptor_b)
        );
    }

    #[test]
    fn fingerprint_is_a_valid_sha1_hex_digest() {
        let fp = fingerprint_node("mod", "1", &Map::new(), &[]);
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
