//! Node input resolution.
//!
//! A node's declared input is resolved against a results map just before the
//! node executes. The map always contains the reserved key `trigger` (the
//! run input) plus the results of the nodes the input references.
//!
//! Three forms compose recursively through objects and arrays:
//! - `{"$ref": "<node>", "path": "<dot.path>"}` -- typed data reference
//! - strings containing `{{<node>.<dot.path>}}` -- template interpolation
//! - anything else -- literal

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::error::GraphError;

/// Reserved reference id for the run input.
pub const TRIGGER: &str = "trigger";

// ---------------------------------------------------------------------------
// Dependency extraction
// ---------------------------------------------------------------------------

/// All node ids referenced by an input (excluding `trigger`).
pub fn input_dependencies(input: &Value) -> BTreeSet<String> {
    let mut deps = BTreeSet::new();
    collect_dependencies(input, &mut deps);
    deps
}

fn collect_dependencies(value: &Value, deps: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get("$ref") {
                if target != TRIGGER {
                    deps.insert(target.clone());
                }
                return;
            }
            for nested in map.values() {
                collect_dependencies(nested, deps);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_dependencies(item, deps);
            }
        }
        Value::String(text) => {
            for (target, _) in template_refs(text) {
                if target != TRIGGER {
                    deps.insert(target.to_string());
                }
            }
        }
        _ => {}
    }
}

/// Parse `{{node.path}}` markers out of a template string.
/// Returns `(node, path)` pairs; `path` may be empty.
fn template_refs(text: &str) -> Vec<(&str, &str)> {
    let mut refs = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        let expr = after[..close].trim();
        if !expr.is_empty() {
            match expr.split_once('.') {
                Some((node, path)) => refs.push((node, path)),
                None => refs.push((expr, "")),
            }
        }
        rest = &after[close + 2..];
    }
    refs
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve a node input against the results map.
pub fn resolve_input(input: &Value, results: &Map<String, Value>) -> Result<Value, GraphError> {
    match input {
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get("$ref") {
                let path = match map.get("path") {
                    Some(Value::String(p)) => p.as_str(),
                    _ => "",
                };
                return resolve_ref(target, path, results).map(Value::clone);
            }
            let mut resolved = Map::new();
            for (key, nested) in map {
                resolved.insert(key.clone(), resolve_input(nested, results)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => {
            let resolved = items
                .iter()
                .map(|item| resolve_input(item, results))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(resolved))
        }
        Value::String(text) if text.contains("{{") => {
            Ok(Value::String(render_template(text, results)?))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_ref<'a>(
    target: &str,
    path: &str,
    results: &'a Map<String, Value>,
) -> Result<&'a Value, GraphError> {
    let base = results
        .get(target)
        .ok_or_else(|| GraphError::Unresolvable(format!("no result for '{target}'")))?;
    lookup_path(base, path)
        .ok_or_else(|| GraphError::Unresolvable(format!("'{target}' has no path '{path}'")))
}

/// Dot-path traversal: object keys, with numeric segments also trying array
/// indices.
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Interpolate every `{{node.path}}` marker in a template string.
fn render_template(text: &str, results: &Map<String, Value>) -> Result<String, GraphError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let expr = after[..close].trim();
        let (node, path) = expr.split_once('.').unwrap_or((expr, ""));
        let value = resolve_ref(node, path, results)?;
        out.push_str(&value_to_string(value));
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Convert a JSON value to a display string for template interpolation.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, compact JSON.
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
