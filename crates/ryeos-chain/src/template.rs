//! Template expansion for primitive configs
//!
//! Two passes over every string in the config tree: `${VAR}` substitutes
//! from the resolved environment, then `{param}` from the request
//! parameters. Unresolved placeholders of either form stay verbatim — a
//! missing parameter is not an error at this layer.

use crate::env::substitute_defaults;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub fn expand_templates(
    config: &Value,
    env: &BTreeMap<String, String>,
    params: &Map<String, Value>,
) -> Value {
    match config {
        Value::String(s) => expand_string(s, env, params),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| expand_templates(v, env, params)).collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_templates(v, env, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn expand_string(s: &str, env: &BTreeMap<String, String>, params: &Map<String, Value>) -> Value {
    // A string that is exactly one `{param}` placeholder adopts the
    // parameter's JSON value, preserving numbers and structures.
    if let Some(name) = exact_placeholder(s) {
        if let Some(value) = params.get(name) {
            return value.clone();
        }
    }

    let with_env = substitute_defaults(s, env);
    let mut out = String::with_capacity(with_env.len());
    let mut rest = with_env.as_str();
    while let Some(start) = rest.find('{') {
        // `${` was handled by the env pass; keep whatever it left.
        if start > 0 && rest.as_bytes()[start - 1] == b'$' {
            out.push_str(&rest[..=start]);
            rest = &rest[start + 1..];
            continue;
        }
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match params.get(name) {
                    Some(Value::String(v)) => out.push_str(v),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

fn exact_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains('{') || inner.contains('}') {
        return None;
    }
    Some(inner)
}
