//! Turn hooks
//!
//! A hook is a (condition → action) pair. Conditions are a fixed grammar
//! of `(path, op, value)` triples evaluated against the event payload;
//! actions dispatch through the standard execute verb, so a hook can do
//! anything a tool can and nothing more.

use ryeos_core::{ArtifactKind, Metadata};
use serde_json::{Map, Value};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    BeforeTurn,
    AfterTurn,
    ContextPressure,
    AfterComplete,
}

impl HookEvent {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "before_turn" => Some(Self::BeforeTurn),
            "after_turn" => Some(Self::AfterTurn),
            "context_pressure" => Some(Self::ContextPressure),
            "after_complete" => Some(Self::AfterComplete),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HookCondition {
    pub path: String,
    pub op: CondOp,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CondOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl CondOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" | "==" => Some(Self::Eq),
            "ne" | "!=" => Some(Self::Ne),
            "gt" | ">" => Some(Self::Gt),
            "gte" | ">=" => Some(Self::Gte),
            "lt" | "<" => Some(Self::Lt),
            "lte" | "<=" => Some(Self::Lte),
            "contains" => Some(Self::Contains),
            _ => None,
        }
    }
}

impl HookCondition {
    pub fn eval(&self, payload: &Value) -> bool {
        let Some(actual) = lookup(payload, &self.path) else {
            return false;
        };
        match self.op {
            CondOp::Eq => actual == &self.value,
            CondOp::Ne => actual != &self.value,
            CondOp::Gt | CondOp::Gte | CondOp::Lt | CondOp::Lte => {
                let (Some(a), Some(b)) = (actual.as_f64(), self.value.as_f64()) else {
                    return false;
                };
                match self.op {
                    CondOp::Gt => a > b,
                    CondOp::Gte => a >= b,
                    CondOp::Lt => a < b,
                    CondOp::Lte => a <= b,
                    _ => unreachable!(),
                }
            }
            CondOp::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
        }
    }
}

fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Action side: an execute request against an artifact.
#[derive(Clone, Debug)]
pub struct HookAction {
    pub kind: ArtifactKind,
    pub id: String,
    pub params: Map<String, Value>,
}

#[derive(Clone, Debug)]
pub struct Hook {
    pub event: HookEvent,
    pub condition: Option<HookCondition>,
    pub action: HookAction,
}

impl Hook {
    pub fn fires(&self, event: HookEvent, payload: &Value) -> bool {
        self.event == event
            && self
                .condition
                .as_ref()
                .map(|c| c.eval(payload))
                .unwrap_or(true)
    }
}

/// Parse a directive's `hooks` metadata list:
///
/// ```yaml
/// hooks:
///   - on: after_turn
///     when: {path: context_ratio, op: gte, value: 0.8}
///     execute: {kind: workflow, id: ops/summarize, params: {}}
/// ```
///
/// Malformed entries are skipped with a warning; a broken hook must not
/// stop the thread.
pub fn parse_hooks(metadata: &Metadata) -> Vec<Hook> {
    let Some(Value::Array(entries)) = metadata.get("hooks") else {
        return Vec::new();
    };
    let mut hooks = Vec::new();
    for entry in entries {
        match parse_hook(entry) {
            Some(hook) => hooks.push(hook),
            None => warn!(entry = %entry, "skipping malformed hook"),
        }
    }
    hooks
}

fn parse_hook(entry: &Value) -> Option<Hook> {
    let event = HookEvent::parse(entry.get("on")?.as_str()?)?;
    let condition = match entry.get("when") {
        Some(when) => Some(HookCondition {
            path: when.get("path")?.as_str()?.to_string(),
            op: CondOp::parse(when.get("op")?.as_str()?)?,
            value: when.get("value")?.clone(),
        }),
        None => None,
    };
    let execute = entry.get("execute")?;
    let kind: ArtifactKind = execute.get("kind")?.as_str()?.parse().ok()?;
    let action = HookAction {
        kind,
        id: execute.get("id")?.as_str()?.to_string(),
        params: execute
            .get("params")
            .and_then(|p| p.as_object())
            .cloned()
            .unwrap_or_default(),
    };
    Some(Hook { event, condition, action })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn condition_ops() {
        let cond = HookCondition {
            path: "cost.spend".into(),
            op: CondOp::Gte,
            value: json!(0.5),
        };
        assert!(cond.eval(&json!({"cost": {"spend": 0.75}})));
        assert!(!cond.eval(&json!({"cost": {"spend": 0.25}})));
        assert!(!cond.eval(&json!({"other": 1})));

        let contains = HookCondition {
            path: "tags".into(),
            op: CondOp::Contains,
            value: json!("urgent"),
        };
        assert!(contains.eval(&json!({"tags": ["urgent", "infra"]})));
    }

    #[test]
    fn parse_from_metadata() {
        let meta = ryeos_store::extractor::parse_front_matter(
            "---\nname: x\nhooks:\n  - on: after_turn\n    when:\n      path: context_ratio\n      op: gte\n      value: 0.8\n    execute:\n      kind: workflow\n      id: ops/summarize\n  - on: nonsense\n    execute: {kind: workflow, id: ops/x}\n---\n",
        )
        .unwrap();
        let hooks = parse_hooks(&meta);
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].event, HookEvent::AfterTurn);
        assert!(hooks[0].fires(HookEvent::AfterTurn, &json!({"context_ratio": 0.95})));
        assert!(!hooks[0].fires(HookEvent::AfterTurn, &json!({"context_ratio": 0.5})));
        assert!(!hooks[0].fires(HookEvent::BeforeTurn, &json!({"context_ratio": 0.95})));
    }
}
