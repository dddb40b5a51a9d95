//! Environment resolution for executor chains
//!
//! Layered precedence, lowest first:
//! process env < dotenv (`.env` at the project root) < element static env
//! (walked terminal-to-root so the root tool wins) < tool-instance env.
//!
//! Values may use the `${NAME:-default}` form, resolved against the layers
//! accumulated so far. Whether the process environment participates at all
//! is an explicit `env_mode` flag on the terminal primitive's config.

use crate::chain::Chain;
use ryeos_core::Result;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnvMode {
    /// Start from the full process environment.
    #[default]
    Merge,
    /// Chain-declared variables only.
    Replace,
}

impl EnvMode {
    pub fn from_config(config: Option<&serde_json::Map<String, serde_json::Value>>) -> Self {
        match config.and_then(|c| c.get("env_mode")).and_then(|v| v.as_str()) {
            Some("replace") => Self::Replace,
            _ => Self::Merge,
        }
    }
}

/// Resolve the effective environment for a validated chain.
pub fn resolve_env(
    chain: &Chain,
    project_root: Option<&Path>,
    instance_env: &serde_json::Map<String, serde_json::Value>,
) -> Result<BTreeMap<String, String>> {
    let mode = EnvMode::from_config(chain.terminal().metadata.get_map("config"));

    let mut env: BTreeMap<String, String> = BTreeMap::new();
    if mode == EnvMode::Merge {
        env.extend(std::env::vars());
    }

    if let Some(root) = project_root {
        for (key, value) in read_dotenv(&root.join(".env"))? {
            let value = substitute_defaults(&value, &env);
            env.insert(key, value);
        }
    }

    // Terminal-to-root so the element closest to the caller overrides.
    for element in chain.elements.iter().rev() {
        if let Some(map) = element.metadata.get_map("env") {
            for (key, value) in map {
                if let Some(raw) = value.as_str() {
                    let value = substitute_defaults(raw, &env);
                    env.insert(key.clone(), value);
                }
            }
        }
    }

    for (key, value) in instance_env {
        if let Some(raw) = value.as_str() {
            let value = substitute_defaults(raw, &env);
            env.insert(key.clone(), value);
        }
    }

    Ok(env)
}

/// Minimal dotenv: `KEY=VALUE` lines, `#` comments, optional single or
/// double quotes around the value. Missing file is not an error.
pub fn read_dotenv(path: &Path) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Ok(out),
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().trim_start_matches("export ").trim();
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        out.push((key.to_string(), value.to_string()));
    }
    Ok(out)
}

/// Resolve every `${NAME}` / `${NAME:-default}` occurrence against the
/// accumulated layers. Unknown names with no default stay verbatim.
pub fn substitute_defaults(raw: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let inner = &after[..end];
                let (name, default) = match inner.split_once(":-") {
                    Some((n, d)) => (n, Some(d)),
                    None => (inner, None),
                };
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => match default {
                        Some(d) => out.push_str(d),
                        None => {
                            out.push_str("${");
                            out.push_str(inner);
                            out.push('}');
                        }
                    },
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn default_form() {
        let env = env_of(&[("HOME", "/home/rye")]);
        assert_eq!(substitute_defaults("${HOME}/data", &env), "/home/rye/data");
        assert_eq!(substitute_defaults("${MISSING:-/tmp}/x", &env), "/tmp/x");
        assert_eq!(substitute_defaults("${MISSING}/x", &env), "${MISSING}/x");
        assert_eq!(substitute_defaults("no placeholders", &env), "no placeholders");
    }

    #[test]
    fn dotenv_parsing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# comment\nAPI_URL=https://example.test\nexport TOKEN='abc=def'\nBROKEN\n").unwrap();
        let pairs = read_dotenv(&path).unwrap();
        assert_eq!(pairs, vec![
            ("API_URL".to_string(), "https://example.test".to_string()),
            ("TOKEN".to_string(), "abc=def".to_string()),
        ]);
        assert!(read_dotenv(&dir.path().join("missing")).unwrap().is_empty());
    }
}
