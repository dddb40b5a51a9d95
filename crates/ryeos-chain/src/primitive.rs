//! The terminal primitive layer
//!
//! A primitive is an opaque low-level operation the chain engine
//! dispatches into: subprocess execution and HTTP today. Primitives
//! report failures inside their structured result wherever possible; a
//! `PrimitiveError` is reserved for not being able to run at all.

use async_trait::async_trait;
use ryeos_core::{Error, Result};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait Primitive: Send + Sync {
    fn name(&self) -> &str;

    /// Dispatch with a fully expanded config. `env` is the chain-resolved
    /// environment (already layered and defaulted).
    async fn dispatch(
        &self,
        config: &Value,
        params: &Map<String, Value>,
        env: &BTreeMap<String, String>,
    ) -> Result<Value>;
}

#[derive(Clone, Default)]
pub struct PrimitiveRegistry {
    by_name: HashMap<String, Arc<dyn Primitive>>,
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in subprocess and http primitives.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SubprocessPrimitive::default()));
        registry.register(Arc::new(HttpPrimitive::default()));
        registry
    }

    pub fn register(&mut self, primitive: Arc<dyn Primitive>) {
        self.by_name.insert(primitive.name().to_string(), primitive);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Primitive>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::chain(format!("unknown primitive '{name}'")))
    }
}

/// Runs `config.command` through a shell with captured output and a
/// per-call timeout. Non-zero exit is a structured result, not an error.
pub struct SubprocessPrimitive {
    default_timeout_secs: u64,
}

impl Default for SubprocessPrimitive {
    fn default() -> Self {
        Self { default_timeout_secs: 120 }
    }
}

#[async_trait]
impl Primitive for SubprocessPrimitive {
    fn name(&self) -> &str {
        "subprocess"
    }

    async fn dispatch(
        &self,
        config: &Value,
        _params: &Map<String, Value>,
        env: &BTreeMap<String, String>,
    ) -> Result<Value> {
        let command = config
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Primitive("subprocess config missing 'command'".into()))?;
        let timeout_secs = config
            .get("timeout_s")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.default_timeout_secs)
            .min(600);

        debug!(command = %&command[..command.len().min(120)], "dispatching subprocess primitive");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command).env_clear().envs(env);
        if let Some(cwd) = config.get("cwd").and_then(|v| v.as_str()) {
            cmd.current_dir(cwd);
        }
        cmd.kill_on_drop(true);

        let output = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            cmd.output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::Primitive(format!("failed to spawn: {e}"))),
            Err(_) => {
                return Ok(json!({
                    "success": false,
                    "timed_out": true,
                    "timeout_s": timeout_secs,
                }))
            }
        };

        Ok(json!({
            "success": output.status.success(),
            "exit_code": output.status.code().unwrap_or(-1),
            "stdout": truncate(&String::from_utf8_lossy(&output.stdout)),
            "stderr": truncate(&String::from_utf8_lossy(&output.stderr)),
        }))
    }
}

/// JSON-over-HTTP primitive.
pub struct HttpPrimitive {
    client: reqwest::Client,
}

impl Default for HttpPrimitive {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl Primitive for HttpPrimitive {
    fn name(&self) -> &str {
        "http"
    }

    async fn dispatch(
        &self,
        config: &Value,
        _params: &Map<String, Value>,
        _env: &BTreeMap<String, String>,
    ) -> Result<Value> {
        let url = config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Primitive("http config missing 'url'".into()))?;
        let method = config.get("method").and_then(|v| v.as_str()).unwrap_or("GET");
        let timeout_secs = config.get("timeout_s").and_then(|v| v.as_u64()).unwrap_or(30);

        let method: reqwest::Method = method
            .parse()
            .map_err(|_| Error::Primitive(format!("invalid http method '{method}'")))?;
        let mut request = self
            .client
            .request(method, url)
            .timeout(Duration::from_secs(timeout_secs));
        if let Some(headers) = config.get("headers").and_then(|v| v.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = config.get("body") {
            if !body.is_null() {
                request = request.json(body);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Primitive(format!("http request failed: {e}")))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Primitive(format!("http body read failed: {e}")))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(truncate(&text)));

        Ok(json!({
            "success": (200..300).contains(&status),
            "status": status,
            "body": body,
        }))
    }
}

fn truncate(s: &str) -> String {
    const MAX: usize = 30_000;
    if s.len() > MAX {
        let cut = s.char_indices().take_while(|(i, _)| *i < MAX).last().map(|(i, c)| i + c.len_utf8()).unwrap_or(MAX);
        format!("{}\n... [truncated, {} total chars]", &s[..cut], s.len())
    } else {
        s.to_string()
    }
}
