//! Chain execution orchestration
//!
//! Build → validate → lockfile pin check → env resolution → template
//! expansion → primitive dispatch. Dry runs stop before dispatch. A
//! successful real run with no pre-existing lockfile pins the chain into
//! the project tier (user tier without a project).

use crate::chain::{self, Chain, ChainBuilder, ChainElement, ValidatedPair};
use crate::env::resolve_env;
use crate::primitive::PrimitiveRegistry;
use crate::template::expand_templates;
use chrono::{SecondsFormat, Utc};
use ryeos_core::{ArtifactId, Error, Result};
use ryeos_store::lockfile::{LockEntry, LockRoot, Lockfile};
use ryeos_store::Resolver;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Executor failure with however much of the chain resolved before it.
#[derive(Debug)]
pub struct ExecError {
    pub error: Error,
    pub partial_chain: Vec<ChainElement>,
}

impl ExecError {
    fn with_chain(error: Error, chain: &Chain) -> Self {
        Self { error, partial_chain: chain.summaries() }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct ExecutionReport {
    pub chain: Vec<ChainElement>,
    pub validated_pairs: Vec<ValidatedPair>,
    pub dry_run: bool,
    /// Primitive result; absent on dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockfile_written: Option<PathBuf>,
}

pub struct Executor {
    resolver: Arc<Resolver>,
    primitives: PrimitiveRegistry,
}

impl Executor {
    pub fn new(resolver: Arc<Resolver>, primitives: PrimitiveRegistry) -> Self {
        Self { resolver, primitives }
    }

    pub async fn execute(
        &self,
        root: &ArtifactId,
        params: &Map<String, Value>,
        dry_run: bool,
    ) -> std::result::Result<ExecutionReport, ExecError> {
        let chain = ChainBuilder::new(&self.resolver)
            .build(root)
            .map_err(|(partial, error)| ExecError { error, partial_chain: partial })?;

        let validated_pairs =
            chain::validate(&chain).map_err(|e| ExecError::with_chain(e, &chain))?;

        let had_lockfile = self
            .check_lockfile(&chain)
            .map_err(|e| ExecError::with_chain(e, &chain))?;

        if dry_run {
            return Ok(ExecutionReport {
                chain: chain.summaries(),
                validated_pairs,
                dry_run: true,
                result: None,
                lockfile_written: None,
            });
        }

        let project_root = self.resolver.tiers.project.as_deref();
        let env = resolve_env(&chain, project_root, &instance_env(params))
            .map_err(|e| ExecError::with_chain(e, &chain))?;

        let terminal = chain.terminal();
        let primitive_name = terminal
            .metadata
            .get_str("primitive")
            .ok_or_else(|| ExecError::with_chain(
                Error::chain(format!("{} is not a primitive descriptor", terminal.id)),
                &chain,
            ))?;
        let config = terminal
            .metadata
            .get("config")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let config = merge_chain_config(&chain, config);

        // Chain-contributed config keys double as placeholder values for the
        // terminal template ("{script}" in a runtime command picks up the
        // tool's `script` entry), resolved themselves before use. Request
        // parameters win over config-derived values.
        let mut combined = Map::new();
        if let Value::Object(cfg) = &config {
            for (key, value) in cfg {
                combined.insert(key.clone(), expand_templates(value, &env, params));
            }
        }
        for (key, value) in params {
            combined.insert(key.clone(), value.clone());
        }
        let expanded = expand_templates(&config, &env, &combined);

        let primitive = self
            .primitives
            .get(primitive_name)
            .map_err(|e| ExecError::with_chain(e, &chain))?;
        info!(root = %root, primitive = primitive_name, "dispatching chain");
        let result = primitive
            .dispatch(&expanded, params, &env)
            .await
            .map_err(|e| ExecError::with_chain(e, &chain))?;

        let lockfile_written = if had_lockfile {
            None
        } else {
            match self.write_lockfile(&chain) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(error = %e, "could not write auto-lockfile");
                    None
                }
            }
        };

        Ok(ExecutionReport {
            chain: chain.summaries(),
            validated_pairs,
            dry_run: false,
            result: Some(result),
            lockfile_written,
        })
    }

    /// Build + validate only; used by the dispatcher for dry-run previews
    /// of workflows that reference tools.
    pub fn describe(&self, root: &ArtifactId) -> std::result::Result<ExecutionReport, ExecError> {
        let chain = ChainBuilder::new(&self.resolver)
            .build(root)
            .map_err(|(partial, error)| ExecError { error, partial_chain: partial })?;
        let validated_pairs =
            chain::validate(&chain).map_err(|e| ExecError::with_chain(e, &chain))?;
        Ok(ExecutionReport {
            chain: chain.summaries(),
            validated_pairs,
            dry_run: true,
            result: None,
            lockfile_written: None,
        })
    }

    fn lockfile_roots(&self) -> Vec<&Path> {
        let mut roots = Vec::new();
        if let Some(p) = self.resolver.tiers.project.as_deref() {
            roots.push(p);
        }
        roots.push(self.resolver.tiers.user.as_path());
        roots
    }

    /// When a lockfile pins `(root.id, root.version)`, every freshly
    /// resolved element must match it hash-for-hash.
    fn check_lockfile(&self, chain: &Chain) -> Result<bool> {
        let root = chain.root();
        let Some(version) = root.version else {
            return Ok(false);
        };
        let Some(lock) = Lockfile::load(&self.lockfile_roots(), &root.id, &version)? else {
            return Ok(false);
        };

        if lock.resolved_chain.len() != chain.len() {
            return Err(Error::StaleLockfile(format!(
                "pinned chain has {} elements, resolved {}",
                lock.resolved_chain.len(),
                chain.len()
            )));
        }
        for (pinned, resolved) in lock.resolved_chain.iter().zip(&chain.elements) {
            if pinned.id != resolved.id {
                return Err(Error::StaleLockfile(format!(
                    "pinned element {} resolved as {}",
                    pinned.id, resolved.id
                )));
            }
            if pinned.integrity != resolved.signature.content_hash {
                return Err(Error::StaleLockfile(format!(
                    "integrity mismatch at {}",
                    pinned.id
                )));
            }
        }
        Ok(true)
    }

    fn write_lockfile(&self, chain: &Chain) -> Result<PathBuf> {
        let root = chain.root();
        let version = root
            .version
            .ok_or_else(|| Error::validation(format!("{} has no version to pin", root.id)))?;
        let lock = Lockfile::new(
            LockRoot {
                id: root.id.clone(),
                version,
                integrity: root.signature.content_hash.clone(),
            },
            chain
                .elements
                .iter()
                .map(|a| LockEntry {
                    id: a.id.clone(),
                    space: a.space.clone(),
                    runtime_ref: a.runtime_ref().unwrap_or_default().to_string(),
                    integrity: a.signature.content_hash.clone(),
                })
                .collect(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        let path = lock.write_under(self.resolver.tiers.writable_root())?;
        info!(path = %path.display(), "pinned chain lockfile");
        Ok(path)
    }
}

/// The request may carry a nested `env` map of instance overrides; it is
/// the highest env layer and never reaches the primitive as a parameter.
fn instance_env(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .get("env")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default()
}

/// Elements above the terminal may contribute config (root first so the
/// tool's own config wins over intermediate runtimes).
fn merge_chain_config(chain: &Chain, terminal_config: Value) -> Value {
    let mut merged = match terminal_config {
        Value::Object(map) => map,
        other => return other,
    };
    for element in chain.elements.iter().rev().skip(1) {
        if let Some(config) = element.metadata.get_map("config") {
            for (key, value) in config {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}
