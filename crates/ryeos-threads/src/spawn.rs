//! Thread spawning
//!
//! Spawn order matters: limits are derived and checked, capabilities
//! derived and attenuation-enforced, risk classified, the budget
//! reservation committed, the thread registered, and only then is the
//! runner process launched. A reservation failure aborts the spawn with
//! nothing changed.

use crate::ledger::BudgetLedger;
use crate::process::ProcessDriver;
use crate::registry::{ThreadMeta, ThreadRegistry};
use ryeos_core::{
    Artifact, ArtifactId, ArtifactKind, CapabilitySet, Error, Limits, Result, RiskPolicy,
    RiskTable, ThreadStatus,
};
use ryeos_store::Resolver;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const RUNNER_ENV: &str = "RYE_RUNNER";
pub const PARENT_THREAD_ENV: &str = "RYE_PARENT_THREAD";
pub const CANCEL_SENTINEL: &str = "cancel";
pub const TRANSCRIPT_FILE: &str = "transcript.jsonl";
pub const THREAD_SNAPSHOT_FILE: &str = "thread.json";
pub const INPUT_FILE: &str = "input.json";

#[derive(Clone, Debug)]
pub struct SpawnRequest {
    pub directive: ArtifactId,
    pub inputs: Map<String, Value>,
    pub overrides: Option<Limits>,
    pub parent_id: Option<String>,
    pub model: Option<String>,
    /// Detach the runner instead of awaiting the terminal result.
    pub detach: bool,
    /// Seed message history for continuation successors; written into the
    /// thread's input file before the runner starts.
    pub seed: Option<Value>,
}

impl SpawnRequest {
    pub fn new(directive: ArtifactId) -> Self {
        Self {
            directive,
            inputs: Map::new(),
            overrides: None,
            parent_id: None,
            model: None,
            detach: true,
            seed: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpawnOutcome {
    pub thread_id: String,
    pub pid: Option<u32>,
    pub status: ThreadStatus,
    /// Terminal result, present only for synchronous spawns.
    pub result: Option<Value>,
}

pub struct Orchestrator {
    pub registry: Arc<ThreadRegistry>,
    pub ledger: Arc<BudgetLedger>,
    resolver: Arc<Resolver>,
    driver: Arc<dyn ProcessDriver>,
    threads_dir: PathBuf,
    risk: RiskTable,
    runner: Vec<String>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ThreadRegistry>,
        ledger: Arc<BudgetLedger>,
        resolver: Arc<Resolver>,
        driver: Arc<dyn ProcessDriver>,
        threads_dir: PathBuf,
    ) -> Self {
        let runner = std::env::var(RUNNER_ENV)
            .map(|v| v.split_whitespace().map(String::from).collect())
            .unwrap_or_else(|_| vec!["rye".to_string(), "thread".to_string(), "run".to_string()]);
        Self {
            registry,
            ledger,
            resolver,
            driver,
            threads_dir,
            risk: RiskTable::default(),
            runner,
        }
    }

    pub fn with_runner(mut self, runner: Vec<String>) -> Self {
        self.runner = runner;
        self
    }

    pub fn threads_dir(&self) -> &Path {
        &self.threads_dir
    }

    pub fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.threads_dir.join(thread_id)
    }

    pub async fn spawn(&self, req: SpawnRequest) -> Result<SpawnOutcome> {
        let directive = self
            .resolver
            .resolve(ArtifactKind::Workflow, &req.directive, None)?;
        let parent = match &req.parent_id {
            Some(id) => Some(self.registry.get(id)?),
            None => None,
        };

        let limits = self.effective_limits(&directive, parent.as_ref(), req.overrides.as_ref())?;
        let capabilities = self.derive_capabilities(&directive, parent.as_ref())?;
        self.classify_risk(&directive, &capabilities)?;

        let thread_id = self.mint_thread_id(&req.directive)?;

        // Reservation commits before the child exists anywhere else.
        match parent.as_ref() {
            Some(parent) => {
                self.ledger
                    .reserve_child(&parent.thread_id, &thread_id, limits.spend)?
            }
            None => self.ledger.open_root(&thread_id, limits.spend)?,
        }

        let dir = self.thread_dir(&thread_id);
        std::fs::create_dir_all(&dir)?;
        let input = json!({
            "inputs": req.inputs,
            "context": directive.metadata.get_str_list("context"),
            "directive": req.directive.as_str(),
            "seed": req.seed,
        });
        std::fs::write(dir.join(INPUT_FILE), serde_json::to_vec_pretty(&input)?)?;

        let mut meta = ThreadMeta::new(thread_id.clone(), req.directive.clone());
        meta.parent_id = req.parent_id.clone();
        meta.limits = limits;
        meta.capabilities = capabilities;
        meta.model = req
            .model
            .or_else(|| directive.metadata.get_str("model").map(String::from));
        meta.transcript_path = Some(dir.join(TRANSCRIPT_FILE));

        if let Err(e) = self.registry.register(&meta) {
            // Roll the reservation back; the thread never existed.
            let _ = self.ledger.settle(&thread_id);
            return Err(e);
        }

        let outcome = self.launch(&meta, req.detach).await?;
        Ok(outcome)
    }

    /// Spawn a pre-linked continuation successor: the caller provides the
    /// predecessor id; registration and chain linking happen atomically.
    pub async fn spawn_continuation(
        &self,
        old_id: &str,
        req: SpawnRequest,
    ) -> Result<SpawnOutcome> {
        let directive = self
            .resolver
            .resolve(ArtifactKind::Workflow, &req.directive, None)?;
        let old = self.registry.get(old_id)?;
        let parent = match old.parent_id.as_deref() {
            Some(id) => Some(self.registry.get(id)?),
            None => None,
        };

        // The successor inherits the predecessor's limit profile.
        let limits = req.overrides.unwrap_or(old.limits);
        let capabilities = old.capabilities.clone();
        self.classify_risk(&directive, &capabilities)?;

        // The predecessor's turn loop is over; settle its ledger entry
        // now so the successor's reservation does not double-count it
        // against the parent.
        self.ledger.settle(&old.thread_id)?;

        let thread_id = self.mint_thread_id(&req.directive)?;
        match parent.as_ref() {
            Some(parent) => {
                self.ledger
                    .reserve_child(&parent.thread_id, &thread_id, limits.spend)?
            }
            None => self.ledger.open_root(&thread_id, limits.spend)?,
        }

        let dir = self.thread_dir(&thread_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join(INPUT_FILE),
            serde_json::to_vec_pretty(&json!({
                "inputs": req.inputs,
                "directive": req.directive.as_str(),
                "seed": req.seed,
            }))?,
        )?;

        let mut meta = ThreadMeta::new(thread_id.clone(), req.directive.clone());
        meta.parent_id = old.parent_id.clone();
        meta.limits = limits;
        meta.capabilities = capabilities;
        meta.model = req.model.or(old.model);
        meta.transcript_path = Some(dir.join(TRANSCRIPT_FILE));

        if let Err(e) = self.registry.register_continuation(old_id, &mut meta) {
            let _ = self.ledger.settle(&thread_id);
            return Err(e);
        }
        self.launch(&meta, req.detach).await
    }

    async fn launch(&self, meta: &ThreadMeta, detach: bool) -> Result<SpawnOutcome> {
        let (program, mut args) = match self.runner.split_first() {
            Some((p, rest)) => (p.clone(), rest.to_vec()),
            None => return Err(Error::internal("empty runner command")),
        };
        args.push(meta.thread_id.clone());
        args.push("--pre-registered".to_string());
        let mut env: Vec<(String, String)> = Vec::new();
        if let Some(parent) = &meta.parent_id {
            env.push((PARENT_THREAD_ENV.to_string(), parent.clone()));
        }

        let pid = self.driver.spawn_detached(&program, &args, &env).await?;
        self.registry.set_pid(&meta.thread_id, pid)?;
        self.registry.set_status(&meta.thread_id, ThreadStatus::Running)?;
        info!(thread = %meta.thread_id, pid, detach, "thread launched");

        if detach {
            return Ok(SpawnOutcome {
                thread_id: meta.thread_id.clone(),
                pid: Some(pid),
                status: ThreadStatus::Running,
                result: None,
            });
        }

        // Synchronous mode blocks until the chain terminal finishes.
        let timeout = std::time::Duration::from_secs(meta.limits.duration_s.saturating_add(60));
        let report = self.wait(&[meta.thread_id.clone()], timeout).await?;
        let outcome = report
            .results
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("wait returned no outcome"))?;
        Ok(SpawnOutcome {
            thread_id: meta.thread_id.clone(),
            pid: Some(pid),
            status: outcome.status,
            result: outcome.result,
        })
    }

    /// Write the cancellation sentinel; the harness observes it at the
    /// next turn boundary.
    pub fn cancel(&self, thread_id: &str) -> Result<()> {
        let dir = self.thread_dir(thread_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(CANCEL_SENTINEL), b"cancel\n")?;
        info!(thread = thread_id, "cancellation requested");
        Ok(())
    }

    /// OS-level kill, graceful then forced, then finalize bookkeeping.
    pub async fn kill(&self, thread_id: &str) -> Result<()> {
        let meta = self.registry.get(thread_id)?;
        if let Some(pid) = meta.pid {
            self.driver
                .kill_graceful_then_force(pid, std::time::Duration::from_secs(5))
                .await?;
        }
        if meta.status.can_transition(ThreadStatus::Cancelled) {
            self.registry.set_status(thread_id, ThreadStatus::Cancelled)?;
        }
        self.ledger.settle(thread_id)?;
        Ok(())
    }

    fn mint_thread_id(&self, directive: &ArtifactId) -> Result<String> {
        let name = directive.name();
        let seq = self.registry.next_seq(name)?;
        Ok(format!("{name}-{seq:04}"))
    }

    /// Directive limits capped by the parent: count axes by what the
    /// parent has left, the spend axis by unreserved ledger headroom.
    /// Explicit overrides must stay within the parent's hard caps; the
    /// ledger has the final word on whether they fit.
    fn effective_limits(
        &self,
        directive: &Artifact,
        parent: Option<&ThreadMeta>,
        overrides: Option<&Limits>,
    ) -> Result<Limits> {
        let declared = limits_from_meta(directive);
        let Some(parent) = parent else {
            return match overrides {
                Some(ov) if !ov.within(&declared) => Err(Error::validation(
                    "limit overrides exceed the directive's declared limits",
                )),
                Some(ov) => Ok(*ov),
                None => Ok(declared),
            };
        };

        if parent.limits.depth == 0 {
            return Err(Error::limit("depth", 0, 0));
        }
        let spawned = self.registry.list_children(&parent.thread_id)?.len() as u32;
        if spawned >= parent.limits.spawns {
            return Err(Error::limit("spawns", spawned, parent.limits.spawns));
        }

        let parent_caps = Limits {
            turns: parent.limits.turns.saturating_sub(parent.cost.turns_used),
            tokens: parent.limits.tokens.saturating_sub(parent.cost.total_tokens()),
            spend: parent.limits.spend,
            spawns: parent.limits.spawns,
            duration_s: parent.limits.duration_s,
            depth: parent.limits.depth - 1,
        };

        let mut effective = declared.capped_by(&parent_caps);
        if let Some(ov) = overrides {
            // Depth is structural, not an ask; clamp it instead of
            // rejecting overrides that left it defaulted.
            let mut ov = *ov;
            ov.depth = ov.depth.min(parent_caps.depth);
            if !ov.within(&parent_caps) {
                return Err(Error::validation(
                    "limit overrides exceed the parent's caps",
                ));
            }
            effective = ov;
        } else {
            // Fit the default spend ask to what is actually unreserved.
            let headroom = self.ledger.entry(&parent.thread_id)?.remaining();
            effective.spend = effective.spend.min(headroom);
        }
        Ok(effective)
    }

    /// Declared permissions win; otherwise the child inherits the parent's
    /// capabilities; a parentless thread with no declaration gets nothing
    /// (fail-closed). Attenuation is enforced against the parent.
    fn derive_capabilities(
        &self,
        directive: &Artifact,
        parent: Option<&ThreadMeta>,
    ) -> Result<CapabilitySet> {
        let declared = directive.metadata.get_str_list("permissions");
        let capabilities = if !declared.is_empty() {
            CapabilitySet::parse_all(&declared)?
        } else if let Some(parent) = parent {
            parent.capabilities.clone()
        } else {
            CapabilitySet::default()
        };

        if let Some(parent) = parent {
            if !parent.capabilities.covers(&capabilities) {
                let offending = capabilities
                    .iter()
                    .find(|c| !parent.capabilities.covers(&CapabilitySet::new(vec![(*c).clone()])))
                    .map(|c| c.pattern())
                    .unwrap_or_default();
                return Err(Error::PermissionDenied {
                    required: format!("{offending} (exceeds parent capabilities)"),
                });
            }
        }
        Ok(capabilities)
    }

    /// Every declared capability is classified; `block` tiers refuse to
    /// start without a matching acknowledgment, `acknowledge_required`
    /// tiers log a warning.
    fn classify_risk(&self, directive: &Artifact, capabilities: &CapabilitySet) -> Result<()> {
        let acknowledged = directive.metadata.get_str_list("acknowledge");
        for capability in capabilities.iter() {
            let tier = self.risk.classify(capability);
            let acked = acknowledged.iter().any(|a| a == tier.as_str());
            match RiskTable::policy(tier) {
                RiskPolicy::Allow => {}
                RiskPolicy::AcknowledgeRequired if acked => {}
                RiskPolicy::AcknowledgeRequired => {
                    warn!(capability = %capability, %tier, directive = %directive.id,
                        "unacknowledged capability at acknowledge-required tier");
                }
                RiskPolicy::Block if acked => {}
                RiskPolicy::Block => {
                    return Err(Error::RiskBlocked {
                        capability: capability.pattern(),
                        tier: tier.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parse a directive's `limits` mapping, falling back to defaults per axis.
pub fn limits_from_meta(directive: &Artifact) -> Limits {
    let defaults = Limits::default();
    let Some(map) = directive.metadata.get_map("limits") else {
        return defaults;
    };
    Limits {
        turns: map.get("turns").and_then(Value::as_u64).map(|v| v as u32).unwrap_or(defaults.turns),
        tokens: map.get("tokens").and_then(Value::as_u64).unwrap_or(defaults.tokens),
        spend: map.get("spend").and_then(Value::as_f64).unwrap_or(defaults.spend),
        spawns: map.get("spawns").and_then(Value::as_u64).map(|v| v as u32).unwrap_or(defaults.spawns),
        duration_s: map.get("duration_s").and_then(Value::as_u64).unwrap_or(defaults.duration_s),
        depth: map.get("depth").and_then(Value::as_u64).map(|v| v as u32).unwrap_or(defaults.depth),
    }
}
