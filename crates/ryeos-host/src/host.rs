//! Host assembly
//!
//! Explicit `init(config)` / `shutdown()`; all state lives behind handles
//! passed down into the subsystems, never in globals.

use ryeos_chain::{Executor, PrimitiveRegistry};
use ryeos_core::Result;
use ryeos_store::keys::SigningKey;
use ryeos_store::signer::Signer;
use ryeos_store::trust::TRUSTED_KEYS_DIR;
use ryeos_store::{framing_for_extension, Resolver, SystemBundle, TierPaths, TrustStore};
use ryeos_threads::{BudgetLedger, Orchestrator, ProcessDriver, ThreadRegistry, TokioProcessDriver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Debug, Default)]
pub struct HostConfig {
    /// Project tier root (absent outside a project).
    pub project_dir: Option<PathBuf>,
    /// User tier root; defaults to `RYE_USER_DIR` or `~/.rye`.
    pub user_dir: Option<PathBuf>,
    /// System bundles, highest precedence first.
    pub bundles: Vec<SystemBundle>,
    /// Override for the detached thread runner command.
    pub runner: Option<Vec<String>>,
}

pub struct Host {
    pub resolver: Arc<Resolver>,
    pub executor: Arc<Executor>,
    pub orchestrator: Arc<Orchestrator>,
    pub signing_key: Arc<SigningKey>,
}

impl Host {
    pub fn init(config: HostConfig) -> Result<Self> {
        Self::init_with_driver(config, Arc::new(TokioProcessDriver))
    }

    pub fn init_with_driver(config: HostConfig, driver: Arc<dyn ProcessDriver>) -> Result<Self> {
        let tiers = match config.user_dir.clone() {
            Some(user) => TierPaths {
                project: config.project_dir.clone(),
                user,
                bundles: config.bundles.clone(),
            },
            None => TierPaths::discover(config.project_dir.clone(), config.bundles.clone()),
        };
        std::fs::create_dir_all(&tiers.user)?;

        let signing_key = Arc::new(SigningKey::load_or_generate(&tiers.user)?);
        publish_identity(&tiers, &signing_key)?;

        let mut trust = TrustStore::load(&tiers.all_roots(), &tiers.user);
        // The local key is always trusted for its own artifacts.
        trust.insert(
            signing_key.fingerprint().to_string(),
            signing_key.public_key_bytes().to_vec(),
        );

        let resolver = Arc::new(Resolver::new(tiers, trust));
        let executor = Arc::new(Executor::new(resolver.clone(), PrimitiveRegistry::builtin()));

        let threads_dir = resolver.tiers.writable_root().join("threads");
        let registry = Arc::new(ThreadRegistry::open(&threads_dir)?);
        let ledger = Arc::new(BudgetLedger::open(&threads_dir)?);
        let mut orchestrator = Orchestrator::new(
            registry,
            ledger,
            resolver.clone(),
            driver,
            threads_dir,
        );
        if let Some(runner) = config.runner {
            orchestrator = orchestrator.with_runner(runner);
        }

        info!(
            user_tier = %resolver.tiers.user.display(),
            bundles = resolver.tiers.bundles.len(),
            fingerprint = signing_key.fingerprint(),
            "host initialized"
        );
        Ok(Self {
            resolver,
            executor,
            orchestrator: Arc::new(orchestrator),
            signing_key,
        })
    }

    /// Nothing buffers outside the embedded stores; shutdown is dropping
    /// the handles.
    pub fn shutdown(self) {
        info!("host shut down");
    }
}

/// Write the local identity document into the user tier's trusted_keys/
/// so sibling processes (and future sessions) trust this key.
fn publish_identity(tiers: &TierPaths, key: &SigningKey) -> Result<()> {
    let dir = tiers.user.join(TRUSTED_KEYS_DIR);
    let path = dir.join(format!("{}.md", key.fingerprint()));
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(&dir)?;
    let body = format!(
        "---\nfingerprint: {}\npublic_key: {}\nowner: local\n---\n\nLocal host signing identity.\n",
        key.fingerprint(),
        key.public_key_b64(),
    );
    let signed = Signer::new(key).sign_content(&body, framing_for_extension("md"));
    std::fs::write(&path, signed)?;
    info!(path = %path.display(), "published local identity document");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_publishes_trusted_identity() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig {
            user_dir: Some(dir.path().join("user")),
            ..HostConfig::default()
        };
        let host = Host::init(config.clone()).unwrap();
        let fp = host.signing_key.fingerprint().to_string();
        host.shutdown();

        // A second init loads the identity document from disk.
        let host = Host::init(config).unwrap();
        assert_eq!(host.signing_key.fingerprint(), fp);
        assert!(host.resolver.trust.contains(&fp));
    }
}
