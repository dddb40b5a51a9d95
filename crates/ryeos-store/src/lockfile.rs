//! Chain lockfiles
//!
//! A lockfile pins one root tool's fully-resolved executor chain by
//! integrity hash. Lockfiles live under `lockfiles/` in the project tier
//! (user tier when no project is open); the system tier is read-only and
//! never holds one.

use ryeos_core::{ArtifactId, Error, Result, Space, Version};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const LOCKFILE_VERSION: u32 = 1;
pub const LOCKFILE_DIR: &str = "lockfiles";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lockfile {
    pub lockfile_version: u32,
    pub generated_at: String,
    pub root: LockRoot,
    pub resolved_chain: Vec<LockEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRoot {
    pub id: ArtifactId,
    pub version: Version,
    pub integrity: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockEntry {
    pub id: ArtifactId,
    pub space: Space,
    pub runtime_ref: String,
    pub integrity: String,
}

impl Lockfile {
    pub fn new(root: LockRoot, resolved_chain: Vec<LockEntry>, generated_at: String) -> Self {
        Self {
            lockfile_version: LOCKFILE_VERSION,
            generated_at,
            root,
            resolved_chain,
        }
    }

    /// `<tier root>/lockfiles/<id>@<version>.lock.json`
    pub fn path_under(tier_root: &Path, id: &ArtifactId, version: &Version) -> PathBuf {
        tier_root
            .join(LOCKFILE_DIR)
            .join(format!("{}@{}.lock.json", id.as_str(), version))
    }

    /// Load the pin for `(id, version)` if one exists in any writable tier,
    /// project first.
    pub fn load(roots: &[&Path], id: &ArtifactId, version: &Version) -> Result<Option<Lockfile>> {
        for root in roots {
            let path = Self::path_under(root, id, version);
            if !path.is_file() {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let lock: Lockfile = serde_json::from_str(&raw)
                .map_err(|e| Error::validation(format!("malformed lockfile {}: {e}", path.display())))?;
            if lock.lockfile_version != LOCKFILE_VERSION {
                return Err(Error::validation(format!(
                    "unsupported lockfile version {} at {}",
                    lock.lockfile_version,
                    path.display()
                )));
            }
            return Ok(Some(lock));
        }
        Ok(None)
    }

    pub fn write_under(&self, tier_root: &Path) -> Result<PathBuf> {
        let path = Self::path_under(tier_root, &self.root.id, &self.root.version);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn delete_under(tier_root: &Path, id: &ArtifactId, version: &Version) -> Result<bool> {
        let path = Self::path_under(tier_root, id, version);
        if path.is_file() {
            std::fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Lockfile {
        Lockfile::new(
            LockRoot {
                id: ArtifactId::new("files/read").unwrap(),
                version: "1.0.0".parse().unwrap(),
                integrity: "ab".repeat(32),
            },
            vec![LockEntry {
                id: ArtifactId::new("files/read").unwrap(),
                space: Space::System("base".into()),
                runtime_ref: "runtimes/script".into(),
                integrity: "ab".repeat(32),
            }],
            "2026-02-01T00:00:00Z".into(),
        )
    }

    #[test]
    fn write_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let lock = sample();
        let path = lock.write_under(dir.path()).unwrap();
        assert!(path.ends_with("lockfiles/files/read@1.0.0.lock.json"));

        let id = ArtifactId::new("files/read").unwrap();
        let version = "1.0.0".parse().unwrap();
        let loaded = Lockfile::load(&[dir.path()], &id, &version).unwrap().unwrap();
        assert_eq!(loaded.resolved_chain.len(), 1);
        assert_eq!(loaded.resolved_chain[0].space, Space::System("base".into()));

        assert!(Lockfile::delete_under(dir.path(), &id, &version).unwrap());
        assert!(Lockfile::load(&[dir.path()], &id, &version).unwrap().is_none());
    }

    #[test]
    fn absent_is_none() {
        let dir = TempDir::new().unwrap();
        let id = ArtifactId::new("files/read").unwrap();
        let loaded = Lockfile::load(&[dir.path()], &id, &"1.0.0".parse().unwrap()).unwrap();
        assert!(loaded.is_none());
    }
}
