//! Three-tier artifact resolution
//!
//! Precedence: project → user → system bundles, first match wins. Within a
//! tier the kind's registered extensions are tried in order. Integrity is
//! verified before anything is returned; there is no fallback past a
//! tampered file.

use crate::extractor::ExtractorRegistry;
use crate::signer;
use crate::trust::TrustStore;
use ryeos_core::{Artifact, ArtifactId, ArtifactKind, Error, Result, Space};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment override for the user tier root.
pub const USER_DIR_ENV: &str = "RYE_USER_DIR";

/// One independent system bundle. A bundle may restrict itself to the
/// category prefixes it owns; an unrestricted bundle serves everything.
#[derive(Clone, Debug)]
pub struct SystemBundle {
    pub name: String,
    pub root: PathBuf,
    pub categories: Option<Vec<String>>,
}

impl SystemBundle {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), root: root.into(), categories: None }
    }

    fn owns(&self, id: &ArtifactId) -> bool {
        match &self.categories {
            None => true,
            Some(prefixes) => prefixes.iter().any(|p| {
                id.category() == p || id.category().starts_with(&format!("{p}/"))
            }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TierPaths {
    pub project: Option<PathBuf>,
    pub user: PathBuf,
    pub bundles: Vec<SystemBundle>,
}

impl TierPaths {
    /// Resolve tier roots: the user tier honors `RYE_USER_DIR`, defaulting
    /// to `~/.rye`.
    pub fn discover(project: Option<PathBuf>, bundles: Vec<SystemBundle>) -> Self {
        let user = std::env::var_os(USER_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".rye")))
            .unwrap_or_else(|| PathBuf::from(".rye"));
        Self { project, user, bundles }
    }

    /// Spaces in resolution precedence order.
    pub fn spaces(&self) -> Vec<Space> {
        let mut out = Vec::new();
        if self.project.is_some() {
            out.push(Space::Project);
        }
        out.push(Space::User);
        for bundle in &self.bundles {
            out.push(Space::System(bundle.name.clone()));
        }
        out
    }

    pub fn root_of(&self, space: &Space) -> Option<&Path> {
        match space {
            Space::Project => self.project.as_deref(),
            Space::User => Some(&self.user),
            Space::System(name) => self
                .bundles
                .iter()
                .find(|b| &b.name == name || (name.is_empty() && self.bundles.len() == 1))
                .map(|b| b.root.as_path()),
        }
    }

    /// All tier roots, lowest precedence first (trust store load order).
    pub fn all_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.bundles.iter().map(|b| b.root.clone()).collect();
        roots.push(self.user.clone());
        if let Some(p) = &self.project {
            roots.push(p.clone());
        }
        roots
    }

    /// Preferred writable root: project when present, else user. The
    /// system tier is never written.
    pub fn writable_root(&self) -> &Path {
        self.project.as_deref().unwrap_or(&self.user)
    }
}

pub struct Resolver {
    pub tiers: TierPaths,
    pub extractors: ExtractorRegistry,
    pub trust: TrustStore,
}

impl Resolver {
    pub fn new(tiers: TierPaths, trust: TrustStore) -> Self {
        Self { tiers, extractors: ExtractorRegistry::default(), trust }
    }

    /// On-disk path of `(space, kind, id)` for a given extension.
    pub fn path_for(&self, space: &Space, kind: ArtifactKind, id: &ArtifactId, ext: &str) -> Option<PathBuf> {
        let root = self.tiers.root_of(space)?;
        Some(root.join(kind.dir_name()).join(format!("{}.{ext}", id.as_str())))
    }

    /// Locate the file for `(kind, id)`, honoring tier precedence when no
    /// space is pinned.
    pub fn find_file(&self, kind: ArtifactKind, id: &ArtifactId, space: Option<&Space>) -> Result<(Space, PathBuf)> {
        let spaces = match space {
            Some(s) => vec![s.clone()],
            None => self.tiers.spaces(),
        };
        let extractor = self.extractors.get(kind);
        for candidate in spaces {
            if let Space::System(name) = &candidate {
                if let Some(bundle) = self.tiers.bundles.iter().find(|b| &b.name == name) {
                    if !bundle.owns(id) {
                        continue;
                    }
                }
            }
            for ext in extractor.extensions {
                if let Some(path) = self.path_for(&candidate, kind, id, ext) {
                    if path.is_file() {
                        return Ok((candidate, path));
                    }
                }
            }
        }
        Err(Error::not_found(format!(
            "{kind} {id}{}",
            space.map(|s| format!(" in {s}")).unwrap_or_default()
        )))
    }

    /// Resolve and fully verify an artifact: integrity first, then
    /// metadata extraction and kind validation.
    pub fn resolve(&self, kind: ArtifactKind, id: &ArtifactId, space: Option<&Space>) -> Result<Artifact> {
        let (space, path) = self.find_file(kind, id, space)?;
        let content = std::fs::read_to_string(&path)?;
        let (sig, body) = signer::verify_content(&content, &self.trust)
            .map_err(|e| annotate_integrity(e, id, &path))?;
        let extractor = self.extractors.get(kind);
        let metadata = extractor.parse(&body)?;
        extractor.validate(id, &metadata)?;
        let version = metadata.version();
        debug!(%kind, %id, %space, "resolved artifact");
        Ok(Artifact {
            id: id.clone(),
            kind,
            space,
            version,
            body,
            metadata,
            signature: sig,
            path,
        })
    }

    /// Raw read for the sign verb: no verification, artifact may carry a
    /// placeholder or stale signature.
    pub fn read_raw(&self, kind: ArtifactKind, id: &ArtifactId, space: Option<&Space>) -> Result<(Space, PathBuf, String)> {
        let (space, path) = self.find_file(kind, id, space)?;
        let content = std::fs::read_to_string(&path)?;
        Ok((space, path, content))
    }

    /// Copy an artifact verbatim (signature preserved) into another tier.
    ///
    /// Move matrix: system→project, system→user, user→project and
    /// project→user are allowed; nothing may be written into the system
    /// tier and a tier never copies onto itself.
    pub fn copy_between(&self, kind: ArtifactKind, id: &ArtifactId, from: Option<&Space>, dest: &Space) -> Result<PathBuf> {
        let (src_space, src_path) = self.find_file(kind, id, from)?;
        if dest.is_system() {
            return Err(Error::validation("system tier is read-only"));
        }
        if src_space.rank() == dest.rank() {
            return Err(Error::validation(format!(
                "artifact {id} already lives in {src_space}"
            )));
        }
        // Verify before propagating: a tampered file never crosses tiers.
        let content = std::fs::read_to_string(&src_path)?;
        signer::verify_content(&content, &self.trust)
            .map_err(|e| annotate_integrity(e, id, &src_path))?;

        let ext = src_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(self.extractors.get(kind).primary_extension());
        let dest_path = self
            .path_for(dest, kind, id, ext)
            .ok_or_else(|| Error::not_found(format!("tier root for {dest}")))?;
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest_path, content)?;
        debug!(%id, from = %src_space, to = %dest, "copied artifact between tiers");
        Ok(dest_path)
    }

    /// Enumerate `(space, id, path)` for a kind across the given spaces,
    /// higher tiers shadowing lower by id.
    pub fn enumerate(&self, kind: ArtifactKind, spaces: &[Space]) -> Vec<(Space, ArtifactId, PathBuf)> {
        let extractor = self.extractors.get(kind);
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for space in spaces {
            let root = match self.tiers.root_of(space) {
                Some(r) => r.join(kind.dir_name()),
                None => continue,
            };
            if !root.is_dir() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&root)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let ext = match path.extension().and_then(|e| e.to_str()) {
                    Some(e) if extractor.extensions.contains(&e) => e,
                    _ => continue,
                };
                let rel = match path.strip_prefix(&root) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let rel_str = rel.to_string_lossy();
                let id_str = rel_str
                    .strip_suffix(&format!(".{ext}"))
                    .unwrap_or(&rel_str)
                    .replace('\\', "/");
                let id = match ArtifactId::new(id_str) {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                if let Space::System(name) = space {
                    if let Some(bundle) = self.tiers.bundles.iter().find(|b| &b.name == name) {
                        if !bundle.owns(&id) {
                            continue;
                        }
                    }
                }
                if seen.insert(id.clone()) {
                    out.push((space.clone(), id, path.to_path_buf()));
                }
            }
        }
        out
    }
}

fn annotate_integrity(err: Error, id: &ArtifactId, path: &Path) -> Error {
    match err {
        Error::Integrity { reason } => Error::Integrity {
            reason: format!("{id} ({}): {reason}", path.display()),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningKey;
    use crate::sigline::framing_for_extension;
    use crate::signer::Signer;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        resolver: Resolver,
        key: SigningKey,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        let user = dir.path().join("user");
        let system = dir.path().join("system");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::create_dir_all(&user).unwrap();
        std::fs::create_dir_all(&system).unwrap();

        let key = SigningKey::load_or_generate(&user).unwrap();
        let mut trust = TrustStore::new();
        trust.insert(key.fingerprint().to_string(), key.public_key_bytes().to_vec());

        let tiers = TierPaths {
            project: Some(project),
            user,
            bundles: vec![SystemBundle::new("base", system)],
        };
        Fixture { resolver: Resolver::new(tiers, trust), key, _dir: dir }
    }

    fn write_signed(fx: &Fixture, space: &Space, kind: ArtifactKind, id: &str, body: &str) {
        let id = ArtifactId::new(id).unwrap();
        let ext = fx.resolver.extractors.get(kind).primary_extension();
        let path = fx.resolver.path_for(space, kind, &id, ext).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let signed = Signer::new(&fx.key).sign_content(body, framing_for_extension(ext));
        std::fs::write(path, signed).unwrap();
    }

    const TOOL_BODY: &str = "name: read\ncategory: files\nversion: 1.0.0\nruntime_ref: runtimes/script\n";

    #[test]
    fn project_shadows_user_shadows_system() {
        let fx = fixture();
        let id = ArtifactId::new("files/read").unwrap();
        write_signed(&fx, &Space::System("base".into()), ArtifactKind::Tool, "files/read", TOOL_BODY);
        let got = fx.resolver.resolve(ArtifactKind::Tool, &id, None).unwrap();
        assert_eq!(got.space, Space::System("base".into()));

        write_signed(&fx, &Space::User, ArtifactKind::Tool, "files/read", TOOL_BODY);
        let got = fx.resolver.resolve(ArtifactKind::Tool, &id, None).unwrap();
        assert_eq!(got.space, Space::User);

        write_signed(&fx, &Space::Project, ArtifactKind::Tool, "files/read", TOOL_BODY);
        let got = fx.resolver.resolve(ArtifactKind::Tool, &id, None).unwrap();
        assert_eq!(got.space, Space::Project);
    }

    #[test]
    fn tampered_file_is_integrity_error() {
        let fx = fixture();
        let id = ArtifactId::new("files/read").unwrap();
        write_signed(&fx, &Space::User, ArtifactKind::Tool, "files/read", TOOL_BODY);
        let path = fx
            .resolver
            .path_for(&Space::User, ArtifactKind::Tool, &id, "yaml")
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("1.0.0", "1.0.1")).unwrap();

        let err = fx.resolver.resolve(ArtifactKind::Tool, &id, None).unwrap_err();
        assert_eq!(err.kind(), "IntegrityError");
        assert!(err.to_string().contains("files/read"));
    }

    #[test]
    fn missing_artifact_is_not_found() {
        let fx = fixture();
        let id = ArtifactId::new("files/nope").unwrap();
        let err = fx.resolver.resolve(ArtifactKind::Tool, &id, None).unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn copy_matrix() {
        let fx = fixture();
        let id = ArtifactId::new("files/read").unwrap();
        write_signed(&fx, &Space::System("base".into()), ArtifactKind::Tool, "files/read", TOOL_BODY);

        // system → project allowed, signature preserved verbatim.
        fx.resolver
            .copy_between(ArtifactKind::Tool, &id, Some(&Space::System("base".into())), &Space::Project)
            .unwrap();
        let got = fx.resolver.resolve(ArtifactKind::Tool, &id, Some(&Space::Project)).unwrap();
        assert_eq!(got.space, Space::Project);

        // nothing writes into system.
        let err = fx
            .resolver
            .copy_between(ArtifactKind::Tool, &id, Some(&Space::Project), &Space::System("base".into()))
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn bundle_category_restriction() {
        let mut fx = fixture();
        fx.resolver.tiers.bundles[0].categories = Some(vec!["runtimes".into()]);
        write_signed(&fx, &Space::System("base".into()), ArtifactKind::Tool, "files/read", TOOL_BODY);
        let id = ArtifactId::new("files/read").unwrap();
        // The bundle does not own "files", so the artifact is invisible.
        assert!(fx.resolver.resolve(ArtifactKind::Tool, &id, None).is_err());
    }

    #[test]
    fn enumerate_shadows_by_id() {
        let fx = fixture();
        write_signed(&fx, &Space::System("base".into()), ArtifactKind::Tool, "files/read", TOOL_BODY);
        write_signed(&fx, &Space::Project, ArtifactKind::Tool, "files/read", TOOL_BODY);
        write_signed(&fx, &Space::System("base".into()), ArtifactKind::Tool, "files/list",
            "name: list\ncategory: files\nversion: 1.0.0\nruntime_ref: runtimes/script\n");

        let spaces = fx.resolver.tiers.spaces();
        let all = fx.resolver.enumerate(ArtifactKind::Tool, &spaces);
        assert_eq!(all.len(), 2);
        let read = all.iter().find(|(_, id, _)| id.as_str() == "files/read").unwrap();
        assert_eq!(read.0, Space::Project);
    }
}
