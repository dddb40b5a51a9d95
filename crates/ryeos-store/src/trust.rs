//! Trust store — fingerprint → public key material
//!
//! Keys come from signed identity documents in `trusted_keys/` directories
//! across the three tiers. An identity document is a markdown artifact
//! whose metadata carries `fingerprint` and `public_key`; its own
//! signature must verify against the embedded key (self-signed) or an
//! already-trusted one. Registry keys are pinned on first use.

use crate::sigline;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::signature::{UnparsedPublicKey, ED25519};
use ryeos_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const TRUSTED_KEYS_DIR: &str = "trusted_keys";
const PIN_FILE: &str = "registry_pins.json";

#[derive(Default)]
pub struct TrustStore {
    keys: BTreeMap<String, Vec<u8>>,
    /// Registry name → pinned fingerprint (trust on first use).
    pins: BTreeMap<String, String>,
    pin_path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Default)]
struct PinFile {
    pins: BTreeMap<String, String>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load identity documents from `<root>/trusted_keys/` for every given
    /// tier root, lowest precedence first. Malformed documents are skipped
    /// with a warning; they must never poison the store.
    pub fn load(tier_roots: &[PathBuf], user_dir: &Path) -> Self {
        let mut store = Self {
            pin_path: Some(user_dir.join(PIN_FILE)),
            ..Self::default()
        };
        for root in tier_roots {
            let dir = root.join(TRUSTED_KEYS_DIR);
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                match store.load_identity_doc(&path) {
                    Ok(fp) => debug!(fingerprint = %fp, path = %path.display(), "trusted key loaded"),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping identity document"),
                }
            }
        }
        if let Some(path) = &store.pin_path {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Ok(file) = serde_json::from_str::<PinFile>(&raw) {
                    store.pins = file.pins;
                }
            }
        }
        store
    }

    /// Parse and admit one identity document.
    fn load_identity_doc(&mut self, path: &Path) -> Result<String> {
        let content = std::fs::read_to_string(path)?;
        let (_, sig_line, body) = sigline::split_content(&content)?;
        let sig = sigline::parse_line(sig_line)?;
        if sig.is_placeholder() {
            return Err(Error::integrity("identity document is unsigned"));
        }

        let meta = parse_identity_meta(&body)?;
        let key_bytes = URL_SAFE_NO_PAD
            .decode(&meta.public_key)
            .map_err(|_| Error::integrity("identity document public_key is not base64url"))?;
        let actual_fp = crate::keys::fingerprint_of(&key_bytes);
        if actual_fp != meta.fingerprint {
            return Err(Error::integrity(format!(
                "identity fingerprint mismatch: declared {}, derived {}",
                meta.fingerprint, actual_fp
            )));
        }

        // Integrity of the doc itself: recompute hash, then verify with the
        // embedded key (self-signed) or an already-trusted key.
        let hash = crate::signer::content_hash(&body);
        if hash != sig.content_hash {
            return Err(Error::integrity("identity document hash mismatch"));
        }
        let signer_key = if sig.key_fingerprint == actual_fp {
            &key_bytes
        } else {
            self.keys
                .get(&sig.key_fingerprint)
                .ok_or_else(|| Error::integrity(format!(
                    "identity document signed by unknown key {}",
                    sig.key_fingerprint
                )))?
        };
        verify_raw(signer_key, &sig.content_hash, &sig.sig_b64)?;

        self.keys.insert(meta.fingerprint.clone(), key_bytes);
        Ok(meta.fingerprint)
    }

    pub fn insert(&mut self, fingerprint: String, public_key: Vec<u8>) {
        self.keys.insert(fingerprint, public_key);
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.keys.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify a signature produced over a content hash by a trusted key.
    pub fn verify(&self, fingerprint: &str, content_hash: &str, sig_b64: &str) -> Result<()> {
        let key = self.keys.get(fingerprint).ok_or_else(|| {
            Error::integrity(format!("key fingerprint not in trust store: {fingerprint}"))
        })?;
        verify_raw(key, content_hash, sig_b64)
    }

    /// TOFU: pin a registry key on first pull; later pulls must match.
    pub fn pin_registry(&mut self, registry: &str, fingerprint: &str) -> Result<()> {
        match self.pins.get(registry) {
            Some(pinned) if pinned == fingerprint => Ok(()),
            Some(pinned) => Err(Error::integrity(format!(
                "registry {registry} key changed: pinned {pinned}, offered {fingerprint}"
            ))),
            None => {
                self.pins.insert(registry.to_string(), fingerprint.to_string());
                if let Some(path) = &self.pin_path {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let file = PinFile { pins: self.pins.clone() };
                    std::fs::write(path, serde_json::to_vec_pretty(&file)?)?;
                }
                Ok(())
            }
        }
    }

    pub fn pinned_fingerprint(&self, registry: &str) -> Option<&str> {
        self.pins.get(registry).map(String::as_str)
    }
}

struct IdentityMeta {
    fingerprint: String,
    public_key: String,
}

/// Identity documents use the workflow/knowledge front-matter block.
fn parse_identity_meta(body: &str) -> Result<IdentityMeta> {
    let meta = crate::extractor::parse_front_matter(body)?;
    let fingerprint = meta
        .get_str("fingerprint")
        .ok_or_else(|| Error::validation("identity document missing 'fingerprint'"))?
        .to_string();
    let public_key = meta
        .get_str("public_key")
        .ok_or_else(|| Error::validation("identity document missing 'public_key'"))?
        .to_string();
    Ok(IdentityMeta { fingerprint, public_key })
}

/// Ed25519 verification over the hex content hash string.
fn verify_raw(public_key: &[u8], content_hash: &str, sig_b64: &str) -> Result<()> {
    let sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| Error::integrity("signature bytes are not base64url"))?;
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(content_hash.as_bytes(), &sig)
        .map_err(|_| Error::integrity("signature verification failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningKey;
    use tempfile::TempDir;

    #[test]
    fn verify_roundtrip() {
        let dir = TempDir::new().unwrap();
        let key = SigningKey::load_or_generate(dir.path()).unwrap();
        let mut store = TrustStore::new();
        store.insert(key.fingerprint().to_string(), key.public_key_bytes().to_vec());

        let hash = "ab".repeat(32);
        let sig = key.sign_b64(hash.as_bytes());
        assert!(store.verify(key.fingerprint(), &hash, &sig).is_ok());
        assert!(store.verify(key.fingerprint(), &"cd".repeat(32), &sig).is_err());
        assert!(store.verify("ffffffffffffffff", &hash, &sig).is_err());
    }

    #[test]
    fn tofu_pin_rejects_key_change() {
        let dir = TempDir::new().unwrap();
        let mut store = TrustStore::load(&[], dir.path());
        store.pin_registry("main", "aaaa000011112222").unwrap();
        assert!(store.pin_registry("main", "aaaa000011112222").is_ok());
        let err = store.pin_registry("main", "bbbb000011112222").unwrap_err();
        assert_eq!(err.kind(), "IntegrityError");

        // Pins survive a reload.
        let store2 = TrustStore::load(&[], dir.path());
        assert_eq!(store2.pinned_fingerprint("main"), Some("aaaa000011112222"));
    }
}
