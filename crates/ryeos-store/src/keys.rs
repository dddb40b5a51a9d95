//! Local signing key management
//!
//! One Ed25519 keypair per host identity, stored as PKCS#8 under the user
//! tier (`keys/signing.p8`). The fingerprint is the first 16 hex chars of
//! the SHA-256 of the public key bytes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use ryeos_core::{Error, Result};
use std::path::{Path, PathBuf};

pub const KEY_FILE: &str = "keys/signing.p8";

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn fingerprint_of(public_key: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, public_key);
    to_hex(digest.as_ref())[..16].to_string()
}

pub struct SigningKey {
    keypair: Ed25519KeyPair,
    fingerprint: String,
    path: PathBuf,
}

impl SigningKey {
    /// Load the key from `<user_dir>/keys/signing.p8`.
    pub fn load(user_dir: &Path) -> Result<Self> {
        let path = user_dir.join(KEY_FILE);
        let pkcs8 = std::fs::read(&path).map_err(|e| {
            Error::not_found(format!("signing key at {}: {e}", path.display()))
        })?;
        Self::from_pkcs8(&pkcs8, path)
    }

    /// Load the key, generating and persisting a fresh one when absent.
    pub fn load_or_generate(user_dir: &Path) -> Result<Self> {
        let path = user_dir.join(KEY_FILE);
        if path.exists() {
            return Self::load(user_dir);
        }
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| Error::internal("ed25519 key generation failed"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, document.as_ref())?;
        tracing::info!(path = %path.display(), "generated new signing key");
        Self::from_pkcs8(document.as_ref(), path)
    }

    fn from_pkcs8(pkcs8: &[u8], path: PathBuf) -> Result<Self> {
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|_| Error::validation(format!("invalid signing key at {}", path.display())))?;
        let fingerprint = fingerprint_of(keypair.public_key().as_ref());
        Ok(Self { keypair, fingerprint, path })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        self.keypair.public_key().as_ref()
    }

    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public_key_bytes())
    }

    /// Sign a message, returning base64url signature bytes.
    pub fn sign_b64(&self, message: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(self.keypair.sign(message).as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generate_then_load_is_stable() {
        let dir = TempDir::new().unwrap();
        let first = SigningKey::load_or_generate(dir.path()).unwrap();
        let second = SigningKey::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.fingerprint().len(), 16);
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        match SigningKey::load(dir.path()) {
            Err(err) => assert_eq!(err.kind(), "NotFound"),
            Ok(_) => panic!("expected missing key load to fail"),
        }
    }
}
