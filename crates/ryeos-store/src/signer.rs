//! Signing and verification of artifact content
//!
//! `sign` strips any existing signature line, hashes the remainder, signs
//! the hash, and prepends a fresh signature line in the kind's comment
//! syntax. `verify` recomputes the hash and checks the signature against
//! the trust store. Each failure mode is a distinct integrity error.

use crate::keys::{to_hex, SigningKey};
use crate::sigline::{self, Framing};
use crate::trust::TrustStore;
use chrono::{SecondsFormat, Utc};
use ring::digest::{digest, SHA256};
use ryeos_core::{Error, Result, SignatureInfo};

/// SHA-256 of the body with the signature line stripped, as 64 hex chars.
pub fn content_hash(body: &str) -> String {
    to_hex(digest(&SHA256, body.as_bytes()).as_ref())
}

pub struct Signer<'a> {
    key: &'a SigningKey,
}

impl<'a> Signer<'a> {
    pub fn new(key: &'a SigningKey) -> Self {
        Self { key }
    }

    /// Sign raw file content, returning the full new content. Any existing
    /// signature line (or placeholder) is replaced; a file with no
    /// signature line at all is treated as all-body. Signing twice yields
    /// the same content hash (timestamp and signature bytes may differ).
    pub fn sign_content(&self, content: &str, framing: Framing) -> String {
        let (shebang, body) = match sigline::split_content(content) {
            Ok((shebang, _, body)) => (shebang.map(String::from), body),
            // No signature line yet: the whole file is body.
            Err(_) => {
                if let Some(rest) = content.strip_prefix("#!") {
                    let end = rest.find('\n').map(|i| i + 2).unwrap_or(content.len());
                    (Some(content[..end].trim_end_matches('\n').to_string()), content.to_string())
                } else {
                    (None, content.to_string())
                }
            }
        };

        let hash = content_hash(&body);
        let sig = SignatureInfo {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            sig_b64: self.key.sign_b64(hash.as_bytes()),
            content_hash: hash,
            key_fingerprint: self.key.fingerprint().to_string(),
            provenance: None,
        };
        let line = sigline::render_line(&sig, framing);

        match shebang {
            Some(sb) => {
                // Body retains the shebang; on disk the signature line sits
                // between the shebang and the rest.
                let rest = body
                    .strip_prefix(sb.as_str())
                    .map(|r| r.strip_prefix('\n').unwrap_or(r))
                    .unwrap_or(&body);
                format!("{sb}\n{line}\n{rest}")
            }
            None => format!("{line}\n{body}"),
        }
    }
}

/// Verify raw file content against the trust store. Returns the parsed
/// signature and the body (signature line stripped).
pub fn verify_content(content: &str, trust: &TrustStore) -> Result<(SignatureInfo, String)> {
    let (_, sig_line, body) = sigline::split_content(content)?;
    let sig = sigline::parse_line(sig_line)?;
    if sig.is_placeholder() {
        return Err(Error::integrity("artifact is unsigned"));
    }
    let hash = content_hash(&body);
    if hash != sig.content_hash {
        return Err(Error::integrity(format!(
            "content hash mismatch: recorded {}, recomputed {}",
            sig.content_hash, hash
        )));
    }
    trust.verify(&sig.key_fingerprint, &sig.content_hash, &sig.sig_b64)?;
    Ok((sig, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigline::framing_for_extension;
    use tempfile::TempDir;

    fn fixtures() -> (TempDir, SigningKey, TrustStore) {
        let dir = TempDir::new().unwrap();
        let key = SigningKey::load_or_generate(dir.path()).unwrap();
        let mut trust = TrustStore::new();
        trust.insert(key.fingerprint().to_string(), key.public_key_bytes().to_vec());
        (dir, key, trust)
    }

    #[test]
    fn sign_then_verify() {
        let (_dir, key, trust) = fixtures();
        let signed = Signer::new(&key).sign_content(
            "name: read\ncategory: files\n",
            framing_for_extension("yaml"),
        );
        let (sig, body) = verify_content(&signed, &trust).unwrap();
        assert_eq!(sig.key_fingerprint, key.fingerprint());
        assert_eq!(body, "name: read\ncategory: files\n");
    }

    #[test]
    fn resign_is_idempotent_modulo_timestamp() {
        let (_dir, key, _trust) = fixtures();
        let signer = Signer::new(&key);
        let framing = framing_for_extension("md");
        let once = signer.sign_content("body text\n", framing);
        let twice = signer.sign_content(&once, framing);
        let h1 = sigline::parse_line(once.lines().next().unwrap()).unwrap();
        let h2 = sigline::parse_line(twice.lines().next().unwrap()).unwrap();
        assert_eq!(h1.content_hash, h2.content_hash);
    }

    #[test]
    fn one_byte_edit_fails_integrity() {
        let (_dir, key, trust) = fixtures();
        let signed = Signer::new(&key).sign_content("payload\n", framing_for_extension("md"));
        let tampered = signed.replace("payload", "paYload");
        let err = verify_content(&tampered, &trust).unwrap_err();
        assert_eq!(err.kind(), "IntegrityError");
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn untrusted_key_fails_distinctly() {
        let (_dir, key, _trust) = fixtures();
        let signed = Signer::new(&key).sign_content("payload\n", framing_for_extension("md"));
        let empty_trust = TrustStore::new();
        let err = verify_content(&signed, &empty_trust).unwrap_err();
        assert!(err.to_string().contains("not in trust store"));
    }

    #[test]
    fn placeholder_never_verifies() {
        let (_dir, _key, trust) = fixtures();
        let content = format!(
            "{}\nbody\n",
            sigline::placeholder_line("2026-01-01T00:00:00Z", framing_for_extension("md"))
        );
        let err = verify_content(&content, &trust).unwrap_err();
        assert!(err.to_string().contains("unsigned"));
    }

    #[test]
    fn shebang_is_hashed_with_body() {
        let (_dir, key, trust) = fixtures();
        let signer = Signer::new(&key);
        let signed = signer.sign_content("#!/usr/bin/env bash\necho hi\n", framing_for_extension("yaml"));
        assert!(signed.starts_with("#!/usr/bin/env bash\n# rye:signed:"));
        let (_, body) = verify_content(&signed, &trust).unwrap();
        assert_eq!(body, "#!/usr/bin/env bash\necho hi\n");
    }
}
