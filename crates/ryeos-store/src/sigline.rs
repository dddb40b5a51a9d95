//! Signature line parsing and rendering
//!
//! Line 1 of every artifact (after an optional shebang) carries the
//! signature payload in the file's native comment syntax:
//!
//! ```text
//! <prefix>rye:signed:<ISO-8601 UTC>:<64-hex hash>:<b64url sig>:<16-hex fp>[|registry@<user>]<suffix>
//! ```
//!
//! Unsigned placeholder: `rye:signed:<ts>:placeholder:unsigned:unsigned`.
//! The timestamp itself contains colons, so the payload is split from the
//! right: fingerprint, signature, and hash never contain one.

use ryeos_core::{Error, Result, SignatureInfo};

pub const SIG_MAGIC: &str = "rye:signed:";

/// Comment framing around the signature payload, keyed by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Framing {
    pub prefix: &'static str,
    pub suffix: &'static str,
}

pub fn framing_for_extension(ext: &str) -> Framing {
    match ext {
        "md" => Framing { prefix: "<!-- ", suffix: " -->" },
        "yaml" | "yml" => Framing { prefix: "# ", suffix: "" },
        _ => Framing { prefix: "# ", suffix: "" },
    }
}

/// Split raw file content into (optional shebang, signature line, body).
///
/// The body is everything except the signature line, shebang included;
/// the content hash is computed over exactly those bytes.
pub fn split_content(content: &str) -> Result<(Option<&str>, &str, String)> {
    let mut rest = content;
    let mut shebang = None;
    if rest.starts_with("#!") {
        let end = rest.find('\n').unwrap_or(rest.len());
        shebang = Some(&rest[..end]);
        rest = rest.get(end + 1..).unwrap_or("");
    }
    let line_end = rest.find('\n').unwrap_or(rest.len());
    let sig_line = &rest[..line_end];
    if !sig_line.contains(SIG_MAGIC) {
        return Err(Error::integrity("missing signature line"));
    }
    let body_rest = rest.get(line_end + 1..).unwrap_or("");
    let body = match shebang {
        Some(sb) => format!("{sb}\n{body_rest}"),
        None => body_rest.to_string(),
    };
    Ok((shebang, sig_line, body))
}

/// Parse a signature line (with arbitrary comment framing) into its payload.
pub fn parse_line(line: &str) -> Result<SignatureInfo> {
    let start = line
        .find(SIG_MAGIC)
        .ok_or_else(|| Error::integrity("missing signature line"))?;
    let payload = &line[start + SIG_MAGIC.len()..];
    // Strip comment suffix: the payload alphabet is [A-Za-z0-9_:|@.+-],
    // so cut at the first character outside it.
    let payload_end = payload
        .find(|c: char| !(c.is_ascii_alphanumeric() || ":|@._+-=".contains(c)))
        .unwrap_or(payload.len());
    let payload = &payload[..payload_end];

    let (payload, provenance) = match payload.split_once('|') {
        Some((head, prov)) => {
            let prov = prov
                .strip_prefix("registry@")
                .ok_or_else(|| Error::integrity(format!("malformed provenance: {prov}")))?;
            (head, Some(prov.to_string()))
        }
        None => (payload, None),
    };

    // Timestamp contains ':'; everything after it does not. Split from the right.
    let mut tail = payload.rsplitn(4, ':');
    let key_fingerprint = tail.next().unwrap_or_default().to_string();
    let sig_b64 = tail.next().unwrap_or_default().to_string();
    let content_hash = tail.next().unwrap_or_default().to_string();
    let timestamp = tail.next().unwrap_or_default().to_string();
    if timestamp.is_empty() || content_hash.is_empty() || sig_b64.is_empty() || key_fingerprint.is_empty() {
        return Err(Error::integrity(format!("malformed signature line: {line}")));
    }

    Ok(SignatureInfo {
        timestamp,
        content_hash,
        sig_b64,
        key_fingerprint,
        provenance,
    })
}

/// Render a signature payload with the given framing. Local signing never
/// emits the registry provenance suffix.
pub fn render_line(sig: &SignatureInfo, framing: Framing) -> String {
    let provenance = match &sig.provenance {
        Some(user) => format!("|registry@{user}"),
        None => String::new(),
    };
    format!(
        "{}{SIG_MAGIC}{}:{}:{}:{}{}{}",
        framing.prefix,
        sig.timestamp,
        sig.content_hash,
        sig.sig_b64,
        sig.key_fingerprint,
        provenance,
        framing.suffix,
    )
}

/// Placeholder line for newly created, not-yet-signed artifacts.
pub fn placeholder_line(timestamp: &str, framing: Framing) -> String {
    format!(
        "{}{SIG_MAGIC}{timestamp}:placeholder:unsigned:unsigned{}",
        framing.prefix, framing.suffix,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "2026-01-15T08:30:00Z";
    const HASH: &str = "a2f61c8e10b34c6d9e5f01723a8b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d";

    fn sig() -> SignatureInfo {
        SignatureInfo {
            timestamp: TS.into(),
            content_hash: HASH.into(),
            sig_b64: "c2lnbmF0dXJl".into(),
            key_fingerprint: "0123456789abcdef".into(),
            provenance: None,
        }
    }

    #[test]
    fn roundtrip_yaml_framing() {
        let line = render_line(&sig(), framing_for_extension("yaml"));
        assert!(line.starts_with("# rye:signed:"));
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed, sig());
    }

    #[test]
    fn roundtrip_md_framing() {
        let line = render_line(&sig(), framing_for_extension("md"));
        assert!(line.ends_with(" -->"));
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.timestamp, TS);
        assert_eq!(parsed.content_hash, HASH);
    }

    #[test]
    fn registry_provenance_suffix() {
        let mut s = sig();
        s.provenance = Some("leo".into());
        let line = render_line(&s, framing_for_extension("yaml"));
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.provenance.as_deref(), Some("leo"));
    }

    #[test]
    fn placeholder_never_looks_signed() {
        let line = placeholder_line(TS, framing_for_extension("md"));
        let parsed = parse_line(&line).unwrap();
        assert!(parsed.is_placeholder());
    }

    #[test]
    fn split_keeps_shebang_in_body() {
        let content = format!(
            "#!/usr/bin/env python3\n{}\nprint('hi')\n",
            render_line(&sig(), framing_for_extension("yaml"))
        );
        let (shebang, line, body) = split_content(&content).unwrap();
        assert_eq!(shebang, Some("#!/usr/bin/env python3"));
        assert!(line.contains(SIG_MAGIC));
        assert_eq!(body, "#!/usr/bin/env python3\nprint('hi')\n");
    }

    #[test]
    fn missing_line_is_integrity_error() {
        let err = split_content("just a file\n").unwrap_err();
        assert_eq!(err.kind(), "IntegrityError");
    }
}
