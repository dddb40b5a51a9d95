//! Kind-specific extractors
//!
//! Every artifact kind registers `{extensions, framing, parser, validator}`.
//! The parser turns a body (signature line already stripped) into metadata;
//! the validator enforces kind constraints, including the 1:1 mapping
//! between the id's directory prefix and the `category` metadata field.

use crate::sigline::{framing_for_extension, Framing};
use ryeos_core::{ArtifactId, ArtifactKind, Error, Metadata, Result, PRIMITIVE_SENTINEL};
use serde_json::Value;
use std::collections::BTreeMap;

type ParserFn = fn(&str) -> Result<Metadata>;
type ValidatorFn = fn(&ArtifactId, &Metadata) -> Result<()>;

#[derive(Clone)]
pub struct Extractor {
    pub kind: ArtifactKind,
    /// Extension candidates in resolution priority order, no leading dot.
    pub extensions: &'static [&'static str],
    parser: ParserFn,
    validator: ValidatorFn,
}

impl Extractor {
    pub fn primary_extension(&self) -> &'static str {
        self.extensions[0]
    }

    pub fn framing(&self) -> Framing {
        framing_for_extension(self.primary_extension())
    }

    pub fn parse(&self, body: &str) -> Result<Metadata> {
        (self.parser)(body)
    }

    pub fn validate(&self, id: &ArtifactId, metadata: &Metadata) -> Result<()> {
        validate_category(id, metadata)?;
        (self.validator)(id, metadata)
    }
}

#[derive(Clone)]
pub struct ExtractorRegistry {
    by_kind: BTreeMap<ArtifactKind, Extractor>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut by_kind = BTreeMap::new();
        by_kind.insert(
            ArtifactKind::Workflow,
            Extractor {
                kind: ArtifactKind::Workflow,
                extensions: &["md"],
                parser: parse_front_matter,
                validator: validate_workflow,
            },
        );
        by_kind.insert(
            ArtifactKind::Tool,
            Extractor {
                kind: ArtifactKind::Tool,
                extensions: &["yaml", "yml"],
                parser: parse_yaml_body,
                validator: validate_tool,
            },
        );
        by_kind.insert(
            ArtifactKind::Knowledge,
            Extractor {
                kind: ArtifactKind::Knowledge,
                extensions: &["md"],
                parser: parse_front_matter,
                validator: validate_knowledge,
            },
        );
        Self { by_kind }
    }
}

impl ExtractorRegistry {
    pub fn get(&self, kind: ArtifactKind) -> &Extractor {
        // All three kinds are registered by construction.
        &self.by_kind[&kind]
    }
}

/// Parse an optional `---` front-matter block into metadata. Body text
/// after the block stays out of the metadata map.
pub fn parse_front_matter(body: &str) -> Result<Metadata> {
    let rest = match body.strip_prefix("---\n") {
        Some(rest) => rest,
        None => return Ok(Metadata::new()),
    };
    let end = rest
        .find("\n---")
        .ok_or_else(|| Error::validation("unterminated front-matter block"))?;
    yaml_to_metadata(&rest[..end])
}

/// Tool bodies are a single YAML mapping.
pub fn parse_yaml_body(body: &str) -> Result<Metadata> {
    yaml_to_metadata(body)
}

fn yaml_to_metadata(raw: &str) -> Result<Metadata> {
    if raw.trim().is_empty() {
        return Ok(Metadata::new());
    }
    let value: Value = serde_yaml::from_str(raw)
        .map_err(|e| Error::validation(format!("metadata is not valid YAML: {e}")))?;
    match value {
        Value::Object(map) => Ok(Metadata(map.into_iter().collect())),
        Value::Null => Ok(Metadata::new()),
        _ => Err(Error::validation("metadata must be a mapping")),
    }
}

/// The `category` field must equal the id's directory prefix.
fn validate_category(id: &ArtifactId, metadata: &Metadata) -> Result<()> {
    let declared = metadata.get_str("category").unwrap_or("");
    if declared != id.category() {
        return Err(Error::validation(format!(
            "category '{declared}' does not match id prefix '{}' for {id}",
            id.category()
        )));
    }
    Ok(())
}

fn validate_workflow(_id: &ArtifactId, metadata: &Metadata) -> Result<()> {
    if metadata.get_str("name").is_none() {
        return Err(Error::validation("workflow metadata missing 'name'"));
    }
    Ok(())
}

fn validate_tool(id: &ArtifactId, metadata: &Metadata) -> Result<()> {
    if metadata.get_str("name").is_none() {
        return Err(Error::validation(format!("tool {id} missing 'name'")));
    }
    let runtime_ref = metadata
        .get_str("runtime_ref")
        .ok_or_else(|| Error::validation(format!("tool {id} missing 'runtime_ref'")))?;
    if runtime_ref == PRIMITIVE_SENTINEL {
        // Terminal descriptor must name the primitive it drives.
        if metadata.get_str("primitive").is_none() {
            return Err(Error::validation(format!(
                "primitive descriptor {id} missing 'primitive'"
            )));
        }
    } else {
        ArtifactId::new(runtime_ref)
            .map_err(|_| Error::validation(format!("tool {id} has malformed runtime_ref '{runtime_ref}'")))?;
    }
    if metadata.version().is_none() {
        return Err(Error::validation(format!("tool {id} missing semantic 'version'")));
    }
    Ok(())
}

fn validate_knowledge(_id: &ArtifactId, _metadata: &Metadata) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ArtifactId {
        ArtifactId::new(s).unwrap()
    }

    #[test]
    fn front_matter_parses_and_leaves_body_out() {
        let meta = parse_front_matter("---\nname: guide\ncategory: docs\ntags: [a, b]\n---\n# Title\nText.\n").unwrap();
        assert_eq!(meta.get_str("name"), Some("guide"));
        assert_eq!(meta.get_str_list("tags"), vec!["a", "b"]);
        assert!(meta.get("Title").is_none());
    }

    #[test]
    fn no_front_matter_is_empty_metadata() {
        let meta = parse_front_matter("plain text\n").unwrap();
        assert!(meta.get("name").is_none());
    }

    #[test]
    fn category_mismatch_rejected() {
        let registry = ExtractorRegistry::default();
        let extractor = registry.get(ArtifactKind::Knowledge);
        let meta = parse_front_matter("---\ncategory: guides\n---\nText\n").unwrap();
        assert!(extractor.validate(&id("guides/intro"), &meta).is_ok());
        let err = extractor.validate(&id("other/intro"), &meta).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn tool_requires_runtime_ref_and_version() {
        let registry = ExtractorRegistry::default();
        let extractor = registry.get(ArtifactKind::Tool);
        let ok = parse_yaml_body(
            "name: read\ncategory: files\nversion: 1.0.0\nruntime_ref: runtimes/script\n",
        )
        .unwrap();
        assert!(extractor.validate(&id("files/read"), &ok).is_ok());

        let missing = parse_yaml_body("name: read\ncategory: files\nversion: 1.0.0\n").unwrap();
        assert!(extractor.validate(&id("files/read"), &missing).is_err());
    }

    #[test]
    fn primitive_descriptor_needs_primitive_name() {
        let registry = ExtractorRegistry::default();
        let extractor = registry.get(ArtifactKind::Tool);
        let meta = parse_yaml_body(&format!(
            "name: subprocess\ncategory: runtimes\nversion: 1.0.0\nruntime_ref: \"{PRIMITIVE_SENTINEL}\"\nprimitive: subprocess\n"
        ))
        .unwrap();
        assert!(extractor.validate(&id("runtimes/subprocess"), &meta).is_ok());
    }
}
