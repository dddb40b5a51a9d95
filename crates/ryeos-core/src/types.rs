//! Core types: artifacts, spaces, versions, signatures, thread metadata

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Sentinel `runtime_ref` marking a terminal primitive descriptor.
pub const PRIMITIVE_SENTINEL: &str = "«primitive»";

/// The three artifact kinds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Workflow,
    Tool,
    Knowledge,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Tool => "tool",
            Self::Knowledge => "knowledge",
        }
    }

    /// Directory name for this kind inside a tier root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Workflow => "workflows",
            Self::Tool => "tools",
            Self::Knowledge => "knowledge",
        }
    }

    pub fn all() -> [ArtifactKind; 3] {
        [Self::Workflow, Self::Tool, Self::Knowledge]
    }
}

impl FromStr for ArtifactKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "workflow" => Ok(Self::Workflow),
            "tool" => Ok(Self::Tool),
            "knowledge" => Ok(Self::Knowledge),
            other => Err(Error::validation(format!("unknown artifact kind: {other}"))),
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Origin tier. Higher rank shadows lower during resolution.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Space {
    Project,
    User,
    /// Bundle name distinguishes independent system bundles.
    System(String),
}

impl Space {
    pub fn rank(&self) -> u8 {
        match self {
            Self::Project => 3,
            Self::User => 2,
            Self::System(_) => 1,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::User => write!(f, "user"),
            Self::System(bundle) if bundle.is_empty() => write!(f, "system"),
            Self::System(bundle) => write!(f, "system:{bundle}"),
        }
    }
}

impl FromStr for Space {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(Self::Project),
            "user" => Ok(Self::User),
            "system" => Ok(Self::System(String::new())),
            other => match other.strip_prefix("system:") {
                Some(bundle) => Ok(Self::System(bundle.to_string())),
                None => Err(Error::validation(format!("unknown space: {other}"))),
            },
        }
    }
}

impl TryFrom<String> for Space {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Space> for String {
    fn from(s: Space) -> String {
        s.to_string()
    }
}

/// Path-like artifact identifier. Slash-separated segments, no extension.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::validation("artifact id must not be empty"));
        }
        if id.starts_with('/') || id.ends_with('/') {
            return Err(Error::validation(format!(
                "artifact id must not start or end with '/': {id}"
            )));
        }
        // Dots are reserved: ids map 1:1 onto dotted capability tokens, and
        // the on-disk extension belongs to the extractor, not the id.
        if id.contains('.') || id.contains('\\') {
            return Err(Error::validation(format!("artifact id must not contain '.': {id}")));
        }
        if id.split('/').any(|seg| seg.is_empty()) {
            return Err(Error::validation(format!("artifact id has an empty segment: {id}")));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Directory prefix of the id ("files/read" → "files"), empty for flat ids.
    pub fn category(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    /// Last segment ("files/read" → "read").
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Dotted form used in capability tokens ("files/read" → "files.read").
    pub fn dotted(&self) -> String {
        self.0.replace('/', ".")
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ArtifactId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Semantic version triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '.');
        let mut next = |label: &str| -> Result<u32> {
            parts
                .next()
                .ok_or_else(|| Error::validation(format!("version missing {label}: {s}")))?
                .parse()
                .map_err(|_| Error::validation(format!("version {label} not numeric: {s}")))
        };
        Ok(Self {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch")?,
        })
    }
}

impl TryFrom<String> for Version {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> String {
        v.to_string()
    }
}

/// Parsed signature of an artifact (the first-line payload).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    /// ISO-8601 UTC timestamp of the signing moment.
    pub timestamp: String,
    /// 64-hex SHA-256 of the body with the signature line stripped.
    pub content_hash: String,
    /// base64url Ed25519 signature over the content hash.
    pub sig_b64: String,
    /// First 16 hex chars of the SHA-256 of the signing public key.
    pub key_fingerprint: String,
    /// Present only on registry-signed artifacts ("registry@user").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl SignatureInfo {
    /// The unsigned placeholder never verifies and never loads.
    pub fn is_placeholder(&self) -> bool {
        self.content_hash == "placeholder" || self.sig_b64 == "unsigned"
    }
}

/// Free-form metadata extracted from an artifact body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(pub BTreeMap<String, serde_json::Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn get_map(&self, key: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.0.get(key).and_then(|v| v.as_object())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn version(&self) -> Option<Version> {
        self.get_str("version").and_then(|s| s.parse().ok())
    }
}

/// A loaded artifact: verified body plus derived metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub space: Space,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Raw content excluding the signature line.
    pub body: String,
    pub metadata: Metadata,
    pub signature: SignatureInfo,
    /// On-disk origin.
    pub path: PathBuf,
}

impl Artifact {
    /// `runtime_ref` from metadata; `None` when the artifact is not a tool
    /// or declares nothing.
    pub fn runtime_ref(&self) -> Option<&str> {
        self.metadata.get_str("runtime_ref")
    }

    pub fn is_primitive_descriptor(&self) -> bool {
        self.runtime_ref() == Some(PRIMITIVE_SENTINEL)
    }
}

/// Per-thread budget caps across the six axes. Missing fields fall back
/// to the defaults, so partial override maps deserialize cleanly.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Limits {
    pub turns: u32,
    pub tokens: u64,
    pub spend: f64,
    pub spawns: u32,
    pub duration_s: u64,
    pub depth: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            turns: 50,
            tokens: 1_000_000,
            spend: 5.0,
            spawns: 8,
            duration_s: 3600,
            depth: 4,
        }
    }
}

impl Limits {
    /// Cap every axis at the corresponding value of `cap`.
    pub fn capped_by(&self, cap: &Limits) -> Limits {
        Limits {
            turns: self.turns.min(cap.turns),
            tokens: self.tokens.min(cap.tokens),
            spend: self.spend.min(cap.spend),
            spawns: self.spawns.min(cap.spawns),
            duration_s: self.duration_s.min(cap.duration_s),
            depth: self.depth.min(cap.depth),
        }
    }

    /// True when no axis of `self` exceeds `cap`.
    pub fn within(&self, cap: &Limits) -> bool {
        self.turns <= cap.turns
            && self.tokens <= cap.tokens
            && self.spend <= cap.spend + f64::EPSILON
            && self.spawns <= cap.spawns
            && self.duration_s <= cap.duration_s
            && self.depth <= cap.depth
    }
}

/// Accumulated cost of a thread.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Cost {
    pub turns_used: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub spend: f64,
    pub duration_s: u64,
}

impl Cost {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add_turn(&mut self, input_tokens: u64, output_tokens: u64, spend: f64) {
        self.turns_used += 1;
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.spend += spend;
    }
}

/// Thread lifecycle states with the legal-transition table.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Created,
    Running,
    Suspended,
    Continued,
    Completed,
    Error,
    Cancelled,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Continued => "continued",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Continued | Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Legal transitions:
    /// created → running | error | cancelled
    /// running → suspended | continued | completed | error | cancelled
    /// suspended → running | cancelled
    pub fn can_transition(&self, to: ThreadStatus) -> bool {
        use ThreadStatus::*;
        match self {
            Created => matches!(to, Running | Error | Cancelled),
            Running => matches!(to, Suspended | Continued | Completed | Error | Cancelled),
            Suspended => matches!(to, Running | Cancelled),
            Continued | Completed | Error | Cancelled => false,
        }
    }
}

impl FromStr for ThreadStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "continued" => Ok(Self::Continued),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::validation(format!("unknown thread status: {other}"))),
        }
    }
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
