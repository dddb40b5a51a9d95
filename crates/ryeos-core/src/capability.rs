//! Capability tokens and risk classification
//!
//! A capability is a dotted pattern `<verb>.<kind>.<id-pattern>` where the
//! id pattern supports `*` and `?` wildcard segments. Matching is
//! segment-wise: `*` in a trailing position swallows the remaining
//! segments, anywhere else it matches exactly one segment; `?` matches a
//! single character inside a segment. The empty capability set denies
//! everything (fail-closed).

use crate::error::{Error, Result};
use crate::types::{ArtifactId, ArtifactKind};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The four host protocol verbs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Execute,
    Search,
    Load,
    Sign,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Search => "search",
            Self::Load => "load",
            Self::Sign => "sign",
        }
    }
}

impl FromStr for Verb {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "execute" => Ok(Self::Execute),
            "search" => Ok(Self::Search),
            "load" => Ok(Self::Load),
            "sign" => Ok(Self::Sign),
            other => Err(Error::validation(format!("unknown verb: {other}"))),
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One parsed capability pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability {
    segments: Vec<String>,
}

impl Capability {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::validation("capability pattern must not be empty"));
        }
        let segments: Vec<String> = pattern.split('.').map(String::from).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::validation(format!("capability has empty segment: {pattern}")));
        }
        // First segment must be a verb or a wildcard.
        let head = &segments[0];
        if head != "*" && head.parse::<Verb>().is_err() {
            return Err(Error::validation(format!("capability verb unknown: {pattern}")));
        }
        Ok(Self { segments })
    }

    /// Build the required token for a dispatch: `<verb>.<kind>[.<dotted id>]`.
    pub fn required(verb: Verb, kind: ArtifactKind, id: Option<&ArtifactId>) -> String {
        match id {
            Some(id) => format!("{}.{}.{}", verb, kind, id.dotted()),
            None => format!("{}.{}", verb, kind),
        }
    }

    /// Does this pattern match the concrete dotted token `needed`?
    pub fn matches(&self, needed: &str) -> bool {
        let needed: Vec<&str> = needed.split('.').collect();
        match_segments(&self.segments, &needed)
    }

    /// Attenuation: does this pattern grant everything `child` can grant?
    ///
    /// Conservative segment-wise check: a literal parent segment only
    /// implies an identical literal child segment; `*` implies anything at
    /// that position, and a trailing `*` implies any remainder.
    pub fn implies(&self, child: &Capability) -> bool {
        implies_segments(&self.segments, &child.segments)
    }

    pub fn pattern(&self) -> String {
        self.segments.join(".")
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pattern())
    }
}

impl FromStr for Capability {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Capability {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> String {
        c.pattern()
    }
}

fn match_segments(pattern: &[String], value: &[&str]) -> bool {
    let mut pi = 0;
    let mut vi = 0;
    while pi < pattern.len() {
        let seg = pattern[pi].as_str();
        if seg == "*" && pi == pattern.len() - 1 {
            // Trailing * swallows one or more remaining segments.
            return vi < value.len();
        }
        match value.get(vi) {
            Some(v) if segment_matches(seg, v) => {
                pi += 1;
                vi += 1;
            }
            _ => return false,
        }
    }
    vi == value.len()
}

fn segment_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('?') && !pattern.contains('*') {
        return pattern == value;
    }
    // Char-wise with ? single-char and * any-run inside the segment.
    glob_chars(pattern.as_bytes(), value.as_bytes())
}

fn glob_chars(p: &[u8], v: &[u8]) -> bool {
    match (p.first(), v.first()) {
        (None, None) => true,
        (Some(b'*'), _) => glob_chars(&p[1..], v) || (!v.is_empty() && glob_chars(p, &v[1..])),
        (Some(b'?'), Some(_)) => glob_chars(&p[1..], &v[1..]),
        (Some(a), Some(b)) if a == b => glob_chars(&p[1..], &v[1..]),
        _ => false,
    }
}

fn implies_segments(parent: &[String], child: &[String]) -> bool {
    let mut pi = 0;
    let mut ci = 0;
    while pi < parent.len() {
        let pseg = parent[pi].as_str();
        if pseg == "*" && pi == parent.len() - 1 {
            return ci < child.len();
        }
        match child.get(ci) {
            Some(cseg) => {
                let cseg = cseg.as_str();
                let ok = if pseg == "*" {
                    true
                } else if cseg.contains('*') || cseg.contains('?') {
                    // A child wildcard is broader than a literal parent.
                    false
                } else {
                    segment_matches(pseg, cseg)
                };
                if !ok {
                    return false;
                }
                pi += 1;
                ci += 1;
            }
            None => return false,
        }
    }
    ci == child.len()
}

/// A thread's set of capability patterns. Empty means deny-all.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    patterns: Vec<Capability>,
}

impl CapabilitySet {
    pub fn new(patterns: Vec<Capability>) -> Self {
        Self { patterns }
    }

    pub fn parse_all<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Capability::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.patterns.iter()
    }

    /// Fail-closed permission check against a concrete request.
    pub fn allows(&self, verb: Verb, kind: ArtifactKind, id: Option<&ArtifactId>) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let needed = Capability::required(verb, kind, id);
        self.patterns.iter().any(|p| p.matches(&needed))
    }

    /// Attenuation invariant: every pattern of `child` is implied by at
    /// least one pattern here.
    pub fn covers(&self, child: &CapabilitySet) -> bool {
        child
            .patterns
            .iter()
            .all(|c| self.patterns.iter().any(|p| p.implies(c)))
    }
}

/// Risk tiers in increasing order of required trust.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Safe,
    Write,
    Elevated,
    Unrestricted,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Write => "write",
            Self::Elevated => "elevated",
            Self::Unrestricted => "unrestricted",
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What spawning does when a declared capability lands in a tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiskPolicy {
    Allow,
    AcknowledgeRequired,
    Block,
}

/// Pattern → tier classification, first match wins.
#[derive(Clone, Debug)]
pub struct RiskTable {
    rules: Vec<(Capability, RiskTier)>,
}

impl Default for RiskTable {
    fn default() -> Self {
        // Ordered most-specific first. Anything unmatched is Safe.
        let rules = [
            ("execute.tool.sys.*", RiskTier::Unrestricted),
            ("execute.tool.net.*", RiskTier::Elevated),
            ("sign.*", RiskTier::Elevated),
            ("execute.tool.files.write", RiskTier::Write),
            ("execute.tool.files.edit", RiskTier::Write),
            ("execute.workflow.*", RiskTier::Write),
            ("execute.*", RiskTier::Write),
        ];
        Self {
            rules: rules
                .into_iter()
                .map(|(p, t)| (Capability::parse(p).expect("builtin risk rule"), t))
                .collect(),
        }
    }
}

impl RiskTable {
    pub fn with_rules(rules: Vec<(Capability, RiskTier)>) -> Self {
        Self { rules }
    }

    /// Classify a declared capability pattern. The pattern itself is matched
    /// as if it were a concrete token, so `execute.tool.sys.reboot` and the
    /// declared wildcard `execute.tool.sys.*` both land in the sys rule.
    pub fn classify(&self, cap: &Capability) -> RiskTier {
        let token = cap.pattern();
        for (rule, tier) in &self.rules {
            if rule.matches(&token) || rule.implies(cap) {
                return *tier;
            }
        }
        RiskTier::Safe
    }

    pub fn policy(tier: RiskTier) -> RiskPolicy {
        match tier {
            RiskTier::Safe | RiskTier::Write => RiskPolicy::Allow,
            RiskTier::Elevated => RiskPolicy::AcknowledgeRequired,
            RiskTier::Unrestricted => RiskPolicy::Block,
        }
    }
}
