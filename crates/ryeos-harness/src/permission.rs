//! Per-tool-call permission gate
//!
//! Fail-closed: an empty capability set denies everything except the
//! internal whitelist. Denials flow back to the agent as tool results;
//! the turn keeps going.

use ryeos_core::{ArtifactId, ArtifactKind, Capability, CapabilitySet, Error, Result, Verb};

/// Host-internal tool ids that are always allowed: thread coordination
/// must keep working for a thread with no artifact capabilities at all.
pub const INTERNAL_WHITELIST: &[&str] = &[
    "rye/wait",
    "rye/status",
    "rye/aggregate",
    "rye/report",
];

pub fn check_permission(
    capabilities: &CapabilitySet,
    verb: Verb,
    kind: ArtifactKind,
    id: Option<&ArtifactId>,
) -> Result<()> {
    if let Some(id) = id {
        if INTERNAL_WHITELIST.contains(&id.as_str()) {
            return Ok(());
        }
    }
    if capabilities.allows(verb, kind, id) {
        return Ok(());
    }
    Err(Error::PermissionDenied {
        required: Capability::required(verb, kind, id),
    })
}
