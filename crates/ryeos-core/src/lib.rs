//! Ryeos core — shared types, error taxonomy, capability tokens, protocol envelope
//!
//! Everything in this crate is plain data: no I/O, no async. The store,
//! chain, thread, and harness crates all build on these definitions.

pub mod capability;
pub mod error;
pub mod protocol;
pub mod types;

pub use capability::{Capability, CapabilitySet, RiskPolicy, RiskTable, RiskTier, Verb};
pub use error::{Error, Result};
pub use protocol::{Request, RequestOptions, Response};
pub use types::{
    Artifact, ArtifactId, ArtifactKind, Cost, Limits, Metadata, SignatureInfo, Space,
    ThreadStatus, Version, PRIMITIVE_SENTINEL,
};
