//! Ryeos artifact store — signed, three-tier, content-addressed
//!
//! Artifacts live as signed files under a project tier, a user tier, and
//! any number of read-only system bundles. The resolver walks tiers in
//! precedence order, verifies integrity before returning anything, and
//! never mutates system-tier files.

pub mod extractor;
pub mod keys;
pub mod lockfile;
pub mod resolver;
pub mod search;
pub mod sigline;
pub mod signer;
pub mod trust;

pub use extractor::ExtractorRegistry;
pub use keys::SigningKey;
pub use lockfile::{LockEntry, Lockfile};
pub use resolver::{Resolver, SystemBundle, TierPaths};
pub use search::{SearchHit, SearchOptions, Searcher};
pub use sigline::{framing_for_extension, Framing};
pub use signer::Signer;
pub use trust::TrustStore;
