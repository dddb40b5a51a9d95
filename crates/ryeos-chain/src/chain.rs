//! Chain construction and validation
//!
//! A chain is `[A0, A1, …, An]` where A0 is the requested tool, each
//! element's `runtime_ref` resolves to the next, and An is a terminal
//! primitive descriptor. Every element must verify, the chain must be
//! acyclic and bounded, and tier rank must never increase along the walk
//! (`project=3 > user=2 > system=1`).

use ryeos_core::{Artifact, ArtifactId, ArtifactKind, Error, Result};
use ryeos_store::Resolver;
use serde::Serialize;
use std::collections::BTreeSet;

pub const MAX_CHAIN_DEPTH: usize = 8;

#[derive(Clone, Debug)]
pub struct Chain {
    pub elements: Vec<Artifact>,
}

impl Chain {
    pub fn root(&self) -> &Artifact {
        &self.elements[0]
    }

    pub fn terminal(&self) -> &Artifact {
        self.elements.last().expect("chain is never empty")
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn summaries(&self) -> Vec<ChainElement> {
        self.elements.iter().map(ChainElement::from).collect()
    }
}

/// Wire-facing summary of one chain element.
#[derive(Clone, Debug, Serialize)]
pub struct ChainElement {
    pub id: ArtifactId,
    pub space: String,
    pub runtime_ref: String,
    pub integrity: String,
}

impl From<&Artifact> for ChainElement {
    fn from(a: &Artifact) -> Self {
        Self {
            id: a.id.clone(),
            space: a.space.to_string(),
            runtime_ref: a.runtime_ref().unwrap_or_default().to_string(),
            integrity: a.signature.content_hash.clone(),
        }
    }
}

/// One verified adjacent transition in a validated chain.
#[derive(Clone, Debug, Serialize)]
pub struct ValidatedPair {
    pub from: ArtifactId,
    pub to: ArtifactId,
    /// False when either side declared no shapes (best-effort check skipped).
    pub io_checked: bool,
}

pub struct ChainBuilder<'a> {
    resolver: &'a Resolver,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(resolver: &'a Resolver) -> Self {
        Self { resolver }
    }

    /// Build the chain for a root tool. On failure the partial chain walked
    /// so far is returned alongside the error, so callers can report how
    /// far resolution got.
    pub fn build(&self, root: &ArtifactId) -> std::result::Result<Chain, (Vec<ChainElement>, Error)> {
        let mut elements: Vec<Artifact> = Vec::new();
        let mut seen: BTreeSet<ArtifactId> = BTreeSet::new();

        let first = self
            .resolver
            .resolve(ArtifactKind::Tool, root, None)
            .map_err(|e| (Vec::new(), e))?;
        seen.insert(first.id.clone());
        elements.push(first);

        loop {
            let last = elements.last().expect("chain has at least the root");
            if last.is_primitive_descriptor() {
                return Ok(Chain { elements });
            }
            let partial = || elements.iter().map(ChainElement::from).collect::<Vec<_>>();
            let next_ref = match last.runtime_ref() {
                Some(r) => r,
                None => {
                    let id = last.id.clone();
                    return Err((partial(), Error::chain(format!("{id} declares no runtime_ref"))));
                }
            };
            let next_id = ArtifactId::new(next_ref)
                .map_err(|_| (partial(), Error::chain(format!("malformed runtime_ref '{next_ref}'"))))?;
            if seen.contains(&next_id) {
                return Err((partial(), Error::chain(format!("cycle at {next_id}"))));
            }
            if elements.len() >= MAX_CHAIN_DEPTH {
                return Err((
                    partial(),
                    Error::chain(format!("chain exceeds max depth {MAX_CHAIN_DEPTH}")),
                ));
            }
            let next = self
                .resolver
                .resolve(ArtifactKind::Tool, &next_id, None)
                .map_err(|e| (partial(), e))?;
            seen.insert(next.id.clone());
            elements.push(next);
        }
    }
}

/// Validate tier descent and (best-effort) I/O shape compatibility across
/// every adjacent pair. Integrity is already guaranteed by resolution.
pub fn validate(chain: &Chain) -> Result<Vec<ValidatedPair>> {
    let mut pairs = Vec::new();
    for window in chain.elements.windows(2) {
        let (a, b) = (&window[0], &window[1]);
        if a.space.rank() < b.space.rank() {
            return Err(Error::chain(format!(
                "tier rank increases from {} ({}) to {} ({})",
                a.id, a.space, b.id, b.space
            )));
        }
        let io_checked = check_shapes(a, b)?;
        pairs.push(ValidatedPair {
            from: a.id.clone(),
            to: b.id.clone(),
            io_checked,
        });
    }
    Ok(pairs)
}

/// The successor may declare `expects`, a list of config keys it requires;
/// the predecessor declares what it hands over in its `config` map. The
/// check is structural and skipped when either side is silent.
fn check_shapes(a: &Artifact, b: &Artifact) -> Result<bool> {
    let expects = b.metadata.get_str_list("expects");
    if expects.is_empty() {
        return Ok(false);
    }
    let provided = match a.metadata.get_map("config") {
        Some(map) => map,
        None => return Ok(false),
    };
    for key in &expects {
        if !provided.contains_key(key) {
            return Err(Error::chain(format!(
                "{} expects config key '{key}' that {} does not provide",
                b.id, a.id
            )));
        }
    }
    Ok(true)
}
