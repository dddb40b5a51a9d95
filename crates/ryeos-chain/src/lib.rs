//! Ryeos executor chain engine
//!
//! Resolves a tool to its dependency chain (tool → runtime → … → terminal
//! primitive descriptor), verifies every link, resolves environment,
//! expands templates, and dispatches to a registered primitive.

pub mod chain;
pub mod env;
pub mod executor;
pub mod primitive;
pub mod template;

pub use chain::{Chain, ChainBuilder, ChainElement, ValidatedPair, MAX_CHAIN_DEPTH};
pub use env::{resolve_env, EnvMode};
pub use executor::{ExecError, ExecutionReport, Executor};
pub use primitive::{HttpPrimitive, Primitive, PrimitiveRegistry, SubprocessPrimitive};
pub use template::expand_templates;
