//! Ryeos host — wiring and protocol dispatch
//!
//! `Host::init` assembles the trust store, resolver, chain executor, and
//! thread orchestrator around a set of tier roots; the `Dispatcher` maps
//! the four protocol verbs (search, load, execute, sign) onto them and
//! translates every internal error into the response envelope.

pub mod dispatcher;
pub mod host;

pub use dispatcher::Dispatcher;
pub use host::{Host, HostConfig};
