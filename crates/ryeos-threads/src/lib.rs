//! Ryeos thread orchestrator
//!
//! Threads are agent executions running as OS subprocesses. They share no
//! memory; coordination happens through two embedded SQLite stores (the
//! thread registry and the budget ledger) plus per-thread transcript
//! files. This crate owns spawning, tracking, waiting, killing, and the
//! hierarchical budget accounting underneath it all.

pub mod ledger;
pub mod process;
pub mod registry;
pub mod spawn;
pub mod wait;

pub use ledger::{BudgetLedger, LedgerEntry};
pub use process::{CapturedOutput, NullProcessDriver, ProcessDriver, TokioProcessDriver};
pub use registry::{ThreadMeta, ThreadRegistry};
pub use spawn::{Orchestrator, SpawnOutcome, SpawnRequest};
pub use wait::{ThreadOutcome, WaitReport};
