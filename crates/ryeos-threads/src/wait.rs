//! Waiting on threads
//!
//! Each waited id resolves through its continuation chain to the current
//! terminal thread. In-process status changes wake waiters through a
//! Notify handle; cross-process changes are caught by a bounded polling
//! fallback over the registry journal (~500 ms). A timeout leaves every
//! thread untouched.

use crate::registry::ThreadMeta;
use crate::spawn::Orchestrator;
use ryeos_core::{Cost, Error, Result, ThreadStatus};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const POLL_FALLBACK: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, Serialize)]
pub struct ThreadOutcome {
    /// The id that was asked for.
    pub thread_id: String,
    /// The chain terminal that actually finished (differs after
    /// continuations).
    pub resolved_thread_id: String,
    pub status: ThreadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub cost: Cost,
}

impl ThreadOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == ThreadStatus::Completed
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WaitReport {
    pub results: Vec<ThreadOutcome>,
    pub all_succeeded: bool,
}

impl Orchestrator {
    /// Block until every id's chain reaches a terminal state (continued
    /// chains are followed to their live end) or the timeout expires.
    /// Partial failure is not a global failure: the report carries one
    /// outcome per id plus an aggregate flag.
    pub async fn wait(&self, thread_ids: &[String], timeout: Duration) -> Result<WaitReport> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut results = Vec::with_capacity(thread_ids.len());
        for thread_id in thread_ids {
            let outcome = self.wait_one(thread_id, deadline, timeout).await?;
            results.push(outcome);
        }
        let all_succeeded = results.iter().all(ThreadOutcome::succeeded);
        Ok(WaitReport { results, all_succeeded })
    }

    async fn wait_one(
        &self,
        thread_id: &str,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<ThreadOutcome> {
        loop {
            let terminal = self.registry.resolve_terminal(thread_id)?;
            if let Some(outcome) = settled_outcome(thread_id, &terminal) {
                return Ok(outcome);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout { waited_ms: timeout.as_millis() as u64 });
            }

            // Push wake-up when the change happens in this process, poll
            // fallback for changes written by other processes.
            let notify = self.registry.subscribe(&terminal.thread_id);
            let notified = notify.notified();
            tokio::select! {
                _ = notified => debug!(thread = %terminal.thread_id, "woken by registry notify"),
                _ = tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + POLL_FALLBACK)) => {}
            }
        }
    }

    /// Current status/result without waiting.
    pub fn aggregate(&self, thread_ids: &[String]) -> Result<WaitReport> {
        let mut results = Vec::with_capacity(thread_ids.len());
        for thread_id in thread_ids {
            let terminal = self.registry.resolve_terminal(thread_id)?;
            results.push(ThreadOutcome {
                thread_id: thread_id.clone(),
                resolved_thread_id: terminal.thread_id.clone(),
                status: terminal.status,
                result: terminal.result.clone(),
                cost: terminal.cost,
            });
        }
        let all_succeeded = results.iter().all(ThreadOutcome::succeeded);
        Ok(WaitReport { results, all_succeeded })
    }

    pub fn list_active(&self) -> Result<Vec<ThreadMeta>> {
        self.registry.list_active()
    }
}

/// A chain is settled when its live end is terminal. `continued` never
/// ends a wait: the forward pointer is always followed first.
fn settled_outcome(requested: &str, terminal: &ThreadMeta) -> Option<ThreadOutcome> {
    if !terminal.status.is_terminal() || terminal.status == ThreadStatus::Continued {
        return None;
    }
    Some(ThreadOutcome {
        thread_id: requested.to_string(),
        resolved_thread_id: terminal.thread_id.clone(),
        status: terminal.status,
        result: terminal.result.clone(),
        cost: terminal.cost,
    })
}
