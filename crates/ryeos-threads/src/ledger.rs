//! Budget ledger — hierarchical spend accounting
//!
//! One row per thread: `{thread_id, parent_id, max_spend, reserved_spend,
//! actual_spend, status}`. The invariant, for every node:
//!
//! ```text
//! actual_spend + Σ active children's max_spend ≤ max_spend
//! ```
//!
//! A child's reservation is its own `max_spend` at spawn time, mirrored
//! into the parent's `reserved_spend`. Reservation plus the invariant
//! check happen inside a single transaction; a child is only ever spawned
//! after its reservation committed. On settle the child's actual spend
//! rolls up into the parent and the reservation is released.

use rusqlite::{params, Connection, OptionalExtension};
use ryeos_core::{Error, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

pub const LEDGER_DB: &str = "ledger.db";

const EPS: f64 = 1e-9;

#[derive(Clone, Debug, Serialize)]
pub struct LedgerEntry {
    pub thread_id: String,
    pub parent_id: Option<String>,
    pub max_spend: f64,
    pub reserved_spend: f64,
    pub actual_spend: f64,
    pub status: String,
}

impl LedgerEntry {
    pub fn remaining(&self) -> f64 {
        (self.max_spend - self.actual_spend - self.reserved_spend).max(0.0)
    }
}

pub struct BudgetLedger {
    conn: Mutex<Connection>,
}

impl BudgetLedger {
    pub fn open(threads_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(threads_dir)?;
        let conn = Connection::open(threads_dir.join(LEDGER_DB)).map_err(sql_err)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(sql_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ledger (
                thread_id TEXT PRIMARY KEY,
                parent_id TEXT,
                max_spend REAL NOT NULL,
                reserved_spend REAL NOT NULL DEFAULT 0,
                actual_spend REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL
            )",
            [],
        )
        .map_err(sql_err)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open a top-level entry with no parent to reserve against.
    pub fn open_root(&self, thread_id: &str, max_spend: f64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO ledger (thread_id, parent_id, max_spend, status)
             VALUES (?1, NULL, ?2, 'active')",
            params![thread_id, max_spend],
        )
        .map_err(sql_err)?;
        info!(thread = thread_id, max_spend, "ledger root opened");
        Ok(())
    }

    /// Reserve `child_max` under a parent. The parent invariant is checked
    /// and the child row inserted in one transaction; violation aborts the
    /// spawn with `BudgetReservation` and changes nothing.
    pub fn reserve_child(&self, parent_id: &str, child_id: &str, child_max: f64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;

        let parent = read_entry(&tx, parent_id)?
            .ok_or_else(|| Error::BudgetReservation(format!("no ledger entry for parent {parent_id}")))?;
        if parent.status != "active" {
            return Err(Error::BudgetReservation(format!(
                "parent {parent_id} ledger entry is {}",
                parent.status
            )));
        }
        let headroom = parent.max_spend - parent.actual_spend - parent.reserved_spend;
        if child_max > headroom + EPS {
            return Err(Error::BudgetReservation(format!(
                "child needs {child_max:.4}, parent {parent_id} has {:.4} unreserved",
                headroom.max(0.0)
            )));
        }

        tx.execute(
            "INSERT INTO ledger (thread_id, parent_id, max_spend, status)
             VALUES (?1, ?2, ?3, 'active')",
            params![child_id, parent_id, child_max],
        )
        .map_err(sql_err)?;
        tx.execute(
            "UPDATE ledger SET reserved_spend = reserved_spend + ?2 WHERE thread_id = ?1",
            params![parent_id, child_max],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        debug!(parent = parent_id, child = child_id, child_max, "budget reserved");
        Ok(())
    }

    /// Record spend against a thread's own entry.
    pub fn record_spend(&self, thread_id: &str, delta: f64) -> Result<()> {
        if delta < 0.0 {
            return Err(Error::validation("spend delta must be non-negative"));
        }
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE ledger SET actual_spend = actual_spend + ?2 WHERE thread_id = ?1",
                params![thread_id, delta],
            )
            .map_err(sql_err)?;
        if updated == 0 {
            return Err(Error::not_found(format!("ledger entry {thread_id}")));
        }
        Ok(())
    }

    /// Close a child's entry: release the parent's reservation and roll the
    /// child's actual spend up into the parent. Used for completion,
    /// error, and cancellation alike (a cancelled child still spent what
    /// it spent).
    pub fn settle(&self, thread_id: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        let entry = read_entry(&tx, thread_id)?
            .ok_or_else(|| Error::not_found(format!("ledger entry {thread_id}")))?;
        if entry.status != "active" {
            return Ok(());
        }
        tx.execute(
            "UPDATE ledger SET status = 'settled' WHERE thread_id = ?1",
            params![thread_id],
        )
        .map_err(sql_err)?;
        if let Some(parent_id) = &entry.parent_id {
            tx.execute(
                "UPDATE ledger SET
                    reserved_spend = MAX(0, reserved_spend - ?2),
                    actual_spend = actual_spend + ?3
                 WHERE thread_id = ?1",
                params![parent_id, entry.max_spend, entry.actual_spend],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        debug!(thread = thread_id, actual = entry.actual_spend, "ledger settled");
        Ok(())
    }

    pub fn entry(&self, thread_id: &str) -> Result<LedgerEntry> {
        let conn = self.lock();
        read_entry(&conn, thread_id)?
            .ok_or_else(|| Error::not_found(format!("ledger entry {thread_id}")))
    }

    /// Invariant audit across all nodes; returns violating thread ids.
    pub fn audit(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT l.thread_id FROM ledger l
                 WHERE l.actual_spend + (
                    SELECT COALESCE(SUM(c.max_spend), 0) FROM ledger c
                    WHERE c.parent_id = l.thread_id AND c.status = 'active'
                 ) > l.max_spend + ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![EPS], |row| row.get::<_, String>(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(rows)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_entry(conn: &Connection, thread_id: &str) -> Result<Option<LedgerEntry>> {
    conn.query_row(
        "SELECT thread_id, parent_id, max_spend, reserved_spend, actual_spend, status
         FROM ledger WHERE thread_id = ?1",
        params![thread_id],
        |row| {
            Ok(LedgerEntry {
                thread_id: row.get(0)?,
                parent_id: row.get(1)?,
                max_spend: row.get(2)?,
                reserved_spend: row.get(3)?,
                actual_spend: row.get(4)?,
                status: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(sql_err)
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::internal(format!("ledger store: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, BudgetLedger) {
        let dir = TempDir::new().unwrap();
        let ledger = BudgetLedger::open(dir.path()).unwrap();
        (dir, ledger)
    }

    #[test]
    fn exact_headroom_succeeds_one_more_fails() {
        let (_dir, ledger) = ledger();
        ledger.open_root("parent", 1.0).unwrap();
        ledger.reserve_child("parent", "a", 0.80).unwrap();

        // Seed scenario: $1.00 budget, $0.80 reserved, $0.25 more refused.
        let err = ledger.reserve_child("parent", "b", 0.25).unwrap_err();
        assert_eq!(err.kind(), "BudgetReservation");

        // The failed reservation changed nothing.
        let parent = ledger.entry("parent").unwrap();
        assert!((parent.reserved_spend - 0.80).abs() < 1e-9);
        assert_eq!(parent.actual_spend, 0.0);
        assert!(ledger.entry("b").is_err());

        // Exactly the remaining headroom is fine.
        ledger.reserve_child("parent", "b", 0.20).unwrap();
        assert!(ledger.audit().unwrap().is_empty());
    }

    #[test]
    fn settle_releases_and_rolls_up() {
        let (_dir, ledger) = ledger();
        ledger.open_root("parent", 2.0).unwrap();
        ledger.reserve_child("parent", "child", 1.0).unwrap();
        ledger.record_spend("child", 0.4).unwrap();
        ledger.settle("child").unwrap();

        let parent = ledger.entry("parent").unwrap();
        assert_eq!(parent.reserved_spend, 0.0);
        assert!((parent.actual_spend - 0.4).abs() < 1e-9);
        assert!((parent.remaining() - 1.6).abs() < 1e-9);

        // Settling twice is a no-op.
        ledger.settle("child").unwrap();
        let parent = ledger.entry("parent").unwrap();
        assert!((parent.actual_spend - 0.4).abs() < 1e-9);
        assert!(ledger.audit().unwrap().is_empty());
    }

    #[test]
    fn nested_reservations_hold_invariant() {
        let (_dir, ledger) = ledger();
        ledger.open_root("root", 4.0).unwrap();
        ledger.reserve_child("root", "mid", 2.0).unwrap();
        ledger.reserve_child("mid", "leaf", 1.5).unwrap();

        // mid has 0.5 headroom left.
        assert!(ledger.reserve_child("mid", "leaf2", 0.6).is_err());
        ledger.reserve_child("mid", "leaf2", 0.5).unwrap();
        assert!(ledger.audit().unwrap().is_empty());

        ledger.record_spend("leaf", 1.2).unwrap();
        ledger.settle("leaf").unwrap();
        let mid = ledger.entry("mid").unwrap();
        assert!((mid.actual_spend - 1.2).abs() < 1e-9);
        assert!((mid.reserved_spend - 0.5).abs() < 1e-9);
        assert!(ledger.audit().unwrap().is_empty());
    }

    #[test]
    fn reserve_against_missing_parent_fails() {
        let (_dir, ledger) = ledger();
        let err = ledger.reserve_child("ghost", "child", 0.1).unwrap_err();
        assert_eq!(err.kind(), "BudgetReservation");
    }
}
