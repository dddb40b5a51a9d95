//! Thread registry — process-wide persistent store of thread metadata
//!
//! Backed by SQLite in WAL mode. Every write is serialized through one
//! connection, touches an append-only journal file (so other processes
//! can watch for changes), and pings in-process waiters. Status changes
//! go through the legal-transition table; continuation linking is a
//! single transaction.

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension, Row};
use ryeos_core::{ArtifactId, CapabilitySet, Cost, Error, Limits, Result, ThreadStatus};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info};

pub const REGISTRY_DB: &str = "registry.db";
pub const REGISTRY_JOURNAL: &str = "registry.journal";

#[derive(Clone, Debug)]
pub struct ThreadMeta {
    pub thread_id: String,
    pub parent_id: Option<String>,
    pub directive_id: ArtifactId,
    pub status: ThreadStatus,
    pub chain_root_id: Option<String>,
    pub continuation_of: Option<String>,
    pub continuation_thread_id: Option<String>,
    pub limits: Limits,
    pub cost: Cost,
    pub capabilities: CapabilitySet,
    pub model: Option<String>,
    pub transcript_path: Option<PathBuf>,
    pub result: Option<Value>,
    pub pid: Option<u32>,
    pub created_at: String,
    pub updated_at: String,
}

impl ThreadMeta {
    pub fn new(thread_id: String, directive_id: ArtifactId) -> Self {
        let now = now_iso();
        Self {
            thread_id,
            parent_id: None,
            directive_id,
            status: ThreadStatus::Created,
            chain_root_id: None,
            continuation_of: None,
            continuation_thread_id: None,
            limits: Limits::default(),
            cost: Cost::default(),
            capabilities: CapabilitySet::default(),
            model: None,
            transcript_path: None,
            result: None,
            pid: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Root of this thread's continuation chain (itself when unlinked).
    pub fn chain_root(&self) -> &str {
        self.chain_root_id.as_deref().unwrap_or(&self.thread_id)
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct ThreadRegistry {
    conn: Mutex<Connection>,
    journal_path: PathBuf,
    notifiers: DashMap<String, Arc<Notify>>,
}

impl ThreadRegistry {
    pub fn open(threads_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(threads_dir)?;
        let conn = Connection::open(threads_dir.join(REGISTRY_DB))
            .map_err(sql_err)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(sql_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                parent_id TEXT,
                directive_id TEXT NOT NULL,
                status TEXT NOT NULL,
                chain_root_id TEXT,
                continuation_of TEXT,
                continuation_thread_id TEXT,
                limits TEXT NOT NULL,
                cost TEXT NOT NULL,
                capabilities TEXT NOT NULL,
                model TEXT,
                transcript_path TEXT,
                result TEXT,
                pid INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_threads_parent ON threads(parent_id);
            CREATE INDEX IF NOT EXISTS idx_threads_status ON threads(status);
            CREATE TABLE IF NOT EXISTS seq (name TEXT PRIMARY KEY, value INTEGER NOT NULL);",
        )
        .map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            journal_path: threads_dir.join(REGISTRY_JOURNAL),
            notifiers: DashMap::new(),
        })
    }

    /// Monotonic sequence for thread id generation.
    pub fn next_seq(&self, name: &str) -> Result<u64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO seq (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![name],
        )
        .map_err(sql_err)?;
        conn.query_row("SELECT value FROM seq WHERE name = ?1", params![name], |row| {
            row.get::<_, i64>(0)
        })
        .map(|v| v as u64)
        .map_err(sql_err)
    }

    pub fn register(&self, meta: &ThreadMeta) -> Result<()> {
        if meta.status != ThreadStatus::Created {
            return Err(Error::validation("threads register with status 'created'"));
        }
        {
            let conn = self.lock();
            insert_meta(&conn, meta)?;
        }
        self.touch_journal(&meta.thread_id, meta.status);
        info!(thread = %meta.thread_id, directive = %meta.directive_id, "thread registered");
        Ok(())
    }

    pub fn get(&self, thread_id: &str) -> Result<ThreadMeta> {
        let conn = self.lock();
        get_meta(&conn, thread_id)
    }

    pub fn set_status(&self, thread_id: &str, status: ThreadStatus) -> Result<()> {
        {
            let conn = self.lock();
            let current = get_meta(&conn, thread_id)?;
            if !current.status.can_transition(status) {
                return Err(Error::validation(format!(
                    "illegal transition {} → {} for {thread_id}",
                    current.status, status
                )));
            }
            conn.execute(
                "UPDATE threads SET status = ?2, updated_at = ?3 WHERE thread_id = ?1",
                params![thread_id, status.as_str(), now_iso()],
            )
            .map_err(sql_err)?;
        }
        self.touch_journal(thread_id, status);
        debug!(thread = thread_id, status = %status, "status transition");
        Ok(())
    }

    pub fn set_pid(&self, thread_id: &str, pid: u32) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE threads SET pid = ?2, updated_at = ?3 WHERE thread_id = ?1",
            params![thread_id, pid, now_iso()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn update_cost(&self, thread_id: &str, cost: &Cost) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE threads SET cost = ?2, updated_at = ?3 WHERE thread_id = ?1",
            params![thread_id, serde_json::to_string(cost)?, now_iso()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Record the final result while transitioning into a terminal state.
    pub fn set_result(
        &self,
        thread_id: &str,
        status: ThreadStatus,
        result: &Value,
        cost: &Cost,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::validation("set_result requires a terminal status"));
        }
        {
            let conn = self.lock();
            let current = get_meta(&conn, thread_id)?;
            if !current.status.can_transition(status) {
                return Err(Error::validation(format!(
                    "illegal transition {} → {} for {thread_id}",
                    current.status, status
                )));
            }
            conn.execute(
                "UPDATE threads SET status = ?2, result = ?3, cost = ?4, updated_at = ?5
                 WHERE thread_id = ?1",
                params![
                    thread_id,
                    status.as_str(),
                    serde_json::to_string(result)?,
                    serde_json::to_string(cost)?,
                    now_iso()
                ],
            )
            .map_err(sql_err)?;
        }
        self.touch_journal(thread_id, status);
        info!(thread = thread_id, status = %status, "thread finalized");
        Ok(())
    }

    /// Atomically link a continuation: insert the successor row and mark
    /// the predecessor. A running predecessor becomes `continued`; a
    /// terminal one (user resume) keeps its status and only gains the
    /// forward pointer. Either both rows are written or neither.
    pub fn register_continuation(&self, old_id: &str, successor: &mut ThreadMeta) -> Result<()> {
        let new_status;
        {
            let mut conn = self.lock();
            let old = get_meta(&conn, old_id)?;
            let old_status = old.status;
            if old_status == ThreadStatus::Running {
                new_status = ThreadStatus::Continued;
            } else if old_status.is_terminal() && old_status != ThreadStatus::Continued {
                new_status = old_status;
            } else {
                return Err(Error::validation(format!(
                    "cannot continue thread {old_id} in status {old_status}"
                )));
            }

            successor.chain_root_id = Some(old.chain_root().to_string());
            successor.continuation_of = Some(old_id.to_string());
            successor.status = ThreadStatus::Created;

            let tx = conn.transaction().map_err(sql_err)?;
            insert_meta(&tx, successor)?;
            tx.execute(
                "UPDATE threads SET status = ?2, continuation_thread_id = ?3, updated_at = ?4
                 WHERE thread_id = ?1",
                params![old_id, new_status.as_str(), successor.thread_id, now_iso()],
            )
            .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;
        }
        self.touch_journal(old_id, new_status);
        self.touch_journal(&successor.thread_id, ThreadStatus::Created);
        info!(old = old_id, new = %successor.thread_id, "continuation linked");
        Ok(())
    }

    /// Full continuation chain, root first. Cycle-safe against corruption.
    pub fn get_chain(&self, thread_id: &str) -> Result<Vec<ThreadMeta>> {
        let conn = self.lock();
        let mut visited = BTreeSet::new();

        // Walk back to the chain root.
        let mut current = get_meta(&conn, thread_id)?;
        while let Some(prev_id) = current.continuation_of.clone() {
            if !visited.insert(prev_id.clone()) {
                return Err(Error::internal(format!("continuation cycle at {prev_id}")));
            }
            current = get_meta(&conn, &prev_id)?;
        }

        // Walk forward collecting the chain.
        visited.clear();
        let mut chain = Vec::new();
        let mut cursor = Some(current);
        while let Some(meta) = cursor {
            if !visited.insert(meta.thread_id.clone()) {
                return Err(Error::internal(format!(
                    "continuation cycle at {}",
                    meta.thread_id
                )));
            }
            let next = meta.continuation_thread_id.clone();
            chain.push(meta);
            cursor = match next {
                Some(id) => Some(get_meta(&conn, &id)?),
                None => None,
            };
        }
        Ok(chain)
    }

    /// Latest thread in the continuation chain containing `thread_id`.
    pub fn resolve_terminal(&self, thread_id: &str) -> Result<ThreadMeta> {
        let chain = self.get_chain(thread_id)?;
        chain
            .into_iter()
            .last()
            .ok_or_else(|| Error::not_found(format!("thread {thread_id}")))
    }

    pub fn list_active(&self) -> Result<Vec<ThreadMeta>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM threads WHERE status IN ('created', 'running', 'suspended')
                 ORDER BY created_at",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], row_to_meta)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(rows)
    }

    pub fn list_children(&self, parent_id: &str) -> Result<Vec<ThreadMeta>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM threads WHERE parent_id = ?1 ORDER BY created_at")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![parent_id], row_to_meta)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        Ok(rows)
    }

    /// In-process wake-up handle for a thread's status changes.
    pub fn subscribe(&self, thread_id: &str) -> Arc<Notify> {
        self.notifiers
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn touch_journal(&self, thread_id: &str, status: ThreadStatus) {
        let line = format!(
            "{}\n",
            serde_json::json!({"ts": now_iso(), "thread_id": thread_id, "status": status.as_str()})
        );
        if let Err(e) = append_line(&self.journal_path, &line) {
            tracing::warn!(error = %e, "journal append failed");
        }
        if let Some(notify) = self.notifiers.get(thread_id) {
            notify.notify_waiters();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

fn insert_meta(conn: &Connection, meta: &ThreadMeta) -> Result<()> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO threads (
                thread_id, parent_id, directive_id, status, chain_root_id,
                continuation_of, continuation_thread_id, limits, cost,
                capabilities, model, transcript_path, result, pid,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                meta.thread_id,
                meta.parent_id,
                meta.directive_id.as_str(),
                meta.status.as_str(),
                meta.chain_root_id,
                meta.continuation_of,
                meta.continuation_thread_id,
                serde_json::to_string(&meta.limits)?,
                serde_json::to_string(&meta.cost)?,
                serde_json::to_string(&meta.capabilities)?,
                meta.model,
                meta.transcript_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                meta.result.as_ref().map(|r| r.to_string()),
                meta.pid,
                meta.created_at,
                meta.updated_at
            ],
        )
        .map_err(sql_err)?;
    if inserted == 0 {
        return Err(Error::validation(format!(
            "thread {} already registered",
            meta.thread_id
        )));
    }
    Ok(())
}

fn get_meta(conn: &Connection, thread_id: &str) -> Result<ThreadMeta> {
    conn.query_row(
        "SELECT * FROM threads WHERE thread_id = ?1",
        params![thread_id],
        row_to_meta,
    )
    .optional()
    .map_err(sql_err)?
    .ok_or_else(|| Error::not_found(format!("thread {thread_id}")))
}

fn row_to_meta(row: &Row<'_>) -> rusqlite::Result<ThreadMeta> {
    let limits: String = row.get("limits")?;
    let cost: String = row.get("cost")?;
    let capabilities: String = row.get("capabilities")?;
    let status: String = row.get("status")?;
    let directive: String = row.get("directive_id")?;
    let result: Option<String> = row.get("result")?;
    let transcript: Option<String> = row.get("transcript_path")?;
    let pid: Option<i64> = row.get("pid")?;
    Ok(ThreadMeta {
        thread_id: row.get("thread_id")?,
        parent_id: row.get("parent_id")?,
        directive_id: ArtifactId::new(directive).map_err(|_| rusqlite::Error::InvalidQuery)?,
        status: status.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
        chain_root_id: row.get("chain_root_id")?,
        continuation_of: row.get("continuation_of")?,
        continuation_thread_id: row.get("continuation_thread_id")?,
        limits: serde_json::from_str(&limits).map_err(|_| rusqlite::Error::InvalidQuery)?,
        cost: serde_json::from_str(&cost).map_err(|_| rusqlite::Error::InvalidQuery)?,
        capabilities: serde_json::from_str(&capabilities).map_err(|_| rusqlite::Error::InvalidQuery)?,
        model: row.get("model")?,
        transcript_path: transcript.map(PathBuf::from),
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        pid: pid.map(|p| p as u32),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::internal(format!("registry store: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, ThreadRegistry) {
        let dir = TempDir::new().unwrap();
        let reg = ThreadRegistry::open(dir.path()).unwrap();
        (dir, reg)
    }

    fn meta(id: &str) -> ThreadMeta {
        ThreadMeta::new(id.to_string(), ArtifactId::new("ops/review").unwrap())
    }

    #[test]
    fn register_and_transitions() {
        let (_dir, reg) = registry();
        reg.register(&meta("t-1")).unwrap();
        reg.set_status("t-1", ThreadStatus::Running).unwrap();
        reg.set_status("t-1", ThreadStatus::Suspended).unwrap();
        reg.set_status("t-1", ThreadStatus::Running).unwrap();

        // running → running is not a legal transition.
        let err = reg.set_status("t-1", ThreadStatus::Running).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        reg.set_result("t-1", ThreadStatus::Completed, &serde_json::json!({"ok": true}), &Cost::default())
            .unwrap();
        let got = reg.get("t-1").unwrap();
        assert_eq!(got.status, ThreadStatus::Completed);
        assert_eq!(got.result.unwrap()["ok"], true);

        // Terminal is final.
        assert!(reg.set_status("t-1", ThreadStatus::Running).is_err());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let (_dir, reg) = registry();
        reg.register(&meta("t-1")).unwrap();
        assert!(reg.register(&meta("t-1")).is_err());
    }

    #[test]
    fn continuation_links_atomically() {
        let (_dir, reg) = registry();
        reg.register(&meta("t-1")).unwrap();
        reg.set_status("t-1", ThreadStatus::Running).unwrap();

        let mut successor = meta("t-2");
        reg.register_continuation("t-1", &mut successor).unwrap();

        let old = reg.get("t-1").unwrap();
        assert_eq!(old.status, ThreadStatus::Continued);
        assert_eq!(old.continuation_thread_id.as_deref(), Some("t-2"));

        let new = reg.get("t-2").unwrap();
        assert_eq!(new.continuation_of.as_deref(), Some("t-1"));
        assert_eq!(new.chain_root(), "t-1");
    }

    #[test]
    fn chain_walk_over_two_continuations() {
        let (_dir, reg) = registry();
        reg.register(&meta("t-1")).unwrap();
        reg.set_status("t-1", ThreadStatus::Running).unwrap();
        let mut t2 = meta("t-2");
        reg.register_continuation("t-1", &mut t2).unwrap();
        reg.set_status("t-2", ThreadStatus::Running).unwrap();
        let mut t3 = meta("t-3");
        reg.register_continuation("t-2", &mut t3).unwrap();
        reg.set_status("t-3", ThreadStatus::Running).unwrap();
        reg.set_result("t-3", ThreadStatus::Completed, &serde_json::json!("done"), &Cost::default())
            .unwrap();

        // Walking from any member yields the same ordered chain.
        for start in ["t-1", "t-2", "t-3"] {
            let chain = reg.get_chain(start).unwrap();
            let ids: Vec<_> = chain.iter().map(|m| m.thread_id.as_str()).collect();
            assert_eq!(ids, ["t-1", "t-2", "t-3"]);
            assert!(chain.iter().all(|m| m.chain_root() == "t-1"));
        }
        let terminal = reg.resolve_terminal("t-1").unwrap();
        assert_eq!(terminal.thread_id, "t-3");
        assert_eq!(terminal.status, ThreadStatus::Completed);
    }

    #[test]
    fn resume_keeps_terminal_status() {
        let (_dir, reg) = registry();
        reg.register(&meta("t-1")).unwrap();
        reg.set_status("t-1", ThreadStatus::Running).unwrap();
        reg.set_result("t-1", ThreadStatus::Completed, &Value::Null, &Cost::default())
            .unwrap();

        let mut successor = meta("t-2");
        reg.register_continuation("t-1", &mut successor).unwrap();
        let old = reg.get("t-1").unwrap();
        assert_eq!(old.status, ThreadStatus::Completed);
        assert_eq!(old.continuation_thread_id.as_deref(), Some("t-2"));
    }

    #[test]
    fn seq_is_monotonic() {
        let (_dir, reg) = registry();
        assert_eq!(reg.next_seq("review").unwrap(), 1);
        assert_eq!(reg.next_seq("review").unwrap(), 2);
        assert_eq!(reg.next_seq("other").unwrap(), 1);
    }

    #[test]
    fn journal_grows_on_writes() {
        let (dir, reg) = registry();
        reg.register(&meta("t-1")).unwrap();
        let len1 = std::fs::metadata(dir.path().join(REGISTRY_JOURNAL)).unwrap().len();
        reg.set_status("t-1", ThreadStatus::Running).unwrap();
        let len2 = std::fs::metadata(dir.path().join(REGISTRY_JOURNAL)).unwrap().len();
        assert!(len2 > len1);
    }
}
