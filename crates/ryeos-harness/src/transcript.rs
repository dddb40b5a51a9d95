//! Append-only thread transcripts with tamper-evident checkpoints
//!
//! Every event is one JSON line. At a configurable interval the writer
//! emits a checkpoint event whose payload is the SHA-256 over all
//! preceding transcript bytes plus an Ed25519 signature over that hash;
//! any later edit to earlier lines breaks the chain. Readers tolerate a
//! partial last line (the single writer may be mid-append).

use chrono::{SecondsFormat, Utc};
use ring::digest::{Context, SHA256};
use ryeos_core::Result;
use ryeos_store::keys::{to_hex, SigningKey};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 16;

pub struct TranscriptWriter {
    path: PathBuf,
    hasher: Context,
    key: Option<Arc<SigningKey>>,
    checkpoint_interval: usize,
    events_since_checkpoint: usize,
}

impl TranscriptWriter {
    pub fn create(path: PathBuf, key: Option<Arc<SigningKey>>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut hasher = Context::new(&SHA256);
        // Resuming an existing transcript keeps the hash chain intact by
        // replaying the bytes already on disk.
        if path.exists() {
            let existing = std::fs::read(&path)?;
            hasher.update(&existing);
        }
        Ok(Self {
            path,
            hasher,
            key,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            events_since_checkpoint: 0,
        })
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event; emits a checkpoint when the interval fills.
    pub fn append(&mut self, event_kind: &str, payload: Value) -> Result<()> {
        self.write_line(json!({
            "ts": now_iso(),
            "event": event_kind,
            "payload": payload,
        }))?;
        self.events_since_checkpoint += 1;
        if self.events_since_checkpoint >= self.checkpoint_interval {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Hash of everything written so far, signed when a key is present.
    pub fn checkpoint(&mut self) -> Result<()> {
        let hash = to_hex(self.hasher.clone().finish().as_ref());
        let signature = self.key.as_ref().map(|k| k.sign_b64(hash.as_bytes()));
        self.write_line(json!({
            "ts": now_iso(),
            "event": "checkpoint",
            "payload": {
                "covered_hash": hash,
                "signature": signature,
            },
        }))?;
        self.events_since_checkpoint = 0;
        Ok(())
    }

    fn write_line(&mut self, value: Value) -> Result<()> {
        let mut line = serde_json::to_string(&value)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        self.hasher.update(line.as_bytes());
        Ok(())
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Read transcript events, skipping a torn final line.
pub fn read_events(path: &Path) -> Result<Vec<Value>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Ok(Vec::new()),
    };
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Verify a transcript's hash chain: each checkpoint's `covered_hash`
/// must equal the SHA-256 of all bytes before its own line.
pub fn verify_chain(path: &Path) -> Result<bool> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(_) => return Ok(true),
    };
    let mut hasher = Context::new(&SHA256);
    for line in split_inclusive_lines(&raw) {
        if let Ok(value) = serde_json::from_slice::<Value>(line) {
            if value["event"] == "checkpoint" {
                let expected = to_hex(hasher.clone().finish().as_ref());
                if value["payload"]["covered_hash"] != Value::String(expected) {
                    return Ok(false);
                }
            }
        }
        hasher.update(line);
    }
    Ok(true)
}

fn split_inclusive_lines(raw: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in raw.iter().enumerate() {
        if *b == b'\n' {
            out.push(&raw[start..=i]);
            start = i + 1;
        }
    }
    if start < raw.len() {
        out.push(&raw[start..]);
    }
    out
}
