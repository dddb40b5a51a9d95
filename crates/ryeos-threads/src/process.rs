//! Process driver — the OS boundary for thread subprocesses
//!
//! Three operations: capture a command inline, spawn a detached runner,
//! and kill graceful-then-force. The tokio implementation uses plain OS
//! primitives (no helper binary required); the null driver records calls
//! for tests.

use async_trait::async_trait;
use ryeos_core::{Error, Result};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct CapturedOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ProcessDriver: Send + Sync {
    /// Run to completion, capturing output.
    async fn exec_capture(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<CapturedOutput>;

    /// Launch and return the pid without waiting.
    async fn spawn_detached(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<u32>;

    /// SIGTERM, wait out the grace period, then SIGKILL if still alive.
    async fn kill_graceful_then_force(&self, pid: u32, grace: Duration) -> Result<()>;
}

#[derive(Default)]
pub struct TokioProcessDriver;

#[async_trait]
impl ProcessDriver for TokioProcessDriver {
    async fn exec_capture(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<CapturedOutput> {
        let output = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .map_err(|e| Error::Primitive(format!("exec {program}: {e}")))?;
        Ok(CapturedOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn spawn_detached(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<u32> {
        let child = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Primitive(format!("spawn {program}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Primitive(format!("spawned {program} but pid unavailable")))?;
        debug!(program, pid, "detached process spawned");
        // The child outlives this handle; dropping does not kill it.
        Ok(pid)
    }

    async fn kill_graceful_then_force(&self, pid: u32, grace: Duration) -> Result<()> {
        signal(pid, "TERM").await?;
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !alive(pid).await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!(pid, "grace period expired, sending SIGKILL");
        signal(pid, "KILL").await
    }
}

async fn signal(pid: u32, sig: &str) -> Result<()> {
    let status = Command::new("kill")
        .arg(format!("-{sig}"))
        .arg(pid.to_string())
        .status()
        .await
        .map_err(|e| Error::Primitive(format!("kill -{sig} {pid}: {e}")))?;
    if !status.success() {
        return Err(Error::Primitive(format!("kill -{sig} {pid} failed")));
    }
    Ok(())
}

async fn alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Records spawn requests instead of launching anything. Tests drive the
/// registry by hand.
#[derive(Default)]
pub struct NullProcessDriver {
    pub spawned: Mutex<Vec<(String, Vec<String>)>>,
    pub killed: Mutex<Vec<u32>>,
}

#[async_trait]
impl ProcessDriver for NullProcessDriver {
    async fn exec_capture(
        &self,
        program: &str,
        args: &[String],
        _env: &[(String, String)],
    ) -> Result<CapturedOutput> {
        self.spawned
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        Ok(CapturedOutput { exit_code: 0, stdout: String::new(), stderr: String::new() })
    }

    async fn spawn_detached(
        &self,
        program: &str,
        args: &[String],
        _env: &[(String, String)],
    ) -> Result<u32> {
        let mut spawned = self.spawned.lock().unwrap();
        spawned.push((program.to_string(), args.to_vec()));
        Ok(40_000 + spawned.len() as u32)
    }

    async fn kill_graceful_then_force(&self, pid: u32, _grace: Duration) -> Result<()> {
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_capture_runs() {
        let driver = TokioProcessDriver;
        let out = driver
            .exec_capture("echo", &["hello".into()], &[])
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn spawn_then_kill() {
        let driver = TokioProcessDriver;
        let pid = driver
            .spawn_detached("sleep", &["30".into()], &[])
            .await
            .unwrap();
        assert!(pid > 0);
        driver
            .kill_graceful_then_force(pid, Duration::from_secs(2))
            .await
            .unwrap();
    }
}
