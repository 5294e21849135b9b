//! Agent child-process supervision
//!
//! Resource and fencing agents run as forked children. Parameters go to the
//! agent on stdin as `key=value` lines; the action is both argv[1] and an
//! explicit `action` parameter. A timed-out child gets SIGTERM, five seconds
//! later SIGKILL, five seconds after that a warning and nothing further.

use crate::types::{ExecRc, OpStatus};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Grace between SIGTERM and SIGKILL, and between SIGKILL and giving up.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Environment variable exporting the device id to stonith-class agents.
pub const DEVICE_ID_ENV: &str = "META_DEVICE_ID";

#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub program: PathBuf,
    pub action: String,
    pub params: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub rc: ExecRc,
    pub status: OpStatus,
    pub stdout: String,
    pub stderr: String,
    pub exec_time_ms: u64,
    /// Pid the agent ran as; 0 when it never spawned.
    pub pid: u32,
}

impl AgentOutcome {
    fn failed(rc: ExecRc, status: OpStatus, detail: &str, elapsed: Duration, pid: u32) -> Self {
        Self {
            rc,
            status,
            stdout: String::new(),
            stderr: detail.to_string(),
            exec_time_ms: elapsed.as_millis() as u64,
            pid,
        }
    }
}

async fn drain<R: AsyncReadExt + Unpin>(pipe: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf).await;
    }
    buf
}

/// SIGTERM, wait, SIGKILL, wait, warn. Never more than two signals.
async fn escalate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let pid = Pid::from_raw(pid as i32);

    warn!("Agent pid {} exceeded its timeout; sending SIGTERM", pid);
    let _ = kill(pid, Signal::SIGTERM);
    if timeout(KILL_GRACE, child.wait()).await.is_ok() {
        return;
    }

    warn!("Agent pid {} ignored SIGTERM; sending SIGKILL", pid);
    let _ = kill(pid, Signal::SIGKILL);
    if timeout(KILL_GRACE, child.wait()).await.is_ok() {
        return;
    }

    warn!("Agent pid {} is unkillable; abandoning it", pid);
}

/// Run one agent invocation to completion or timeout.
pub async fn run_agent(spec: &AgentSpec) -> AgentOutcome {
    let started = Instant::now();

    let mut cmd = Command::new(&spec.program);
    cmd.arg(&spec.action)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Agent {:?} failed to spawn: {}", spec.program, e);
            return AgentOutcome::failed(
                ExecRc::NotInstalled,
                OpStatus::Error,
                &e.to_string(),
                started.elapsed(),
                0,
            );
        }
    };
    let pid = child.id().unwrap_or(0);

    if let Some(mut stdin) = child.stdin.take() {
        let mut lines = String::new();
        for (key, value) in &spec.params {
            lines.push_str(key);
            lines.push('=');
            lines.push_str(value);
            lines.push('\n');
        }
        lines.push_str("action=");
        lines.push_str(&spec.action);
        lines.push('\n');
        if let Err(e) = stdin.write_all(lines.as_bytes()).await {
            debug!("Agent {:?} closed stdin early: {}", spec.program, e);
        }
        // Dropping stdin delivers EOF.
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_task = tokio::spawn(drain(stdout));
    let err_task = tokio::spawn(drain(stderr));

    let wait = timeout(Duration::from_millis(spec.timeout_ms.max(1)), child.wait()).await;

    let outcome = match wait {
        Ok(Ok(exit)) => {
            let (rc, status) = match exit.code() {
                Some(code) => (ExecRc::from_exit(code), OpStatus::Done),
                // Killed by a signal outside our control.
                None => (ExecRc::Error, OpStatus::Error),
            };
            AgentOutcome {
                rc,
                status,
                stdout: out_task.await.unwrap_or_default(),
                stderr: err_task.await.unwrap_or_default(),
                exec_time_ms: started.elapsed().as_millis() as u64,
                pid,
            }
        }
        Ok(Err(e)) => AgentOutcome::failed(
            ExecRc::Error,
            OpStatus::Error,
            &e.to_string(),
            started.elapsed(),
            pid,
        ),
        Err(_) => {
            escalate(&mut child).await;
            out_task.abort();
            err_task.abort();
            AgentOutcome::failed(
                ExecRc::UnknownError,
                OpStatus::Timeout,
                "agent timed out",
                started.elapsed(),
                pid,
            )
        }
    };

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_reads_params_on_stdin() {
        // cat echoes stdin, so the parameter lines come back on stdout.
        let mut params = BTreeMap::new();
        params.insert("port".to_string(), "3306".to_string());
        let spec = AgentSpec {
            program: PathBuf::from("/bin/cat"),
            action: "-".to_string(),
            params,
            timeout_ms: 5_000,
            env: Vec::new(),
        };

        let outcome = run_agent(&spec).await;
        assert_eq!(outcome.rc, ExecRc::Ok);
        assert!(outcome.stdout.contains("port=3306"));
        assert!(outcome.stdout.contains("action=-"));
    }

    #[tokio::test]
    async fn test_missing_agent_is_not_installed() {
        let spec = AgentSpec {
            program: PathBuf::from("/nonexistent/agent"),
            action: "start".to_string(),
            params: BTreeMap::new(),
            timeout_ms: 1_000,
            env: Vec::new(),
        };
        let outcome = run_agent(&spec).await;
        assert_eq!(outcome.rc, ExecRc::NotInstalled);
        assert_eq!(outcome.status, OpStatus::Error);
    }

    #[tokio::test]
    async fn test_timeout_reports_timeout_status() {
        let spec = AgentSpec {
            program: PathBuf::from("/bin/sleep"),
            action: "30".to_string(),
            params: BTreeMap::new(),
            timeout_ms: 100,
            env: Vec::new(),
        };
        let outcome = run_agent(&spec).await;
        assert_eq!(outcome.status, OpStatus::Timeout);
        assert_eq!(outcome.rc, ExecRc::UnknownError);
    }

    #[tokio::test]
    async fn test_nonzero_exit_maps_to_ocf_rc() {
        let spec = AgentSpec {
            program: PathBuf::from("/bin/false"),
            action: "start".to_string(),
            params: BTreeMap::new(),
            timeout_ms: 5_000,
            env: Vec::new(),
        };
        let outcome = run_agent(&spec).await;
        assert_eq!(outcome.rc, ExecRc::Error);
    }
}
