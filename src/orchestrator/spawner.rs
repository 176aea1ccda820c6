//! Host CLI process launcher.
//!
//! [`ProcessLauncher`] runs each session as a host CLI child process with:
//! - `env_clear()` plus a safe allowlist, so server secrets never reach the
//!   child.
//! - `kill_on_drop(true)`, so a dropped monitor never leaks a process.
//! - NDJSON stdout: every line is mirrored into the session's transcript
//!   file, and `usage`/`result` lines feed cumulative usage to the budget
//!   guard.
//!
//! `terminate` sends SIGTERM, waits the configured grace period, then kills.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::launcher::{
    LaunchFuture, LaunchRequest, LaunchedSession, SessionLauncher, SessionOutcome, SessionSignal,
};
use crate::bridge::source::{JsonlFileSource, TranscriptEnd};
use crate::codec::NdjsonCodec;
use crate::config::GlobalConfig;
use crate::models::budget::Usage;
use crate::models::transcript::{TranscriptEvent, TranscriptEventKind};
use crate::{AppError, Result};

/// Environment variables inherited by session processes.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "RUST_LOG",
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Bytes of stderr retained for failure reports.
pub const STDERR_TAIL_BYTES: usize = 4096;

const SIGNAL_BUFFER: usize = 64;

/// Transcript file for a session: `<project>/.conductor/transcripts/<id>.jsonl`.
#[must_use]
pub fn transcript_path(project_path: &str, session_id: &str) -> PathBuf {
    Path::new(project_path)
        .join(".conductor")
        .join("transcripts")
        .join(format!("{session_id}.jsonl"))
}

/// Launcher settings.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Host CLI binary.
    pub host_cli: String,
    /// Arguments passed before the prompt.
    pub host_cli_args: Vec<String>,
    /// Wait between SIGTERM and a forced kill.
    pub terminate_grace: Duration,
}

impl SpawnConfig {
    /// Settings taken from the global configuration.
    #[must_use]
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            host_cli: config.host_cli.clone(),
            host_cli_args: config.host_cli_args.clone(),
            terminate_grace: Duration::from_secs(config.launcher.terminate_grace_seconds),
        }
    }
}

#[derive(Debug, Clone)]
struct RunningChild {
    pid: Option<u32>,
    kill: CancellationToken,
    exited: CancellationToken,
}

type ChildMap = Arc<Mutex<HashMap<String, RunningChild>>>;

/// [`SessionLauncher`] backed by host CLI child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: Arc<SpawnConfig>,
    children: ChildMap,
}

impl ProcessLauncher {
    /// Create a launcher.
    #[must_use]
    pub fn new(config: SpawnConfig) -> Self {
        Self {
            config: Arc::new(config),
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ids of sessions whose process is still running, sorted.
    pub async fn running_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.children.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Host CLI invocation for one run, with a scrubbed environment.
    fn command(&self, session_id: &str, request: &LaunchRequest, resume: bool) -> Command {
        let mut cmd = Command::new(&self.config.host_cli);
        cmd.args(&self.config.host_cli_args).arg(&request.prompt);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env("CONDUCTOR_SESSION_ID", session_id)
            .env("CONDUCTOR_PROJECT_PATH", &request.project_path);
        if resume {
            cmd.env("CONDUCTOR_RESUME", "1");
        }

        cmd.current_dir(&request.project_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn launch(
        &self,
        session_id: String,
        request: LaunchRequest,
        resume: bool,
    ) -> Result<LaunchedSession> {
        let spawn_error = |stderr: String| AppError::Process {
            session_id: Some(session_id.clone()),
            exit_code: None,
            stderr,
        };

        let transcript = transcript_path(&request.project_path, &session_id);
        if let Some(parent) = transcript.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                spawn_error(format!("failed to create transcript directory: {err}"))
            })?;
        }

        // A continued session appends to the same file; its run starts here.
        let start_offset = tokio::fs::metadata(&transcript)
            .await
            .map_or(0, |meta| meta.len());

        let mut cmd = self.command(&session_id, &request, resume);
        let mut child = cmd
            .spawn()
            .map_err(|err| spawn_error(format!("failed to spawn host cli: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error("failed to capture stderr".into()))?;

        let running = RunningChild {
            pid: child.id(),
            kill: CancellationToken::new(),
            exited: CancellationToken::new(),
        };
        self.children
            .lock()
            .await
            .insert(session_id.clone(), running.clone());

        info!(
            session_id,
            pid = running.pid.unwrap_or(0),
            host_cli = self.config.host_cli,
            resume,
            "session process spawned"
        );

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let finished = CancellationToken::new();
        let end = TranscriptEnd::new();
        let monitor = SessionMonitor {
            session_id: session_id.clone(),
            transcript: transcript.clone(),
            start_offset,
            signals: tx,
            running,
            end: end.clone(),
            finished: finished.clone(),
            children: Arc::clone(&self.children),
        };
        tokio::spawn(
            monitor
                .run(child, stdout, stderr)
                .instrument(info_span!("session_monitor", session_id)),
        );

        Ok(LaunchedSession {
            session_id,
            signals: rx,
            transcript: Some(Box::new(
                JsonlFileSource::new(transcript, finished)
                    .starting_at(start_offset)
                    .bounded_by(end),
            )),
        })
    }
}

impl SessionLauncher for ProcessLauncher {
    fn start(&self, request: &LaunchRequest) -> LaunchFuture<'_, LaunchedSession> {
        let request = request.clone();
        Box::pin(async move {
            let session_id = Uuid::new_v4().to_string();
            self.launch(session_id, request, false).await
        })
    }

    fn continue_session(
        &self,
        session_id: &str,
        request: &LaunchRequest,
    ) -> LaunchFuture<'_, LaunchedSession> {
        let session_id = session_id.to_owned();
        let request = request.clone();
        Box::pin(async move {
            if self.children.lock().await.contains_key(&session_id) {
                return Err(AppError::Process {
                    session_id: Some(session_id),
                    exit_code: None,
                    stderr: "session is still running".into(),
                });
            }
            self.launch(session_id, request, true).await
        })
    }

    fn terminate(&self, session_id: &str) -> LaunchFuture<'_, ()> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            let Some(running) = self.children.lock().await.get(&session_id).cloned() else {
                debug!(session_id, "terminate: no running process");
                return Ok(());
            };

            send_sigterm(&session_id, running.pid);
            tokio::select! {
                () = running.exited.cancelled() => {
                    info!(session_id, "session process exited after SIGTERM");
                }
                () = tokio::time::sleep(self.config.terminate_grace) => {
                    warn!(session_id, "grace period elapsed, killing session process");
                    running.kill.cancel();
                    running.exited.cancelled().await;
                }
            }
            Ok(())
        })
    }
}

#[cfg(unix)]
fn send_sigterm(session_id: &str, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(session_id, %err, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(session_id: &str, _pid: Option<u32>) {
    debug!(session_id, "SIGTERM unavailable; waiting for grace period");
}

// ── Monitor ──────────────────────────────────────────────────────────────────

struct SessionMonitor {
    session_id: String,
    transcript: PathBuf,
    start_offset: u64,
    signals: mpsc::Sender<SessionSignal>,
    running: RunningChild,
    end: TranscriptEnd,
    finished: CancellationToken,
    children: ChildMap,
}

impl SessionMonitor {
    async fn run(self, mut child: Child, stdout: ChildStdout, stderr: ChildStderr) {
        let stdout_task = tokio::spawn(pump_stdout(
            self.session_id.clone(),
            stdout,
            self.transcript.clone(),
            self.signals.clone(),
        ));
        let stderr_task = tokio::spawn(read_stderr_tail(stderr));

        let status = tokio::select! {
            status = child.wait() => status,
            () = self.running.kill.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(session_id = self.session_id, %err, "failed to kill session process");
                }
                child.wait().await
            }
        };

        let usage = match stdout_task.await {
            Ok(Ok(usage)) => usage,
            Ok(Err(err)) => {
                warn!(session_id = self.session_id, %err, "stdout pump failed");
                Usage::default()
            }
            Err(err) => {
                warn!(session_id = self.session_id, %err, "stdout pump task failed");
                Usage::default()
            }
        };
        let stderr = stderr_task.await.unwrap_or_default();
        let transcript_len = tokio::fs::metadata(&self.transcript)
            .await
            .map_or(self.start_offset, |meta| meta.len());
        self.end.set(transcript_len);
        self.finished.cancel();

        let outcome = classify_exit(status, stderr, usage);
        info!(session_id = self.session_id, ?outcome, "session process exited");

        // Unregistered before the exit signal so the session can be continued
        // as soon as the signal is seen.
        self.children.lock().await.remove(&self.session_id);
        self.running.exited.cancel();

        if self
            .signals
            .send(SessionSignal::Exited(outcome))
            .await
            .is_err()
        {
            debug!(session_id = self.session_id, "exit signal receiver dropped");
        }
    }
}

fn classify_exit(
    status: std::io::Result<ExitStatus>,
    stderr: String,
    usage: Usage,
) -> SessionOutcome {
    match status {
        Ok(status) if status.success() => SessionOutcome::Succeeded { usage },
        Ok(status) => {
            let stderr = if stderr.trim().is_empty() {
                status.code().map_or_else(
                    || "process terminated by signal".to_owned(),
                    |c| format!("process exited with code {c}"),
                )
            } else {
                stderr
            };
            SessionOutcome::Failed {
                exit_code: status.code(),
                stderr,
                usage,
            }
        }
        Err(err) => SessionOutcome::Failed {
            exit_code: None,
            stderr: format!("wait error: {err}"),
            usage,
        },
    }
}

async fn pump_stdout(
    session_id: String,
    stdout: ChildStdout,
    transcript: PathBuf,
    signals: mpsc::Sender<SessionSignal>,
) -> Result<Usage> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&transcript)
        .await?;
    let mut lines = FramedRead::new(stdout, NdjsonCodec::new());
    let mut usage = Usage::default();

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(AppError::Parse(msg)) => {
                warn!(session_id, error = %msg, "dropping oversized stdout line");
                continue;
            }
            Err(err) => return Err(err),
        };
        if line.trim().is_empty() {
            continue;
        }

        let value = serde_json::from_str::<Value>(&line)
            .unwrap_or_else(|_| serde_json::json!({ "type": "text", "text": line }));
        let mut record = serde_json::to_string(&transcript_entry(&value))?;
        record.push('\n');
        file.write_all(record.as_bytes()).await?;

        if let Some(update) = usage_update(&value, usage) {
            usage = update;
            if signals.send(SessionSignal::Usage(usage)).await.is_err() {
                debug!(session_id, "usage receiver dropped");
            }
        }
    }

    file.flush().await?;
    Ok(usage)
}

async fn read_stderr_tail(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    if let Err(err) = stderr.read_to_end(&mut buf).await {
        debug!(%err, "stderr read failed");
    }
    let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim().to_owned()
}

/// Convert one stdout object into a transcript entry; `type` classifies it.
fn transcript_entry(value: &Value) -> TranscriptEvent {
    let kind = value
        .get("type")
        .cloned()
        .and_then(|t| serde_json::from_value::<TranscriptEventKind>(t).ok())
        .unwrap_or(TranscriptEventKind::Unknown);
    let id = value
        .get("id")
        .or_else(|| value.get("uuid"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    TranscriptEvent {
        id,
        kind,
        payload: value.clone(),
        timestamp: Utc::now(),
    }
}

/// Cumulative usage carried by a `usage` or `result` line.
///
/// Accepts `cost_usd`/`total_cost_usd` and `turns`/`num_turns`; fields a
/// line omits keep their previous value.
fn usage_update(value: &Value, previous: Usage) -> Option<Usage> {
    let kind = value.get("type").and_then(Value::as_str)?;
    if kind != "usage" && kind != "result" {
        return None;
    }
    let cost_usd = value
        .get("cost_usd")
        .or_else(|| value.get("total_cost_usd"))
        .and_then(Value::as_f64)
        .unwrap_or(previous.cost_usd);
    let turns = value
        .get("turns")
        .or_else(|| value.get("num_turns"))
        .and_then(Value::as_u64)
        .and_then(|t| u32::try_from(t).ok())
        .unwrap_or(previous.turns);
    Some(Usage { cost_usd, turns })
}
