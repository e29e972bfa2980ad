//! Process executor: spawn children, stream their output, feed them input,
//! and terminate them -- driving the early-exit protocol throughout.
//!
//! Every operation that waits for output returns as soon as it has useful
//! news: the child exited, a prompt was detected in the bytes that just
//! arrived, the idle window confirmed an unterminated prompt, or the caller's
//! timeout elapsed. The drain tasks spawned here are the sole writers into a
//! session's buffer for the lifetime of the child; tool handlers never touch
//! a stream directly.

use serde::Serialize;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};

use crate::detect;
use crate::error::{Result, ServerError};
use crate::policy::{self, CommandPolicy};
use crate::store::{Session, SessionState, SessionStore};

/// Ceiling for any caller-supplied wait, kept under the dispatcher's 60 s
/// handler timeout so the reply always beats the transport deadline.
pub const MAX_WAIT_MS: u64 = 50_000;

/// Default wait for `start_process` before returning with `is_blocked`.
pub const DEFAULT_START_TIMEOUT_MS: u64 = 30_000;

/// Default wait for `read_process_output` / `interact_with_process`.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;

/// SIGTERM-to-SIGKILL grace for `force_terminate`.
const KILL_GRACE: Duration = Duration::from_millis(200);

/// How much buffer tail the prompt detector inspects.
const DETECT_TAIL: usize = 512;

/// Reply from `start_process`.
#[derive(Debug, Clone, Serialize)]
pub struct StartReply {
    pub pid: u32,
    pub output: String,
    pub state: SessionState,
    pub is_blocked: bool,
}

/// Reply from `read_process_output` and `interact_with_process`.
#[derive(Debug, Clone, Serialize)]
pub struct ReadReply {
    pub pid: u32,
    pub output: String,
    pub state: SessionState,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub runtime_ms: u64,
    pub timed_out: bool,
    pub truncated: bool,
}

/// One row of `list_sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub pid: u32,
    pub command: String,
    pub state: SessionState,
    pub is_blocked: bool,
    pub runtime_ms: u64,
}

/// What ended a wait loop.
struct WaitOutcome {
    bytes: Vec<u8>,
    cursor: u64,
    state: SessionState,
    exit_code: Option<i32>,
    timed_out: bool,
    truncated: bool,
}

type StdinMap = std::collections::HashMap<u32, Arc<tokio::sync::Mutex<ChildStdin>>>;

pub struct ProcessExecutor {
    store: Arc<SessionStore>,
    policy: Arc<CommandPolicy>,
    default_shell: String,
    /// stdin handles stay here, not in the store: the store tracks state,
    /// the executor owns live OS resources. Entries are removed when the
    /// child is reaped.
    stdin_handles: Arc<Mutex<StdinMap>>,
}

impl ProcessExecutor {
    pub fn new(store: Arc<SessionStore>, policy: Arc<CommandPolicy>, default_shell: String) -> Self {
        Self {
            store,
            policy,
            default_shell,
            stdin_handles: Arc::new(Mutex::new(StdinMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Spawn `command` via a shell and wait -- up to `timeout_ms` -- for the
    /// first useful news: exit, prompt, or idle-confirmed prompt. The drain
    /// tasks keep running after this returns; they are the authoritative
    /// writers for the whole life of the child.
    pub async fn start_process(
        &self,
        command: &str,
        timeout_ms: Option<u64>,
        shell: Option<&str>,
    ) -> Result<StartReply> {
        self.policy.validate(command)?;
        let sanitized = policy::strip_permission_token(command);
        let shell = shell
            .map(str::to_string)
            .unwrap_or_else(|| self.default_shell.clone());

        let mut cmd = Command::new(&shell);
        if cfg!(windows) {
            cmd.arg("/c");
        } else {
            cmd.arg("-c");
        }
        cmd.arg(&sanitized);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Own process group so force_terminate reaches the whole tree.
        // SAFETY: pre_exec runs between fork and exec in the child.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(ServerError::SpawnFailure)?;
        let pid = child
            .id()
            .ok_or_else(|| ServerError::Internal("spawned child has no pid".to_string()))?;

        let session = Arc::new(Session::new(pid, command.to_string(), shell, None));
        self.store.insert(session.clone());

        let stdin = child.stdin.take().map(tokio::sync::Mutex::new).map(Arc::new);
        if let Some(handle) = stdin {
            self.stdin_map().insert(pid, handle);
        }
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tracing::info!(pid, command = %session.command, "start_process");

        let stdout_task = stdout.map(|stream| {
            tokio::spawn(drain_stream(stream, session.clone(), self.store.clone(), "stdout"))
        });
        let stderr_task = stderr.map(|stream| {
            tokio::spawn(drain_stream(stream, session.clone(), self.store.clone(), "stderr"))
        });

        self.spawn_supervisor(child, session.clone(), stdout_task, stderr_task);

        let timeout = clamp_timeout(timeout_ms, DEFAULT_START_TIMEOUT_MS);
        let outcome = wait_for_event(&session, 0, Instant::now() + timeout).await;
        session.advance_cursor(outcome.cursor);
        if outcome.timed_out {
            session.mark_blocked();
        }

        Ok(StartReply {
            pid,
            output: String::from_utf8_lossy(&outcome.bytes).into_owned(),
            state: outcome.state,
            is_blocked: outcome.timed_out,
        })
    }

    /// Read everything past the session's cursor, waiting with the early-exit
    /// rules when nothing is pending. A Finished session with an empty tail
    /// returns immediately.
    pub async fn read_process_output(&self, pid: u32, timeout_ms: Option<u64>) -> Result<ReadReply> {
        let session = self.store.get(pid)?;
        let timeout = clamp_timeout(timeout_ms, DEFAULT_READ_TIMEOUT_MS);
        let outcome = wait_for_event(&session, session.read_cursor(), Instant::now() + timeout).await;
        session.advance_cursor(outcome.cursor);
        Ok(self.read_reply(&session, outcome))
    }

    /// Write a line to the child's stdin, then (unless `wait_for_prompt` is
    /// off) wait for the response with the same early-exit rules, starting
    /// from the cursor position after the write.
    pub async fn interact_with_process(
        &self,
        pid: u32,
        input: &str,
        timeout_ms: Option<u64>,
        wait_for_prompt: bool,
    ) -> Result<ReadReply> {
        let session = self.store.get(pid)?;
        if session.is_finished() {
            return Err(ServerError::SessionGone(pid));
        }
        let stdin = self
            .stdin_map()
            .get(&pid)
            .cloned()
            .ok_or(ServerError::SessionGone(pid))?;

        let mut line = input.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        {
            let mut writer = stdin.lock().await;
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(|_| ServerError::SessionGone(pid))?;
            writer.flush().await.map_err(|_| ServerError::SessionGone(pid))?;
        }

        if !wait_for_prompt {
            return Ok(ReadReply {
                pid,
                output: String::new(),
                state: session.state(),
                is_complete: session.is_finished(),
                exit_code: session.exit_code(),
                runtime_ms: session.runtime_ms(),
                timed_out: false,
                truncated: false,
            });
        }

        let timeout = clamp_timeout(timeout_ms, DEFAULT_READ_TIMEOUT_MS);
        let outcome = wait_for_event(&session, session.read_cursor(), Instant::now() + timeout).await;
        session.advance_cursor(outcome.cursor);
        Ok(self.read_reply(&session, outcome))
    }

    /// Terminate the child's process group: SIGTERM, a short grace, then
    /// SIGKILL. Idempotent -- terminating a finished session is a no-op
    /// success. The session entry survives until the supervisor observes the
    /// exit code.
    pub async fn force_terminate(&self, pid: u32) -> Result<()> {
        let session = self.store.get(pid)?;
        if session.is_finished() {
            return Ok(());
        }
        tracing::info!(pid, "force_terminate");
        terminate_tree(pid, false);
        tokio::time::sleep(KILL_GRACE).await;
        if !session.is_finished() {
            terminate_tree(pid, true);
        }
        Ok(())
    }

    /// Snapshot of every tracked session. Pure: observes, never mutates.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.store
            .list()
            .into_iter()
            .map(|s| SessionSummary {
                pid: s.pid,
                command: s.command.clone(),
                state: s.state(),
                is_blocked: s.is_blocked(),
                runtime_ms: s.runtime_ms(),
            })
            .collect()
    }

    fn read_reply(&self, session: &Session, outcome: WaitOutcome) -> ReadReply {
        ReadReply {
            pid: session.pid,
            output: String::from_utf8_lossy(&outcome.bytes).into_owned(),
            state: outcome.state,
            is_complete: outcome.state == SessionState::Finished,
            exit_code: outcome.exit_code,
            runtime_ms: session.runtime_ms(),
            timed_out: outcome.timed_out,
            truncated: outcome.truncated,
        }
    }

    fn stdin_map(&self) -> std::sync::MutexGuard<'_, StdinMap> {
        self.stdin_handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reap the child: wait for exit, let the drains hit EOF, then publish
    /// the exit code. Publishing after the drains join keeps the buffer
    /// complete by the time any reader can observe Finished.
    fn spawn_supervisor(
        &self,
        mut child: Child,
        session: Arc<Session>,
        stdout_task: Option<tokio::task::JoinHandle<()>>,
        stderr_task: Option<tokio::task::JoinHandle<()>>,
    ) {
        let pid = session.pid;
        let stdin_handles = self.stdin_handles.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(err) => {
                    tracing::warn!(pid, error = %err, "wait on child failed");
                    -1
                }
            };
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            stdin_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&pid);
            session.finish(exit_code);
            tracing::debug!(pid, exit_code, "session finished");
        });
    }
}

/// Map an exit status to the reply's integer code. A signal-killed child
/// reports -1 (no code), matching the terminate path.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn clamp_timeout(timeout_ms: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(timeout_ms.unwrap_or(default_ms).min(MAX_WAIT_MS))
}

/// Drain one stream into the session buffer. One retry on a transient read
/// error; a second failure is recorded inline and the drain ends -- state is
/// untouched until the supervisor reaps the child.
async fn drain_stream<R: AsyncReadExt + Unpin>(
    mut stream: R,
    session: Arc<Session>,
    store: Arc<SessionStore>,
    label: &'static str,
) {
    let mut buf = [0u8; 8192];
    let mut retried = false;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => store.append_output(&session, &buf[..n]),
            Err(err) => {
                if !retried {
                    retried = true;
                    continue;
                }
                tracing::warn!(pid = session.pid, stream = label, error = %err, "drain error");
                let note = format!("\n[hostshell: {label} read error: {err}]\n");
                store.append_output(&session, note.as_bytes());
                break;
            }
        }
    }
}

/// The early-exit wait loop shared by start/read/interact.
///
/// Returns on whichever comes first: the session finishes; new bytes arrive
/// whose tail matches a prompt (fast path); the idle window elapses after
/// some output and the tail reads as an unterminated prompt (slow path); the
/// deadline passes.
async fn wait_for_event(session: &Arc<Session>, from: u64, deadline: Instant) -> WaitOutcome {
    let mut collected: Vec<u8> = Vec::new();
    let mut cursor = from;
    let mut truncated = false;
    // One idle check per quiet spell; reset when bytes arrive.
    let mut idle_checked = false;

    loop {
        // Wake early for the idle check when output exists and is quiet.
        let idle_at = if session.has_output() && !idle_checked {
            Some(session.last_activity() + detect::PROMPT_IDLE)
        } else {
            None
        };
        let wake_at = idle_at.map_or(deadline, |idle| idle.min(deadline));

        let drained = session.drain_since(cursor, wake_at).await;
        cursor = drained.cursor;
        truncated |= drained.truncated;
        collected.extend_from_slice(&drained.bytes);

        if drained.state == SessionState::Finished {
            return WaitOutcome {
                bytes: collected,
                cursor,
                state: SessionState::Finished,
                exit_code: drained.exit_code,
                timed_out: false,
                truncated,
            };
        }

        if !drained.bytes.is_empty() {
            idle_checked = false;
            // Fast path: check the buffer tail on every arriving chunk.
            if detect::prompt_at_tail(&session.tail(DETECT_TAIL)).is_some() {
                session.set_waiting();
                return WaitOutcome {
                    bytes: collected,
                    cursor,
                    state: SessionState::WaitingForInput,
                    exit_code: None,
                    timed_out: false,
                    truncated,
                };
            }
        } else {
            // Nothing new: either the idle timer or the deadline fired.
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome {
                    bytes: collected,
                    cursor,
                    state: drained.state,
                    exit_code: None,
                    timed_out: true,
                    truncated,
                };
            }
            // Slow path: quiet for the idle window with a dangling tail.
            if session.has_output() && session.last_activity().elapsed() >= detect::PROMPT_IDLE {
                idle_checked = true;
                if detect::idle_tail_waiting(&session.tail(DETECT_TAIL)) {
                    session.set_waiting();
                    return WaitOutcome {
                        bytes: collected,
                        cursor,
                        state: SessionState::WaitingForInput,
                        exit_code: None,
                        timed_out: false,
                        truncated,
                    };
                }
            }
        }
    }
}

/// Kill the whole process tree. Unix signals the `setsid` group; Windows
/// delegates to `taskkill /T`, the platform's tree-termination mechanism.
#[cfg(unix)]
fn terminate_tree(pid: u32, force: bool) {
    let signal = if force {
        nix::sys::signal::Signal::SIGKILL
    } else {
        nix::sys::signal::Signal::SIGTERM
    };
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(-(pid as i32)), signal);
}

#[cfg(windows)]
fn terminate_tree(pid: u32, force: bool) {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.arg("/T").arg("/PID").arg(pid.to_string());
    if force {
        cmd.arg("/F");
    }
    let _ = cmd.status();
}
