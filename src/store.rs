//! Process session store: live and recently-finished child sessions by PID.
//!
//! The store owns every [`Session`]. The two drain tasks append into the
//! session's merged output buffer; readers consume through [`Session::
//! drain_since`], the one blocking primitive in the daemon. Buffer, cursor,
//! state, and exit code all live behind a single per-session mutex so every
//! reader observes one consistent `(bytes, state)` snapshot. Finished
//! sessions linger for a grace period so a late read still sees the tail and
//! the exit code, then are pruned on registry access.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    WaitingForInput,
    Finished,
}

struct SessionInner {
    buffer: Vec<u8>,
    /// Bytes evicted from the front of `buffer` by the cap.
    /// `dropped + buffer.len()` is the absolute write offset.
    dropped: u64,
    truncated: bool,
    state: SessionState,
    exit_code: Option<i32>,
    read_cursor: u64,
    last_activity: Instant,
    finished_at: Option<Instant>,
}

/// One spawned child process. Mutable state lives in `inner` behind a std
/// mutex (critical sections are short and never await); waiters park on
/// `notify`.
pub struct Session {
    pub pid: u32,
    pub command: String,
    pub shell: String,
    pub cwd: Option<PathBuf>,
    pub started_at: Instant,
    is_blocked: AtomicBool,
    inner: Mutex<SessionInner>,
    notify: Notify,
}

/// A consistent read snapshot returned by [`Session::drain_since`].
pub struct Drained {
    pub bytes: Vec<u8>,
    pub cursor: u64,
    pub state: SessionState,
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

impl Session {
    pub fn new(pid: u32, command: String, shell: String, cwd: Option<PathBuf>) -> Self {
        Self {
            pid,
            command,
            shell,
            cwd,
            started_at: Instant::now(),
            is_blocked: AtomicBool::new(false),
            inner: Mutex::new(SessionInner {
                buffer: Vec::new(),
                dropped: 0,
                truncated: false,
                state: SessionState::Running,
                exit_code: None,
                read_cursor: 0,
                last_activity: Instant::now(),
                finished_at: None,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until bytes past `cursor` exist, the session finishes, or the
    /// deadline passes -- whichever is first. Returns everything available
    /// past the cursor in one snapshot. A Finished session with nothing left
    /// to read returns immediately with the empty slice and the exit code.
    pub async fn drain_since(&self, cursor: u64, deadline: Instant) -> Drained {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the condition so a wakeup
            // between the check and the await cannot be missed.
            notified.as_mut().enable();

            {
                let inner = self.lock();
                let end = inner.dropped + inner.buffer.len() as u64;
                let effective = cursor.max(inner.dropped);
                if end > effective || inner.state == SessionState::Finished {
                    let start = ((effective - inner.dropped) as usize).min(inner.buffer.len());
                    return Drained {
                        bytes: inner.buffer[start..].to_vec(),
                        cursor: end,
                        state: inner.state,
                        exit_code: inner.exit_code,
                        truncated: inner.truncated,
                    };
                }
            }

            if tokio::time::timeout_at(deadline.into(), notified).await.is_err() {
                let inner = self.lock();
                return Drained {
                    bytes: Vec::new(),
                    cursor,
                    state: inner.state,
                    exit_code: inner.exit_code,
                    truncated: inner.truncated,
                };
            }
        }
    }

    /// Append child output. Enforces the byte cap by dropping the oldest
    /// bytes, resets a published WaitingForInput back to Running (new output
    /// means the program spoke again), and wakes every waiter.
    pub fn append_output(&self, bytes: &[u8], cap: usize) {
        {
            let mut inner = self.lock();
            inner.buffer.extend_from_slice(bytes);
            if inner.buffer.len() > cap {
                let excess = inner.buffer.len() - cap;
                inner.buffer.drain(..excess);
                inner.dropped += excess as u64;
                inner.truncated = true;
            }
            inner.last_activity = Instant::now();
            if inner.state == SessionState::WaitingForInput {
                inner.state = SessionState::Running;
            }
        }
        self.notify.notify_waiters();
    }

    /// Publish WaitingForInput. No-op once Finished.
    pub fn set_waiting(&self) {
        {
            let mut inner = self.lock();
            if inner.state == SessionState::Running {
                inner.state = SessionState::WaitingForInput;
            }
        }
        self.notify.notify_waiters();
    }

    /// Publish the terminal state. The exit code is written before the state
    /// flips, under the same lock, so no reader can observe Finished without
    /// a code. Later calls keep the first result.
    pub fn finish(&self, exit_code: i32) {
        {
            let mut inner = self.lock();
            if inner.state == SessionState::Finished {
                return;
            }
            inner.exit_code = Some(exit_code);
            inner.state = SessionState::Finished;
            inner.finished_at = Some(Instant::now());
        }
        self.notify.notify_waiters();
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SessionState::Finished
    }

    fn finished_for(&self) -> Option<Duration> {
        self.lock().finished_at.map(|at| at.elapsed())
    }

    pub fn read_cursor(&self) -> u64 {
        self.lock().read_cursor
    }

    /// Move the shared read cursor forward. Never moves backwards.
    pub fn advance_cursor(&self, to: u64) {
        let mut inner = self.lock();
        if to > inner.read_cursor {
            inner.read_cursor = to;
        }
    }

    /// Last `n` buffered bytes, for the prompt detector.
    pub fn tail(&self, n: usize) -> Vec<u8> {
        let inner = self.lock();
        let start = inner.buffer.len().saturating_sub(n);
        inner.buffer[start..].to_vec()
    }

    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    /// Whether any output has ever arrived.
    pub fn has_output(&self) -> bool {
        let inner = self.lock();
        inner.dropped > 0 || !inner.buffer.is_empty()
    }

    pub fn mark_blocked(&self) {
        self.is_blocked.store(true, Ordering::Relaxed);
    }

    pub fn is_blocked(&self) -> bool {
        self.is_blocked.load(Ordering::Relaxed)
    }

    pub fn runtime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Registry of sessions keyed by PID.
pub struct SessionStore {
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
    buffer_cap: usize,
    linger: Duration,
}

impl SessionStore {
    pub fn new(buffer_cap: usize, linger: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            buffer_cap,
            linger,
        }
    }

    pub fn buffer_cap(&self) -> usize {
        self.buffer_cap
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.prune_finished();
        self.map().insert(session.pid, session);
    }

    pub fn get(&self, pid: u32) -> Result<Arc<Session>> {
        self.map()
            .get(&pid)
            .cloned()
            .ok_or(ServerError::SessionNotFound(pid))
    }

    /// Snapshot of every session, pruning expired entries first.
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.prune_finished();
        self.map().values().cloned().collect()
    }

    pub fn remove(&self, pid: u32) -> Option<Arc<Session>> {
        self.map().remove(&pid)
    }

    /// Convenience wrapper applying the store's cap.
    pub fn append_output(&self, session: &Session, bytes: &[u8]) {
        session.append_output(bytes, self.buffer_cap);
    }

    /// Drop sessions that finished longer than the grace period ago.
    fn prune_finished(&self) {
        let linger = self.linger;
        self.map()
            .retain(|_, s| s.finished_for().is_none_or(|elapsed| elapsed < linger));
    }
}
