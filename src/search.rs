//! Streaming search sessions: file-name and content search.
//!
//! Same lifecycle contract as process sessions -- start returns an early
//! snapshot, reads return only what was appended since the previous read
//! (a monotonic cursor, no sentinel records), stop cancels promptly, and
//! completed sessions are pruned after an idle period.
//!
//! Files mode walks the tree with the same walker library ripgrep uses.
//! Content mode runs ripgrep itself as a child process and parses its
//! line-delimited JSON output incrementally; a partial final line is
//! buffered across chunk boundaries. An rg exit code of 1 means "no
//! matches" and is not an error.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;

use crate::error::{Result, ServerError};

/// How long `start` blocks for first results before returning a snapshot.
const FIRST_RESULTS_WINDOW: Duration = Duration::from_millis(100);

/// Default cap when the caller doesn't supply one.
pub const DEFAULT_MAX_RESULTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    Files,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HitKind {
    File,
    Match,
    Context,
}

/// One incremental search record.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub kind: HitKind,
}

/// Arguments for one search, after path validation.
#[derive(Debug, Clone)]
pub struct SearchSpec {
    pub root: PathBuf,
    pub pattern: String,
    pub kind: SearchKind,
    pub file_pattern: Option<String>,
    pub ignore_case: bool,
    pub max_results: usize,
    pub include_hidden: bool,
    pub context_lines: u32,
    /// Overall deadline; the search is stopped (not errored) when it fires.
    pub timeout_ms: Option<u64>,
}

struct SearchInner {
    results: Vec<SearchHit>,
    complete: bool,
    error: Option<String>,
    read_cursor: usize,
    last_read: Instant,
    completed_at: Option<Instant>,
}

pub struct SearchSession {
    pub id: String,
    pub kind: SearchKind,
    pub root: PathBuf,
    pub pattern: String,
    pub started_at: Instant,
    inner: Mutex<SearchInner>,
    notify: Notify,
    stop: AtomicBool,
    stop_notify: Notify,
}

impl SearchSession {
    fn new(kind: SearchKind, root: PathBuf, pattern: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            root,
            pattern,
            started_at: Instant::now(),
            inner: Mutex::new(SearchInner {
                results: Vec::new(),
                complete: false,
                error: None,
                read_cursor: 0,
                last_read: Instant::now(),
                completed_at: None,
            }),
            notify: Notify::new(),
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SearchInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one record and wake anyone blocked in `start`'s first-results
    /// window. Returns the number of records now held.
    fn push(&self, hit: SearchHit) -> usize {
        let len = {
            let mut inner = self.lock();
            inner.results.push(hit);
            inner.results.len()
        };
        self.notify.notify_waiters();
        len
    }

    fn complete(&self) {
        {
            let mut inner = self.lock();
            if !inner.complete {
                inner.complete = true;
                inner.completed_at = Some(Instant::now());
            }
        }
        self.notify.notify_waiters();
    }

    fn fail(&self, message: String) {
        {
            let mut inner = self.lock();
            if inner.error.is_none() {
                inner.error = Some(message);
            }
            inner.complete = true;
            inner.completed_at = Some(Instant::now());
        }
        self.notify.notify_waiters();
    }

    /// Ask the driver to stop. Idempotent.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Resolve once a stop has been requested.
    async fn wait_stopped(&self) {
        loop {
            let notified = self.stop_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.stop_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Block until at least one record exists, the search completes, or the
    /// deadline passes.
    async fn wait_first_results(&self, deadline: Instant) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if !inner.results.is_empty() || inner.complete {
                    return;
                }
            }
            if tokio::time::timeout_at(deadline.into(), notified).await.is_err() {
                return;
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.lock().complete
    }

    fn completed_for(&self) -> Option<Duration> {
        self.lock().completed_at.map(|at| at.elapsed())
    }

    fn idle_for(&self) -> Duration {
        self.lock().last_read.elapsed()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartSearchReply {
    pub session_id: String,
    pub results: Vec<SearchHit>,
    pub total_results: usize,
    pub is_complete: bool,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadSearchReply {
    pub session_id: String,
    pub results: Vec<SearchHit>,
    pub new_results_count: usize,
    pub total_results: usize,
    pub is_complete: bool,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchSummary {
    pub session_id: String,
    pub kind: SearchKind,
    pub pattern: String,
    pub root: String,
    pub total_results: usize,
    pub is_complete: bool,
    pub is_error: bool,
    pub runtime_ms: u64,
}

/// Registry of search sessions.
pub struct SearchEngine {
    sessions: Mutex<HashMap<String, Arc<SearchSession>>>,
    idle: Duration,
}

impl SearchEngine {
    pub fn new(idle: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle,
        }
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SearchSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch a search and block up to ~100 ms for first results.
    pub async fn start(&self, spec: SearchSpec) -> Result<StartSearchReply> {
        if spec.pattern.is_empty() {
            return Err(ServerError::Validation("empty search pattern".to_string()));
        }

        let session = Arc::new(SearchSession::new(
            spec.kind,
            spec.root.clone(),
            spec.pattern.clone(),
        ));
        self.prune_idle();
        self.map().insert(session.id.clone(), session.clone());

        match spec.kind {
            SearchKind::Files => {
                let driver = session.clone();
                let spec = spec.clone();
                tokio::task::spawn_blocking(move || run_file_search(&driver, &spec));
            }
            SearchKind::Content => {
                let driver = session.clone();
                let spec_clone = spec.clone();
                tokio::spawn(async move { run_content_search(&driver, &spec_clone).await });
            }
        }

        if let Some(timeout_ms) = spec.timeout_ms {
            let watchdog = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if !watchdog.is_complete() {
                    tracing::debug!(id = %watchdog.id, "search deadline reached, stopping");
                    watchdog.request_stop();
                }
            });
        }

        session
            .wait_first_results(Instant::now() + FIRST_RESULTS_WINDOW)
            .await;

        let mut inner = session.lock();
        inner.read_cursor = inner.results.len();
        inner.last_read = Instant::now();
        Ok(StartSearchReply {
            session_id: session.id.clone(),
            results: inner.results.clone(),
            total_results: inner.results.len(),
            is_complete: inner.complete,
            is_error: inner.error.is_some(),
            error: inner.error.clone(),
        })
    }

    /// Records appended since the previous read. Never blocks.
    pub fn read(&self, id: &str) -> Result<ReadSearchReply> {
        let session = self.get(id)?;
        let mut inner = session.lock();
        let new: Vec<SearchHit> = inner.results[inner.read_cursor..].to_vec();
        inner.read_cursor = inner.results.len();
        inner.last_read = Instant::now();
        Ok(ReadSearchReply {
            session_id: session.id.clone(),
            new_results_count: new.len(),
            total_results: inner.results.len(),
            is_complete: inner.complete,
            is_error: inner.error.is_some(),
            error: inner.error.clone(),
            results: new,
        })
    }

    /// Stop the walker / kill the child. Idempotent; the session stays
    /// readable until pruned.
    pub fn stop(&self, id: &str) -> Result<()> {
        let session = self.get(id)?;
        session.request_stop();
        Ok(())
    }

    pub fn list(&self) -> Vec<SearchSummary> {
        self.prune_idle();
        self.map()
            .values()
            .map(|s| {
                let inner = s.lock();
                SearchSummary {
                    session_id: s.id.clone(),
                    kind: s.kind,
                    pattern: s.pattern.clone(),
                    root: s.root.display().to_string(),
                    total_results: inner.results.len(),
                    is_complete: inner.complete,
                    is_error: inner.error.is_some(),
                    runtime_ms: s.started_at.elapsed().as_millis() as u64,
                }
            })
            .collect()
    }

    fn get(&self, id: &str) -> Result<Arc<SearchSession>> {
        self.map()
            .get(id)
            .cloned()
            .ok_or_else(|| ServerError::SearchNotFound(id.to_string()))
    }

    /// Drop completed sessions that nobody has read for the idle period.
    fn prune_idle(&self) {
        let idle = self.idle;
        self.map().retain(|_, s| {
            s.completed_for().is_none() || s.idle_for() < idle
        });
    }
}

/// Files mode: walk the tree, match entry names. Runs on the blocking pool;
/// the stop flag is checked on every entry.
fn run_file_search(session: &Arc<SearchSession>, spec: &SearchSpec) {
    let name_matcher = match NameMatcher::new(&spec.pattern, spec.ignore_case) {
        Ok(m) => m,
        Err(err) => {
            session.fail(format!("invalid search pattern: {err}"));
            return;
        }
    };
    let filter = match spec.file_pattern.as_deref().map(compile_glob).transpose() {
        Ok(f) => f,
        Err(err) => {
            session.fail(format!("invalid file pattern: {err}"));
            return;
        }
    };

    let walker = ignore::WalkBuilder::new(&spec.root)
        .hidden(!spec.include_hidden)
        .build();

    let mut emitted = 0usize;
    for entry in walker {
        if session.stop_requested() {
            break;
        }
        let Ok(entry) = entry else { continue };
        let Some(name) = entry.path().file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(glob) = &filter {
            if !glob.is_match(name) {
                continue;
            }
        }
        if !name_matcher.matches(name) {
            continue;
        }
        emitted += 1;
        session.push(SearchHit {
            file: entry.path().display().to_string(),
            line: None,
            text: None,
            kind: HitKind::File,
        });
        if emitted >= spec.max_results {
            break;
        }
    }
    session.complete();
}

/// Name matching for Files mode: glob when the pattern carries glob
/// metacharacters, substring otherwise.
enum NameMatcher {
    Glob(globset::GlobMatcher),
    Substring { needle: String, ignore_case: bool },
}

impl NameMatcher {
    fn new(pattern: &str, ignore_case: bool) -> std::result::Result<Self, globset::Error> {
        if pattern.contains(['*', '?', '[', '{']) {
            Ok(Self::Glob(compile_glob(pattern)?))
        } else {
            Ok(Self::Substring {
                needle: if ignore_case {
                    pattern.to_lowercase()
                } else {
                    pattern.to_string()
                },
                ignore_case,
            })
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Glob(glob) => glob.is_match(name),
            Self::Substring { needle, ignore_case } => {
                if *ignore_case {
                    name.to_lowercase().contains(needle.as_str())
                } else {
                    name.contains(needle.as_str())
                }
            }
        }
    }
}

fn compile_glob(pattern: &str) -> std::result::Result<globset::GlobMatcher, globset::Error> {
    Ok(globset::Glob::new(pattern)?.compile_matcher())
}

/// Content mode: ripgrep as a child with `--json`, parsed incrementally.
async fn run_content_search(session: &Arc<SearchSession>, spec: &SearchSpec) {
    let mut cmd = Command::new("rg");
    cmd.arg("--json");
    if spec.ignore_case {
        cmd.arg("-i");
    }
    if spec.include_hidden {
        cmd.arg("--hidden");
    }
    if let Some(file_pattern) = &spec.file_pattern {
        cmd.arg("-g").arg(file_pattern);
    }
    if spec.context_lines > 0 {
        cmd.arg("-C").arg(spec.context_lines.to_string());
    }
    cmd.arg("--").arg(&spec.pattern).arg(&spec.root);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            session.fail(format!("failed to spawn search process: {err}"));
            return;
        }
    };

    let mut stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            session.fail("search process has no stdout".to_string());
            return;
        }
    };
    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut collected = Vec::new();
            let _ = stderr.read_to_end(&mut collected).await;
            collected
        })
    });

    // Partial final lines are retained across chunk boundaries.
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    let mut matches = 0usize;
    let mut capped = false;

    loop {
        tokio::select! {
            () = session.wait_stopped() => {
                let _ = child.start_kill();
                break;
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        if let Some(hit) = parse_rg_event(&line) {
                            if hit.kind == HitKind::Match {
                                matches += 1;
                            }
                            session.push(hit);
                        }
                        if matches >= spec.max_results {
                            capped = true;
                            break;
                        }
                    }
                    if capped {
                        let _ = child.start_kill();
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(id = %session.id, error = %err, "search output read error");
                    break;
                }
            }
        }
    }

    // Flush a dangling final line, then reap.
    if !pending.is_empty() {
        if let Some(hit) = parse_rg_event(&pending) {
            session.push(hit);
        }
    }

    let status = child.wait().await;
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    if session.stop_requested() || capped {
        session.complete();
        return;
    }
    match status {
        // rg: 0 = matches found, 1 = no matches. Both are clean completions.
        Ok(status) if status.code() == Some(0) || status.code() == Some(1) => session.complete(),
        Ok(status) => {
            let detail = String::from_utf8_lossy(&stderr);
            session.fail(format!(
                "search process exited with {}: {}",
                status.code().unwrap_or(-1),
                detail.trim()
            ));
        }
        Err(err) => session.fail(format!("failed to reap search process: {err}")),
    }
}

/// One line of `rg --json` output. Only match and context events become
/// records; begin/end/summary events are structural noise.
fn parse_rg_event(line: &[u8]) -> Option<SearchHit> {
    let value: serde_json::Value = serde_json::from_slice(line).ok()?;
    let kind = match value.get("type")?.as_str()? {
        "match" => HitKind::Match,
        "context" => HitKind::Context,
        _ => return None,
    };
    let data = value.get("data")?;
    let file = data.get("path")?.get("text")?.as_str()?.to_string();
    let line_number = data.get("line_number").and_then(serde_json::Value::as_u64);
    let text = data
        .get("lines")
        .and_then(|l| l.get("text"))
        .and_then(serde_json::Value::as_str)
        .map(|t| t.trim_end_matches('\n').to_string());
    Some(SearchHit {
        file,
        line: line_number,
        text,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_match_event() {
        let line = br#"{"type":"match","data":{"path":{"text":"src/lib.rs"},"lines":{"text":"// TODO: fix\n"},"line_number":7,"absolute_offset":120,"submatches":[{"match":{"text":"TODO"},"start":3,"end":7}]}}"#;
        let hit = parse_rg_event(line).unwrap();
        assert_eq!(hit.file, "src/lib.rs");
        assert_eq!(hit.line, Some(7));
        assert_eq!(hit.text.as_deref(), Some("// TODO: fix"));
        assert_eq!(hit.kind, HitKind::Match);
    }

    #[test]
    fn parse_context_event() {
        let line = br#"{"type":"context","data":{"path":{"text":"a.txt"},"lines":{"text":"nearby\n"},"line_number":6,"absolute_offset":100,"submatches":[]}}"#;
        let hit = parse_rg_event(line).unwrap();
        assert_eq!(hit.kind, HitKind::Context);
    }

    #[test]
    fn structural_events_ignored() {
        assert!(parse_rg_event(br#"{"type":"begin","data":{"path":{"text":"a"}}}"#).is_none());
        assert!(parse_rg_event(br#"{"type":"summary","data":{}}"#).is_none());
        assert!(parse_rg_event(b"not json at all").is_none());
    }

    #[test]
    fn name_matcher_substring_and_glob() {
        let substr = NameMatcher::new("todo", true).unwrap();
        assert!(substr.matches("TODO.md"));
        assert!(!substr.matches("done.md"));

        let glob = NameMatcher::new("*.rs", false).unwrap();
        assert!(glob.matches("main.rs"));
        assert!(!glob.matches("main.rb"));
    }
}
