//! MCP server: tool definitions using rmcp macros.
//!
//! The single surface between the transport and the core. Every handler does
//! the same four things: validate argument shape (unknown fields rejected at
//! deserialization), run path/command arguments through the guard and the
//! policy, invoke one executor/search/store operation under the 60 s handler
//! ceiling, and shape the reply into a JSON content block. Handlers contain
//! no detection or early-exit logic of their own.

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::ServerError;
use crate::exec::ProcessExecutor;
use crate::fsops::{self, WriteMode};
use crate::paths::PathGuard;
use crate::policy::CommandPolicy;
use crate::search::{DEFAULT_MAX_RESULTS, SearchEngine, SearchKind, SearchSpec};
use crate::store::SessionStore;

/// Ceiling for one tool call, above every internal operation timeout.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

/// Parameters for the `start_process` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StartProcessParams {
    /// The command line to execute via the shell.
    pub command: String,
    /// How long to wait for the first prompt/exit before returning with
    /// is_blocked=true. Defaults to 30000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Shell binary to spawn through. Defaults to the configured shell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// Parameters for the `read_process_output` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadProcessOutputParams {
    /// PID returned by start_process.
    pub pid: u32,
    /// How long to wait for new output. Defaults to 5000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Parameters for the `interact_with_process` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InteractWithProcessParams {
    /// PID returned by start_process.
    pub pid: u32,
    /// Text to send to the process's stdin. A trailing newline is added if
    /// absent.
    pub input: String,
    /// How long to wait for the response. Defaults to 5000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// When false, return immediately after writing without waiting for
    /// output. Defaults to true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_prompt: Option<bool>,
}

/// Parameters for the `force_terminate` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ForceTerminateParams {
    /// PID of the session to terminate.
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Files,
    Content,
}

/// Parameters for the `start_search` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StartSearchParams {
    /// Directory to search under. Must be inside an allowed directory.
    pub root_path: String,
    /// Substring/glob (files mode) or regex (content mode) to match.
    pub pattern: String,
    /// "files" matches names, "content" matches file contents.
    pub search_type: SearchType,
    /// Only consider files matching this glob (e.g. "*.rs").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_case: Option<bool>,
    /// Stop after this many matches. Defaults to 1000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_hidden: Option<bool>,
    /// Lines of context around each content match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_lines: Option<u32>,
    /// Overall deadline for the search; it is stopped (not failed) when
    /// this elapses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Parameters for the `read_search_results` / `stop_search` tools.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchSessionParams {
    /// Session id returned by start_search.
    pub session_id: String,
}

/// Parameters for the `block_command` / `unblock_command` tools.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CommandTokenParams {
    /// Program name to add to / remove from the deny-list.
    pub command: String,
}

/// Parameters for the `read_file` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadFileParams {
    pub path: String,
    /// First line to return (0-indexed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Number of lines to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

/// Parameters for the `write_file` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WriteFileParams {
    pub path: String,
    pub content: String,
    /// "rewrite" replaces the file, "append" extends it. Defaults to
    /// rewrite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<WriteMode>,
}

/// Parameters for the `move_file` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MoveFileParams {
    pub source: String,
    pub destination: String,
}

/// Parameters for the `list_directory` / `get_file_info` tools.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PathParams {
    pub path: String,
}

// ---------------------------------------------------------------------------
// Small reply structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct OkReply {
    ok: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DenyListReply {
    blocked_commands: Vec<String>,
    changed: bool,
}

#[derive(Debug, Clone, Serialize)]
struct WriteReply {
    path: String,
    bytes_written: u64,
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The hostshell MCP server.
///
/// Owns every core component; nothing here is a singleton, so tests build
/// their own instance with their own config.
#[derive(Clone)]
pub struct HostshellServer {
    exec: Arc<ProcessExecutor>,
    search: Arc<SearchEngine>,
    guard: Arc<PathGuard>,
    policy: Arc<CommandPolicy>,
    tool_router: ToolRouter<HostshellServer>,
}

impl HostshellServer {
    /// Build the full component graph from a config.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let store = Arc::new(SessionStore::new(
            config.session_buffer_bytes,
            Duration::from_secs(config.session_linger_secs),
        ));
        let policy = Arc::new(CommandPolicy::new(config.blocked_commands.iter()));
        let guard = Arc::new(PathGuard::new(config.allowed_directories.iter()));
        let exec = Arc::new(ProcessExecutor::new(store, policy.clone(), config.shell()));
        let search = Arc::new(SearchEngine::new(Duration::from_secs(
            config.search_idle_secs,
        )));
        Self {
            exec,
            search,
            guard,
            policy,
            tool_router: Self::tool_router(),
        }
    }
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

/// Shape a core error into an error content block the agent can act on.
fn err_result(err: &ServerError) -> Result<CallToolResult, McpError> {
    if matches!(err, ServerError::Internal(_)) {
        tracing::error!(error = %err, "internal error");
    }
    let body = serde_json::json!({
        "code": err.code(),
        "message": err.to_string(),
        "recoverable": err.recoverable(),
    });
    Ok(CallToolResult::error(vec![Content::text(body.to_string())]))
}

/// Fold a core result into a tool reply under the handler ceiling.
async fn bounded<T, F>(operation: F) -> Result<CallToolResult, McpError>
where
    T: Serialize,
    F: std::future::Future<Output = crate::error::Result<T>>,
{
    match tokio::time::timeout(HANDLER_TIMEOUT, operation).await {
        Ok(Ok(reply)) => json_content(&reply),
        Ok(Err(err)) => err_result(&err),
        Err(_) => err_result(&ServerError::Internal(
            "handler deadline exceeded".to_string(),
        )),
    }
}

#[tool_router]
impl HostshellServer {
    // -----------------------------------------------------------------------
    // Process tools
    // -----------------------------------------------------------------------

    #[tool(
        description = "Start a program via the shell and return as soon as there is useful news: the program exited, printed a prompt and is waiting for input, or the timeout elapsed (is_blocked=true -- the process keeps running; poll with read_process_output). Works for one-shot commands and interactive programs (python -i, node -i, ssh, sqlite3). Returns {pid, output, state, is_blocked}; state is running, waiting_for_input, or finished."
    )]
    async fn start_process(
        &self,
        Parameters(params): Parameters<StartProcessParams>,
    ) -> Result<CallToolResult, McpError> {
        bounded(self.exec.start_process(
            &params.command,
            params.timeout_ms,
            params.shell.as_deref(),
        ))
        .await
    }

    #[tool(
        description = "Read output produced since the last read for a session started with start_process. Returns early when the program prints a prompt or exits; otherwise waits up to timeout_ms and returns whatever accumulated with timed_out=true. A finished session returns immediately with its exit_code."
    )]
    async fn read_process_output(
        &self,
        Parameters(params): Parameters<ReadProcessOutputParams>,
    ) -> Result<CallToolResult, McpError> {
        bounded(self.exec.read_process_output(params.pid, params.timeout_ms)).await
    }

    #[tool(
        description = "Send a line of input to a running process's stdin (newline added if missing), then wait for the response with the same early-return rules as read_process_output. Set wait_for_prompt=false to write without waiting. Use for REPLs, password prompts, and confirmation dialogs."
    )]
    async fn interact_with_process(
        &self,
        Parameters(params): Parameters<InteractWithProcessParams>,
    ) -> Result<CallToolResult, McpError> {
        bounded(self.exec.interact_with_process(
            params.pid,
            &params.input,
            params.timeout_ms,
            params.wait_for_prompt.unwrap_or(true),
        ))
        .await
    }

    #[tool(
        description = "Terminate a process session and its whole process tree: SIGTERM, a short grace period, then SIGKILL. Idempotent -- terminating an already-finished session succeeds. The session stays readable for a grace period so the final output and exit code can still be retrieved."
    )]
    async fn force_terminate(
        &self,
        Parameters(params): Parameters<ForceTerminateParams>,
    ) -> Result<CallToolResult, McpError> {
        bounded(async {
            self.exec.force_terminate(params.pid).await?;
            Ok(OkReply { ok: true })
        })
        .await
    }

    #[tool(
        description = "List all tracked process sessions with pid, command, state (running/waiting_for_input/finished), is_blocked, and runtime in milliseconds."
    )]
    async fn list_sessions(&self) -> Result<CallToolResult, McpError> {
        json_content(&self.exec.list_sessions())
    }

    // -----------------------------------------------------------------------
    // Search tools
    // -----------------------------------------------------------------------

    #[tool(
        description = "Start a streaming search under root_path: search_type=files matches file names (substring or glob), search_type=content matches file contents (regex, ripgrep-backed). Returns within ~100ms with any early results plus a session_id; poll read_search_results for the rest. Respects the allowed-directory sandbox."
    )]
    async fn start_search(
        &self,
        Parameters(params): Parameters<StartSearchParams>,
    ) -> Result<CallToolResult, McpError> {
        bounded(async {
            let root = self.guard.validate(&params.root_path).await?;
            let spec = SearchSpec {
                root,
                pattern: params.pattern,
                kind: match params.search_type {
                    SearchType::Files => SearchKind::Files,
                    SearchType::Content => SearchKind::Content,
                },
                file_pattern: params.file_pattern,
                ignore_case: params.ignore_case.unwrap_or(false),
                max_results: params.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
                include_hidden: params.include_hidden.unwrap_or(false),
                context_lines: params.context_lines.unwrap_or(0),
                timeout_ms: params.timeout_ms,
            };
            self.search.start(spec).await
        })
        .await
    }

    #[tool(
        description = "Fetch search results appended since the previous read for a session from start_search. Returns {results, new_results_count, total_results, is_complete, is_error}. Slices from successive calls are disjoint and in order; an empty slice with is_complete=false means nothing new yet."
    )]
    async fn read_search_results(
        &self,
        Parameters(params): Parameters<SearchSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.search.read(&params.session_id) {
            Ok(reply) => json_content(&reply),
            Err(err) => err_result(&err),
        }
    }

    #[tool(
        description = "Cancel a running search: stops the directory walk or kills the underlying search process. Idempotent. The session's collected results stay readable until cleanup."
    )]
    async fn stop_search(
        &self,
        Parameters(params): Parameters<SearchSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.search.stop(&params.session_id) {
            Ok(()) => json_content(&OkReply { ok: true }),
            Err(err) => err_result(&err),
        }
    }

    #[tool(
        description = "List all search sessions with their id, kind, pattern, result count, completion and error status, and runtime."
    )]
    async fn list_searches(&self) -> Result<CallToolResult, McpError> {
        json_content(&self.search.list())
    }

    // -----------------------------------------------------------------------
    // Command policy tools
    // -----------------------------------------------------------------------

    #[tool(
        description = "Add a program name to the deny-list so start_process refuses commands that invoke it. Takes effect immediately; in-memory only."
    )]
    async fn block_command(
        &self,
        Parameters(params): Parameters<CommandTokenParams>,
    ) -> Result<CallToolResult, McpError> {
        let changed = self.policy.block(&params.command);
        json_content(&DenyListReply {
            blocked_commands: self.policy.blocked(),
            changed,
        })
    }

    #[tool(description = "Remove a program name from the deny-list.")]
    async fn unblock_command(
        &self,
        Parameters(params): Parameters<CommandTokenParams>,
    ) -> Result<CallToolResult, McpError> {
        let changed = self.policy.unblock(&params.command);
        json_content(&DenyListReply {
            blocked_commands: self.policy.blocked(),
            changed,
        })
    }

    #[tool(description = "List the deny-list of program names refused by start_process.")]
    async fn list_blocked_commands(&self) -> Result<CallToolResult, McpError> {
        json_content(&self.policy.blocked())
    }

    // -----------------------------------------------------------------------
    // Filesystem tools -- every path goes through the guard
    // -----------------------------------------------------------------------

    #[tool(
        description = "Read a UTF-8 file inside an allowed directory. Optional offset/length select a line window. Symlinks are resolved before the sandbox check."
    )]
    async fn read_file(
        &self,
        Parameters(params): Parameters<ReadFileParams>,
    ) -> Result<CallToolResult, McpError> {
        bounded(async {
            let path = self.guard.validate(&params.path).await?;
            fsops::read_file(&path, params.offset, params.length).await
        })
        .await
    }

    #[tool(
        description = "Write a file inside an allowed directory. mode=rewrite (default) replaces the content, mode=append extends it."
    )]
    async fn write_file(
        &self,
        Parameters(params): Parameters<WriteFileParams>,
    ) -> Result<CallToolResult, McpError> {
        bounded(async {
            let path = self.guard.validate(&params.path).await?;
            let bytes_written = fsops::write_file(
                &path,
                &params.content,
                params.mode.unwrap_or(WriteMode::Rewrite),
            )
            .await?;
            Ok(WriteReply {
                path: path.display().to_string(),
                bytes_written,
            })
        })
        .await
    }

    #[tool(
        description = "Move or rename a file. Both source and destination must be inside allowed directories."
    )]
    async fn move_file(
        &self,
        Parameters(params): Parameters<MoveFileParams>,
    ) -> Result<CallToolResult, McpError> {
        bounded(async {
            let source = self.guard.validate(&params.source).await?;
            let destination = self.guard.validate(&params.destination).await?;
            fsops::move_file(&source, &destination).await?;
            Ok(OkReply { ok: true })
        })
        .await
    }

    #[tool(description = "List a directory inside an allowed directory: name, kind, size per entry.")]
    async fn list_directory(
        &self,
        Parameters(params): Parameters<PathParams>,
    ) -> Result<CallToolResult, McpError> {
        bounded(async {
            let path = self.guard.validate(&params.path).await?;
            fsops::list_directory(&path).await
        })
        .await
    }

    #[tool(
        description = "Stat a path inside an allowed directory: kind, size, symlink and readonly flags."
    )]
    async fn get_file_info(
        &self,
        Parameters(params): Parameters<PathParams>,
    ) -> Result<CallToolResult, McpError> {
        bounded(async {
            let path = self.guard.validate(&params.path).await?;
            fsops::get_file_info(&path).await
        })
        .await
    }
}

#[tool_handler]
impl ServerHandler for HostshellServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "hostshell".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "hostshell exposes the host machine with a safety boundary.\n\n\
                 PROCESSES:\n\
                 start_process launches a program and returns as soon as it exits, prints a \
                 prompt, or the timeout elapses -- interactive programs (python -i, ssh, \
                 sqlite3) report state=waiting_for_input the moment they are ready. Use \
                 interact_with_process to type into them and read_process_output to poll. \
                 force_terminate kills the whole process tree.\n\n\
                 SEARCH:\n\
                 start_search streams file-name or content matches; it returns within ~100ms \
                 with a session_id, then read_search_results returns only what is new since \
                 the last read. stop_search cancels.\n\n\
                 SAFETY:\n\
                 Filesystem access is limited to the configured allowed directories (symlinks \
                 are resolved first). Deny-listed programs and destructive commands (recursive \
                 force deletes, raw writes to block devices) are refused."
                    .to_string(),
            ),
        }
    }
}
