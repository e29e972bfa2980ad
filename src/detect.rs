//! Prompt detection: is the child waiting for input?
//!
//! Two layers. The fast path matches the output tail against a table of
//! prompt regexes (REPL `>>>`, shell `$`, password prompts, y/n confirms) and
//! fires as soon as the bytes arrive. The slow path catches prompts the table
//! misses: after the executor has seen no new bytes for [`PROMPT_IDLE`], a
//! short tail without a trailing newline is treated as an unterminated prompt.
//!
//! Detection is pure over a byte slice -- it never touches session state, so
//! any number of concurrent readers may call it. Finished is never inferred
//! from text; the executor observes the real exit.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// How long the output must stay quiet before the slow path may fire.
pub const PROMPT_IDLE: Duration = Duration::from_millis(150);

/// Slow path only considers tails shorter than this since the last newline.
pub const MAX_PROMPT_TAIL: usize = 256;

/// How many trailing bytes are worth inspecting. Prompts are short; anything
/// further back is scrollback.
const TAIL_WINDOW: usize = 512;

struct PromptPattern {
    regex: Regex,
    name: &'static str,
}

/// Named prompt patterns, first match wins. Anchored at end of input.
static PROMPT_PATTERNS: LazyLock<Vec<PromptPattern>> = LazyLock::new(|| {
    let table: &[(&str, &str)] = &[
        (r">>>\s*$", "python-repl"),
        (r"\.\.\.\s*$", "continuation"),
        (r"\$\s*$", "shell-dollar"),
        (r"#\s*$", "shell-hash"),
        (r">\s*$", "angle-prompt"),
        (r"(?i)password[^\n]*:\s*$", "password"),
        (r"\([Yy]/[Nn]\)\??\s*$", "confirm"),
        (r"\w+[:?]\s*$", "readline"),
    ];
    table
        .iter()
        .map(|(pattern, name)| PromptPattern {
            regex: Regex::new(pattern).expect("invalid prompt regex"),
            name,
        })
        .collect()
});

/// Fast path: does the output tail end in something that looks like a prompt?
/// Returns the name of the matching rule, which doubles as the confidence
/// signal (a named fast-path hit is high confidence).
#[must_use]
pub fn prompt_at_tail(output: &[u8]) -> Option<&'static str> {
    let tail = tail_str(output);
    if tail.trim().is_empty() {
        return None;
    }
    // Only the final line can be a prompt.
    let last_line = tail.rsplit('\n').next().unwrap_or(&tail);
    if last_line.trim().is_empty() {
        return None;
    }
    PROMPT_PATTERNS
        .iter()
        .find(|p| p.regex.is_match(last_line))
        .map(|p| p.name)
}

/// Slow path: with the idle window already elapsed (timed by the caller),
/// does the tail read like an unterminated prompt? True when the output ends
/// without a newline and the dangling line is short.
#[must_use]
pub fn idle_tail_waiting(output: &[u8]) -> bool {
    if output.is_empty() || output.ends_with(b"\n") || output.ends_with(b"\r") {
        return false;
    }
    let since_newline = output
        .iter()
        .rev()
        .take_while(|&&b| b != b'\n')
        .count();
    since_newline < MAX_PROMPT_TAIL
}

/// Last [`TAIL_WINDOW`] bytes as lossily-decoded text.
fn tail_str(output: &[u8]) -> String {
    let start = output.len().saturating_sub(TAIL_WINDOW);
    String::from_utf8_lossy(&output[start..]).into_owned()
}
