//! Command policy: which command strings may reach a shell.
//!
//! Two independent gates. The deny-list refuses commands whose program name
//! matches a configured token (mutable at runtime via the block/unblock
//! tools). The destructive-action rule is a fixed table of named patterns
//! (recursive-force rm, find -delete, raw writes to block devices, fork
//! bombs); a match is refused unless the command string carries the literal
//! explicit-permission token. The policy fails closed: a command that cannot
//! be parsed is denied.

use crate::error::{Result, ServerError};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{LazyLock, RwLock};

/// Literal token an operator can embed to let a destructive command through.
/// Stripped from the command before it reaches the shell.
pub const PERMISSION_TOKEN: &str = "--i-have-explicit-permission-from-user";

struct DestructiveRule {
    name: &'static str,
    /// Conjunctive: every pattern must match for the rule to fire.
    patterns: Vec<Regex>,
}

fn rule(name: &'static str, patterns: &[&str]) -> DestructiveRule {
    DestructiveRule {
        name,
        patterns: patterns
            .iter()
            .map(|p| Regex::new(p).expect("invalid destructive pattern"))
            .collect(),
    }
}

/// Named destructive patterns, checked per subcommand. Small and auditable.
static DESTRUCTIVE_RULES: LazyLock<Vec<DestructiveRule>> = LazyLock::new(|| {
    vec![
        rule(
            "rm-recursive-force",
            // -r and -f in any order, long or short form.
            &[r"(?:^|\s)rm\b", r"\s--?[a-zA-Z-]*r", r"\s--?[a-zA-Z-]*f"],
        ),
        rule("find-delete", &[r"(?:^|\s)find\b.*\s-delete\b"]),
        rule("find-exec-rm", &[r"(?:^|\s)find\b.*\s-exec\s+rm\b"]),
        rule(
            "redirect-block-device",
            &[r">\s*/dev/(sd|nvme|hd|vd|xvd|disk|mapper/)"],
        ),
        rule("dd-block-device", &[r"(?:^|\s)dd\b.*\bof=/dev/"]),
        rule("mkfs", &[r"(?:^|\s)mkfs\b"]),
        rule("fork-bomb", &[r":\(\)\s*\{.*\|.*&\s*\}\s*;"]),
    ]
});

/// Runtime-mutable deny-list plus the fixed destructive table.
pub struct CommandPolicy {
    denied: RwLock<BTreeSet<String>>,
}

impl CommandPolicy {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            denied: RwLock::new(
                tokens
                    .into_iter()
                    .map(|t| t.as_ref().trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect(),
            ),
        }
    }

    /// Decide whether `command` may run. Deny-list first, then the
    /// destructive table on each `;`/`&&`/`||` subcommand.
    pub fn validate(&self, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Err(ServerError::CommandBlocked {
                rule: "empty-command".to_string(),
            });
        }

        let denied = self
            .denied
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for subcommand in split_subcommands(command) {
            let Some(program) = program_name(subcommand) else {
                continue;
            };
            if denied.contains(&program) {
                return Err(ServerError::CommandBlocked { rule: program });
            }
        }
        drop(denied);

        // The permission token disarms the destructive table, not the
        // deny-list.
        if command.contains(PERMISSION_TOKEN) {
            return Ok(());
        }

        for subcommand in split_subcommands(command) {
            for rule in DESTRUCTIVE_RULES.iter() {
                if rule.patterns.iter().all(|p| p.is_match(subcommand)) {
                    return Err(ServerError::DestructiveBlocked {
                        rule: rule.name.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Add a token to the deny-list. Returns false if it was already there.
    pub fn block(&self, token: &str) -> bool {
        self.denied
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(token.trim().to_lowercase())
    }

    /// Remove a token from the deny-list. Returns false if it wasn't there.
    pub fn unblock(&self, token: &str) -> bool {
        self.denied
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&token.trim().to_lowercase())
    }

    /// Current deny-list, sorted.
    pub fn blocked(&self) -> Vec<String> {
        self.denied
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Strip the permission token so the shell never sees it.
#[must_use]
pub fn strip_permission_token(command: &str) -> String {
    command
        .split_whitespace()
        .filter(|word| *word != PERMISSION_TOKEN)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split on `;`, `&&`, `||` so each chained command is checked on its own.
/// Not a full shell parser; catches the common chains.
fn split_subcommands(command: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut remaining = command;
    while !remaining.is_empty() {
        let next_sep = remaining
            .find("&&")
            .into_iter()
            .chain(remaining.find("||"))
            .chain(remaining.find(';'))
            .min();
        match next_sep {
            Some(pos) => {
                parts.push(&remaining[..pos]);
                let sep_len = if remaining[pos..].starts_with("&&")
                    || remaining[pos..].starts_with("||")
                {
                    2
                } else {
                    1
                };
                remaining = &remaining[pos + sep_len..];
            }
            None => {
                parts.push(remaining);
                break;
            }
        }
    }
    parts
}

/// First shell-word of a subcommand, normalized: `VAR=x` prefixes skipped,
/// leading path stripped, Windows extension stripped, lower-cased.
fn program_name(subcommand: &str) -> Option<String> {
    let word = subcommand
        .split_whitespace()
        .find(|w| !w.contains('='))?;
    let base = word
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(word)
        .to_lowercase();
    let base = if cfg!(windows) {
        base.trim_end_matches(".exe")
            .trim_end_matches(".bat")
            .trim_end_matches(".cmd")
            .to_string()
    } else {
        base
    };
    if base.is_empty() { None } else { Some(base) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CommandPolicy {
        CommandPolicy::new(crate::config::DEFAULT_BLOCKED_COMMANDS.iter().copied())
    }

    #[test]
    fn program_name_normalizes() {
        assert_eq!(program_name("ls -la"), Some("ls".to_string()));
        assert_eq!(program_name("/usr/bin/sudo rm"), Some("sudo".to_string()));
        assert_eq!(program_name("FOO=1 BAR=2 make"), Some("make".to_string()));
        assert_eq!(program_name("   "), None);
    }

    #[test]
    fn denylist_blocks_by_first_word() {
        let p = policy();
        assert!(matches!(
            p.validate("sudo apt install foo"),
            Err(ServerError::CommandBlocked { .. })
        ));
        assert!(matches!(
            p.validate("SUDO echo shouting"),
            Err(ServerError::CommandBlocked { .. })
        ));
        assert!(p.validate("echo sudo is just an argument here").is_ok());
    }

    #[test]
    fn denylist_applies_to_chained_commands() {
        let p = policy();
        assert!(p.validate("echo hi && sudo reboot").is_err());
        assert!(p.validate("true; shutdown -h now").is_err());
    }

    #[test]
    fn block_and_unblock_round_trip() {
        let p = policy();
        assert!(p.validate("curl https://example.com").is_ok());
        assert!(p.block("curl"));
        assert!(!p.block("curl"));
        assert!(p.validate("curl https://example.com").is_err());
        assert!(p.unblock("CURL"));
        assert!(p.validate("curl https://example.com").is_ok());
    }

    #[test]
    fn destructive_rm_blocked_without_token() {
        let p = policy();
        for cmd in [
            "rm -rf /tmp/test-dir",
            "rm -fr /tmp/test-dir",
            "rm -r -f /tmp/test-dir",
            "rm --recursive --force /tmp/test-dir",
            "echo x && rm -rf /tmp/y",
        ] {
            assert!(
                matches!(p.validate(cmd), Err(ServerError::DestructiveBlocked { .. })),
                "expected destructive block for {cmd}"
            );
        }
    }

    #[test]
    fn plain_rm_is_allowed() {
        let p = policy();
        assert!(p.validate("rm file.txt").is_ok());
        assert!(p.validate("rm -r just_recursive").is_ok());
        assert!(p.validate("rm -f just_force").is_ok());
    }

    #[test]
    fn permission_token_admits_destructive() {
        let p = policy();
        assert!(
            p.validate("rm --i-have-explicit-permission-from-user -rf /tmp/test-dir")
                .is_ok()
        );
        // But never the deny-list.
        assert!(
            p.validate("sudo --i-have-explicit-permission-from-user reboot")
                .is_err()
        );
    }

    #[test]
    fn strip_token_removes_only_the_token() {
        assert_eq!(
            strip_permission_token("rm --i-have-explicit-permission-from-user -rf /tmp/x"),
            "rm -rf /tmp/x"
        );
        assert_eq!(strip_permission_token("echo hello"), "echo hello");
    }

    #[test]
    fn find_delete_and_exec_rm_blocked() {
        let p = policy();
        assert!(p.validate("find /tmp/x -name '*.log' -delete").is_err());
        assert!(p.validate("find . -name junk -exec rm {} \\;").is_err());
        assert!(p.validate("find . -name '*.rs' -print").is_ok());
    }

    #[test]
    fn block_device_writes_blocked() {
        let p = policy();
        assert!(p.validate("echo x > /dev/sda").is_err());
        assert!(p.validate("dd if=/dev/zero of=/dev/nvme0n1").is_err());
        assert!(p.validate("dd if=/dev/zero of=/tmp/img bs=1M count=1").is_ok());
    }

    #[test]
    fn fork_bomb_blocked() {
        let p = policy();
        assert!(p.validate(":(){ :|:& };:").is_err());
    }

    #[test]
    fn empty_command_fails_closed() {
        let p = policy();
        assert!(p.validate("   ").is_err());
    }
}
