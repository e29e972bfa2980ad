//! Path guard: every filesystem path the agent names goes through here.
//!
//! A path is allowed iff, after `~`/relative expansion and symlink
//! resolution, it is equal to or strictly inside one of the configured
//! allowed directories. Resolution canonicalizes the longest existing prefix
//! so a symlink cannot smuggle access out of the sandbox, and runs on the
//! blocking pool under a hard ceiling so a pathological symlink chain or a
//! hung network mount cannot wedge a tool call.

use crate::error::{Result, ServerError};
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

/// Ceiling for one path resolution, symlink chasing included.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// The configured allow-list. Read-mostly; reconfiguration swaps the whole
/// set atomically.
pub struct PathGuard {
    allowed: RwLock<Vec<PathBuf>>,
}

impl PathGuard {
    /// Build from config entries. `~` expands to the user's home, relative
    /// entries are joined with the CWD now, at load time. Entries that exist
    /// are canonicalized so later containment checks compare like with like.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = entries
            .into_iter()
            .map(|e| {
                let expanded = expand(e.as_ref());
                expanded.canonicalize().unwrap_or(expanded)
            })
            .collect();
        Self {
            allowed: RwLock::new(allowed),
        }
    }

    /// Replace the allow-list wholesale.
    pub fn replace<I, S>(&self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let new = PathGuard::new(entries);
        let new_allowed = new
            .allowed
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        *self
            .allowed
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = new_allowed;
    }

    /// Snapshot of the allow-list.
    pub fn allowed(&self) -> Vec<PathBuf> {
        self.allowed
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Resolve `requested` to an absolute canonical path and check it
    /// against the allow-list. The returned path is what the caller must
    /// use for the actual filesystem operation.
    pub async fn validate(&self, requested: &str) -> Result<PathBuf> {
        if requested.trim().is_empty() {
            return Err(ServerError::Validation("empty path".to_string()));
        }

        let expanded = expand(requested);
        let resolved = {
            let target = expanded.clone();
            let resolve = tokio::task::spawn_blocking(move || resolve_existing_prefix(&target));
            match tokio::time::timeout(RESOLVE_TIMEOUT, resolve).await {
                Ok(Ok(resolved)) => resolved,
                Ok(Err(join_err)) => {
                    return Err(ServerError::Internal(format!(
                        "path resolution task failed: {join_err}"
                    )));
                }
                Err(_) => return Err(ServerError::ValidationTimeout(expanded)),
            }
        };

        let allowed = self.allowed();
        if allowed.iter().any(|root| is_contained(&resolved, root)) {
            Ok(resolved)
        } else {
            Err(ServerError::PathNotAllowed(resolved))
        }
    }
}

/// Expand a leading `~` and join relative paths with the CWD.
fn expand(requested: &str) -> PathBuf {
    let path = if requested == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = requested
        .strip_prefix("~/")
        .or_else(|| requested.strip_prefix("~\\"))
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("~"))
            .join(rest)
    } else {
        PathBuf::from(requested)
    };

    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    }
}

/// Resolve `path` component by component: each existing step is
/// canonicalized (following symlinks), `..` is applied to the resolved
/// position, and once a component no longer exists the rest is appended
/// lexically. A symlink followed by `..` therefore escapes to the link
/// target's parent -- exactly what the kernel would do -- and the
/// containment check sees it.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    let mut exists = true;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                resolved.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if exists {
                    match resolved.canonicalize() {
                        Ok(canonical) => resolved = canonical,
                        Err(_) => exists = false,
                    }
                }
            }
        }
    }
    resolved
}

/// Containment with the boundary at a path separator: `/home/user` covers
/// `/home/user/x` but never `/home/username`. A root of `/` (or a bare drive
/// root on Windows) covers everything beneath it. Windows compares
/// case-insensitively.
fn is_contained(path: &Path, root: &Path) -> bool {
    if cfg!(windows) {
        let path_parts: Vec<String> = lowercased_components(path);
        let root_parts: Vec<String> = lowercased_components(root);
        path_parts.len() >= root_parts.len() && path_parts[..root_parts.len()] == root_parts[..]
    } else {
        path.starts_with(root)
    }
}

fn lowercased_components(path: &Path) -> Vec<String> {
    path.components()
        .map(|c: Component| c.as_os_str().to_string_lossy().to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_respects_component_boundary() {
        assert!(is_contained(
            Path::new("/home/user/work/file.txt"),
            Path::new("/home/user")
        ));
        assert!(!is_contained(
            Path::new("/home/username/file.txt"),
            Path::new("/home/user")
        ));
        assert!(is_contained(Path::new("/home/user"), Path::new("/home/user")));
    }

    #[test]
    fn root_entry_means_no_restriction() {
        assert!(is_contained(Path::new("/anything/at/all"), Path::new("/")));
    }

    #[test]
    fn expand_joins_relative_with_cwd() {
        let expanded = expand("some/relative/path");
        assert!(expanded.is_absolute());
        assert!(expanded.ends_with("some/relative/path"));
    }

    #[test]
    fn expand_home_prefix() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand("~"), home);
            assert_eq!(expand("~/notes.txt"), home.join("notes.txt"));
        }
    }
}
