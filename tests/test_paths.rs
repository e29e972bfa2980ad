//! Integration tests for the path guard: expansion, containment, traversal
//! and symlink escapes.

use hostshell::error::ServerError;
use hostshell::paths::PathGuard;

fn guard_for(dir: &tempfile::TempDir) -> PathGuard {
    PathGuard::new([dir.path().to_string_lossy().into_owned()])
}

#[tokio::test]
async fn test_path_inside_allowed_dir_passes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ok.txt"), "fine").unwrap();
    let guard = guard_for(&dir);

    let resolved = guard
        .validate(&dir.path().join("ok.txt").to_string_lossy())
        .await
        .unwrap();
    assert!(resolved.is_absolute());
    assert!(resolved.ends_with("ok.txt"));
}

#[tokio::test]
async fn test_nonexistent_target_inside_allowed_dir_passes() {
    // Writing a new file must be possible: the parent exists, the leaf
    // doesn't yet.
    let dir = tempfile::tempdir().unwrap();
    let guard = guard_for(&dir);

    let resolved = guard
        .validate(&dir.path().join("new_file.txt").to_string_lossy())
        .await
        .unwrap();
    assert!(resolved.ends_with("new_file.txt"));
}

#[tokio::test]
async fn test_path_outside_allowed_dir_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let guard = guard_for(&dir);

    let err = guard
        .validate(&other.path().join("secret.txt").to_string_lossy())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::PathNotAllowed(_)));
}

#[tokio::test]
async fn test_dotdot_escape_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let guard = guard_for(&dir);

    let sneaky = dir.path().join("work").join("..").join("..").join("etc/passwd");
    let err = guard.validate(&sneaky.to_string_lossy()).await.unwrap_err();
    assert!(matches!(err, ServerError::PathNotAllowed(_)));
}

#[tokio::test]
async fn test_sibling_prefix_does_not_leak() {
    // /base/allowed must not cover /base/allowed_sibling.
    let base = tempfile::tempdir().unwrap();
    let allowed = base.path().join("allowed");
    let sibling = base.path().join("allowed_sibling");
    std::fs::create_dir(&allowed).unwrap();
    std::fs::create_dir(&sibling).unwrap();
    std::fs::write(sibling.join("leak.txt"), "secret").unwrap();

    let guard = PathGuard::new([allowed.to_string_lossy().into_owned()]);
    let err = guard
        .validate(&sibling.join("leak.txt").to_string_lossy())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::PathNotAllowed(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_out_of_sandbox_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
    std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

    let guard = guard_for(&dir);
    let err = guard
        .validate(&dir.path().join("escape/secret.txt").to_string_lossy())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::PathNotAllowed(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_within_sandbox_passes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("real")).unwrap();
    std::fs::write(dir.path().join("real/data.txt"), "data").unwrap();
    std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();

    let guard = guard_for(&dir);
    let resolved = guard
        .validate(&dir.path().join("alias/data.txt").to_string_lossy())
        .await
        .unwrap();
    assert!(resolved.ends_with("real/data.txt"));
}

#[tokio::test]
async fn test_root_entry_disables_restriction() {
    let guard = PathGuard::new(["/".to_string()]);
    let dir = tempfile::tempdir().unwrap();
    assert!(
        guard
            .validate(&dir.path().to_string_lossy())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_missing_everything_is_path_not_found() {
    let guard = PathGuard::new(["/".to_string()]);
    // Every ancestor of this path exists ("/"), so this resolves; use an
    // empty-ish input instead to hit validation.
    let err = guard.validate("   ").await.unwrap_err();
    assert!(matches!(err, ServerError::Validation(_)));
}

#[tokio::test]
async fn test_replace_swaps_allow_list_atomically() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let guard = guard_for(&first);

    assert!(guard.validate(&first.path().to_string_lossy()).await.is_ok());
    guard.replace([second.path().to_string_lossy().into_owned()]);
    assert!(guard.validate(&first.path().to_string_lossy()).await.is_err());
    assert!(guard.validate(&second.path().to_string_lossy()).await.is_ok());
}
