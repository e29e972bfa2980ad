//! Integration tests for streaming search sessions: files mode, content
//! mode (when ripgrep is installed), incremental reads, and cancellation.

use hostshell::error::ServerError;
use hostshell::search::{SearchEngine, SearchHit, SearchKind, SearchSpec};
use std::path::Path;
use std::time::{Duration, Instant};

fn engine() -> SearchEngine {
    SearchEngine::new(Duration::from_secs(300))
}

fn spec(root: &Path, pattern: &str, kind: SearchKind) -> SearchSpec {
    SearchSpec {
        root: root.to_path_buf(),
        pattern: pattern.to_string(),
        kind,
        file_pattern: None,
        ignore_case: false,
        max_results: 1000,
        include_hidden: false,
        context_lines: 0,
        timeout_ms: None,
    }
}

/// A small tree: three matching files, one hidden, one nested, plus noise.
fn fixture_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("alpha_notes.txt"), "TODO: alpha\n").unwrap();
    std::fs::write(dir.path().join("beta.rs"), "fn main() {} // TODO beta\n").unwrap();
    std::fs::write(dir.path().join("unrelated.log"), "nothing here\n").unwrap();
    std::fs::write(dir.path().join(".hidden_notes.txt"), "TODO: hidden\n").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/gamma_notes.txt"), "TODO: gamma\n").unwrap();
    dir
}

async fn drain_to_completion(engine: &SearchEngine, id: &str) -> Vec<SearchHit> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut all = Vec::new();
    loop {
        let read = engine.read(id).unwrap();
        all.extend(read.results);
        if read.is_complete {
            return all;
        }
        assert!(Instant::now() < deadline, "search did not complete in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Files mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_file_search_by_substring() {
    let dir = fixture_tree();
    let engine = engine();
    let reply = engine
        .start(spec(dir.path(), "notes", SearchKind::Files))
        .await
        .unwrap();
    assert!(!reply.is_error);

    let mut files: Vec<String> = reply.results.into_iter().map(|h| h.file).collect();
    files.extend(
        drain_to_completion(&engine, &reply.session_id)
            .await
            .into_iter()
            .map(|h| h.file),
    );

    // Hidden entries are excluded by default; the nested match is found.
    assert_eq!(files.len(), 2, "got: {files:?}");
    assert!(files.iter().any(|f| f.ends_with("alpha_notes.txt")));
    assert!(files.iter().any(|f| f.ends_with("gamma_notes.txt")));
}

#[tokio::test]
async fn test_file_search_glob_pattern() {
    let dir = fixture_tree();
    let engine = engine();
    let reply = engine
        .start(spec(dir.path(), "*.rs", SearchKind::Files))
        .await
        .unwrap();

    let mut files: Vec<String> = reply.results.into_iter().map(|h| h.file).collect();
    files.extend(
        drain_to_completion(&engine, &reply.session_id)
            .await
            .into_iter()
            .map(|h| h.file),
    );
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with("beta.rs"));
}

#[tokio::test]
async fn test_file_search_includes_hidden_on_request() {
    let dir = fixture_tree();
    let engine = engine();
    let mut search = spec(dir.path(), "notes", SearchKind::Files);
    search.include_hidden = true;

    let reply = engine.start(search).await.unwrap();
    let mut files: Vec<String> = reply.results.into_iter().map(|h| h.file).collect();
    files.extend(
        drain_to_completion(&engine, &reply.session_id)
            .await
            .into_iter()
            .map(|h| h.file),
    );
    assert!(files.iter().any(|f| f.contains(".hidden_notes")));
}

#[tokio::test]
async fn test_file_search_respects_max_results() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..50 {
        std::fs::write(dir.path().join(format!("match_{i}.txt")), "x").unwrap();
    }
    let engine = engine();
    let mut search = spec(dir.path(), "match_", SearchKind::Files);
    search.max_results = 5;

    let reply = engine.start(search).await.unwrap();
    let total = reply.results.len() + drain_to_completion(&engine, &reply.session_id).await.len();
    assert_eq!(total, 5);
}

// ---------------------------------------------------------------------------
// Incremental read contract
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reads_are_disjoint_and_monotone() {
    let dir = fixture_tree();
    let engine = engine();
    let reply = engine
        .start(spec(dir.path(), "notes", SearchKind::Files))
        .await
        .unwrap();

    let mut seen: Vec<String> = reply.results.iter().map(|h| h.file.clone()).collect();
    let mut last_total = reply.total_results;
    loop {
        let read = engine.read(&reply.session_id).unwrap();
        assert!(read.total_results >= last_total);
        last_total = read.total_results;
        for hit in &read.results {
            assert!(
                !seen.contains(&hit.file),
                "record replayed across reads: {}",
                hit.file
            );
            seen.push(hit.file.clone());
        }
        if read.is_complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Reading again after completion yields an empty, still-complete slice.
    let after = engine.read(&reply.session_id).unwrap();
    assert_eq!(after.new_results_count, 0);
    assert!(after.is_complete);
}

#[tokio::test]
async fn test_unknown_session_is_an_error() {
    let engine = engine();
    let err = engine.read("no-such-session").unwrap_err();
    assert!(matches!(err, ServerError::SearchNotFound(_)));
    assert!(engine.stop("no-such-session").is_err());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_completes_the_session() {
    // A wide generated tree keeps the walker busy long enough to cancel.
    let dir = tempfile::tempdir().unwrap();
    for i in 0..200 {
        let sub = dir.path().join(format!("dir_{i}"));
        std::fs::create_dir(&sub).unwrap();
        for j in 0..20 {
            std::fs::write(sub.join(format!("file_{j}.txt")), "x").unwrap();
        }
    }

    let engine = engine();
    let reply = engine
        .start(spec(dir.path(), "file_", SearchKind::Files))
        .await
        .unwrap();

    engine.stop(&reply.session_id).unwrap();
    // Stopping twice is fine.
    engine.stop(&reply.session_id).unwrap();

    let deadline = Instant::now() + Duration::from_millis(500);
    loop {
        let read = engine.read(&reply.session_id).unwrap();
        if read.is_complete {
            assert!(!read.is_error);
            break;
        }
        assert!(Instant::now() < deadline, "stop did not take effect in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Content mode (ripgrep-backed; skipped when rg is absent)
// ---------------------------------------------------------------------------

async fn rg_available() -> bool {
    tokio::process::Command::new("rg")
        .arg("--version")
        .output()
        .await
        .is_ok()
}

#[tokio::test]
async fn test_content_search_finds_matches_with_lines() {
    if !rg_available().await {
        return;
    }
    let dir = fixture_tree();
    let engine = engine();
    let reply = engine
        .start(spec(dir.path(), "TODO", SearchKind::Content))
        .await
        .unwrap();
    assert!(!reply.is_error);

    let mut hits = reply.results;
    hits.extend(drain_to_completion(&engine, &reply.session_id).await);

    // Three visible files carry a TODO; the hidden one is skipped.
    assert_eq!(hits.len(), 3, "got: {hits:?}");
    for hit in &hits {
        assert!(hit.line.is_some());
        assert!(hit.text.as_deref().unwrap_or("").contains("TODO"));
    }
}

#[tokio::test]
async fn test_content_search_no_matches_is_not_an_error() {
    if !rg_available().await {
        return;
    }
    let dir = fixture_tree();
    let engine = engine();
    let reply = engine
        .start(spec(dir.path(), "definitely_not_present_anywhere", SearchKind::Content))
        .await
        .unwrap();

    let _ = drain_to_completion(&engine, &reply.session_id).await;
    let read = engine.read(&reply.session_id).unwrap();
    assert!(read.is_complete);
    assert!(!read.is_error, "rg exit code 1 must not be an error");
    assert_eq!(read.total_results, 0);
}

#[tokio::test]
async fn test_content_search_file_pattern_filter() {
    if !rg_available().await {
        return;
    }
    let dir = fixture_tree();
    let engine = engine();
    let mut search = spec(dir.path(), "TODO", SearchKind::Content);
    search.file_pattern = Some("*.rs".to_string());

    let reply = engine.start(search).await.unwrap();
    let mut hits = reply.results;
    hits.extend(drain_to_completion(&engine, &reply.session_id).await);
    assert_eq!(hits.len(), 1);
    assert!(hits[0].file.ends_with("beta.rs"));
}
