//! End-to-end batch processing tests against a real bare-repo/clone pair.
//!
//! The merge slot is the default no-op implementation; git runs for real
//! inside a tempdir.

use std::path::{Path, PathBuf};
use std::process::Command;

use mergeyard::{BatchConfig, BatchProcessor, GateConfig, MrInfo, ProcessError};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct TestRepo {
    _tmp: TempDir,
    workdir: PathBuf,
    bare: PathBuf,
}

fn run(dir: &Path, program: &str, args: &[&str]) -> String {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn {program}: {e}"));
    assert!(
        output.status.success(),
        "command {program} {args:?} failed:\n{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn write_file(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

/// Create a bare origin plus a working clone with an initial commit on main.
fn test_repo() -> TestRepo {
    let tmp = TempDir::new().unwrap();
    let bare = tmp.path().join("origin.git");
    let workdir = tmp.path().join("work");

    run(
        tmp.path(),
        "git",
        &["init", "--bare", "--initial-branch=main", bare.to_str().unwrap()],
    );
    run(
        tmp.path(),
        "git",
        &["clone", bare.to_str().unwrap(), workdir.to_str().unwrap()],
    );
    run(&workdir, "git", &["config", "user.email", "test@test.com"]);
    run(&workdir, "git", &["config", "user.name", "Test"]);
    run(&workdir, "git", &["checkout", "-B", "main"]);

    write_file(&workdir, "README.md", "# Test\n");
    run(&workdir, "git", &["add", "."]);
    run(&workdir, "git", &["commit", "-m", "initial commit"]);
    run(&workdir, "git", &["push", "-u", "origin", "main"]);

    TestRepo {
        _tmp: tmp,
        workdir,
        bare,
    }
}

/// Create a branch off main with a single file change.
fn create_feature_branch(repo: &TestRepo, branch: &str, filename: &str, content: &str) {
    let dir = &repo.workdir;
    run(dir, "git", &["checkout", "-b", branch, "main"]);
    write_file(dir, filename, content);
    run(dir, "git", &["add", "."]);
    run(dir, "git", &["commit", "-m", &format!("feat: add {filename}")]);
    run(dir, "git", &["checkout", "main"]);
}

fn processor(repo: &TestRepo) -> BatchProcessor {
    BatchProcessor::new(&repo.workdir).with_output(Box::new(std::io::sink()))
}

fn make_mr(id: &str, branch: &str) -> MrInfo {
    MrInfo::new(id, branch, "main")
}

fn ids(mrs: &[MrInfo]) -> Vec<&str> {
    mrs.iter().map(|mr| mr.id.as_str()).collect()
}

fn fail_marker_gate(repo: &TestRepo) -> GateConfig {
    GateConfig::new(format!("test ! -f {}/FAIL_MARKER", repo.workdir.display()))
}

/// Re-clone the bare origin and return the checkout path for verification.
fn clone_origin(repo: &TestRepo, name: &str) -> PathBuf {
    let parent = repo.bare.parent().unwrap().to_path_buf();
    let verify = parent.join(name);
    run(
        &parent,
        "git",
        &["clone", repo.bare.to_str().unwrap(), verify.to_str().unwrap()],
    );
    verify
}

// --- BuildRebaseStack ---

#[tokio::test]
async fn build_rebase_stack_single_mr() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");

    let p = processor(&repo);
    let batch = vec![make_mr("mr-a", "feature-a")];
    let outcome = p
        .build_rebase_stack(&batch, "main", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ids(&outcome.stacked), vec!["mr-a"]);
    assert!(outcome.conflicts.is_empty());
    let content = std::fs::read_to_string(repo.workdir.join("a.txt")).unwrap();
    assert_eq!(content, "hello a\n");
}

#[tokio::test]
async fn build_rebase_stack_multiple_mrs() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");
    create_feature_branch(&repo, "feature-b", "b.txt", "hello b\n");
    create_feature_branch(&repo, "feature-c", "c.txt", "hello c\n");

    let p = processor(&repo);
    let batch = vec![
        make_mr("mr-a", "feature-a"),
        make_mr("mr-b", "feature-b"),
        make_mr("mr-c", "feature-c"),
    ];
    let outcome = p
        .build_rebase_stack(&batch, "main", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.stacked.len(), 3);
    assert!(outcome.conflicts.is_empty());
    for f in ["a.txt", "b.txt", "c.txt"] {
        assert!(repo.workdir.join(f).exists(), "expected {f} in working tree");
    }
}

#[tokio::test]
async fn build_rebase_stack_conflict_drops_mr() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "shared.txt", "version A\n");
    create_feature_branch(&repo, "feature-b", "shared.txt", "version B\n");
    create_feature_branch(&repo, "feature-c", "c.txt", "hello c\n");

    let p = processor(&repo);
    let batch = vec![
        make_mr("mr-a", "feature-a"),
        make_mr("mr-b", "feature-b"),
        make_mr("mr-c", "feature-c"),
    ];
    let outcome = p
        .build_rebase_stack(&batch, "main", &CancellationToken::new())
        .await
        .unwrap();

    // feature-a stacks first; feature-b clashes with it; feature-c is fine.
    assert_eq!(ids(&outcome.stacked), vec!["mr-a", "mr-c"]);
    assert_eq!(ids(&outcome.conflicts), vec!["mr-b"]);
}

#[tokio::test]
async fn build_rebase_stack_empty_batch() {
    let repo = test_repo();
    let p = processor(&repo);
    let outcome = p
        .build_rebase_stack(&[], "main", &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.stacked.is_empty());
    assert!(outcome.conflicts.is_empty());
    assert_eq!(outcome.tip, outcome.base);
}

#[tokio::test]
async fn build_rebase_stack_missing_branch() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");

    let p = processor(&repo);
    let batch = vec![
        make_mr("mr-missing", "nonexistent-branch"),
        make_mr("mr-a", "feature-a"),
    ];
    let outcome = p
        .build_rebase_stack(&batch, "main", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ids(&outcome.stacked), vec!["mr-a"]);
    assert_eq!(ids(&outcome.conflicts), vec!["mr-missing"]);
}

// --- ProcessBatch ---

#[tokio::test]
async fn process_batch_empty() {
    let tmp = TempDir::new().unwrap();
    let p = BatchProcessor::new(tmp.path()).with_output(Box::new(std::io::sink()));

    let result = p
        .process_batch(&[], "main", Some(&BatchConfig::default()), &CancellationToken::new())
        .await;
    assert!(result.error.is_none());
    assert!(result.merged.is_empty());
    assert_eq!(result.merge_commit, "");
}

#[tokio::test]
async fn process_batch_single_mr_success() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");

    let p = processor(&repo);
    let batch = vec![make_mr("mr-a", "feature-a")];
    let result = p
        .process_batch(&batch, "main", Some(&BatchConfig::default()), &CancellationToken::new())
        .await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(ids(&result.merged), vec!["mr-a"]);
    assert!(!result.merge_commit.is_empty());
}

#[tokio::test]
async fn process_batch_multiple_mrs_all_pass() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");
    create_feature_branch(&repo, "feature-b", "b.txt", "hello b\n");
    create_feature_branch(&repo, "feature-c", "c.txt", "hello c\n");

    let p = processor(&repo);
    let batch = vec![
        make_mr("mr-a", "feature-a"),
        make_mr("mr-b", "feature-b"),
        make_mr("mr-c", "feature-c"),
    ];
    let result = p
        .process_batch(&batch, "main", Some(&BatchConfig::default()), &CancellationToken::new())
        .await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(result.merged.len(), 3);
    assert!(!result.merge_commit.is_empty());

    run(&repo.workdir, "git", &["checkout", "main"]);
    for f in ["a.txt", "b.txt", "c.txt"] {
        assert!(repo.workdir.join(f).exists(), "expected {f} on main after merge");
    }
}

#[tokio::test]
async fn process_batch_with_conflict() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "shared.txt", "version A\n");
    create_feature_branch(&repo, "feature-b", "shared.txt", "version B\n");
    create_feature_branch(&repo, "feature-c", "c.txt", "hello c\n");

    let p = processor(&repo);
    let batch = vec![
        make_mr("mr-a", "feature-a"),
        make_mr("mr-b", "feature-b"),
        make_mr("mr-c", "feature-c"),
    ];
    let result = p
        .process_batch(&batch, "main", Some(&BatchConfig::default()), &CancellationToken::new())
        .await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(ids(&result.merged), vec!["mr-a", "mr-c"]);
    assert_eq!(ids(&result.conflicts), vec!["mr-b"]);
    assert!(result.culprits.is_empty());
}

#[tokio::test]
async fn process_batch_gate_failure_bisects_to_find_culprit() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");
    create_feature_branch(&repo, "feature-b", "b.txt", "hello b\n");
    create_feature_branch(&repo, "feature-c", "FAIL_MARKER", "this breaks the gate\n");
    create_feature_branch(&repo, "feature-d", "d.txt", "hello d\n");

    let mut p = processor(&repo);
    p.config_mut()
        .gates
        .insert("check".to_string(), fail_marker_gate(&repo));

    let batch = vec![
        make_mr("mr-a", "feature-a"),
        make_mr("mr-b", "feature-b"),
        make_mr("mr-c", "feature-c"),
        make_mr("mr-d", "feature-d"),
    ];
    let cfg = BatchConfig {
        retry_batch_on_flaky: false,
        ..Default::default()
    };
    let result = p
        .process_batch(&batch, "main", Some(&cfg), &CancellationToken::new())
        .await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(ids(&result.culprits), vec!["mr-c"]);
    assert_eq!(ids(&result.merged), vec!["mr-a", "mr-b", "mr-d"]);
    assert!(result.conflicts.is_empty());

    // Partition: no MR appears in more than one bucket, and the combined
    // ids preserve input order.
    let mut all = ids(&result.merged);
    all.extend(ids(&result.culprits));
    let mut sorted = all.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), all.len(), "buckets overlap: {all:?}");

    run(&repo.workdir, "git", &["checkout", "main"]);
    assert!(!repo.workdir.join("FAIL_MARKER").exists());
}

#[tokio::test]
async fn process_batch_single_mr_gate_failure_is_culprit_without_retry() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");

    // A flaky gate that would pass on the second run; the single-MR path
    // never retries, so the MR is reported as culprit.
    let counter_dir = TempDir::new().unwrap();
    let counter = counter_dir.path().join("gate_counter");
    let mut p = processor(&repo);
    p.config_mut().gates.insert(
        "flaky".to_string(),
        GateConfig::new(format!(
            "count=$(cat {c} 2>/dev/null || echo 0); count=$((count + 1)); echo $count > {c}; test $count -ge 2",
            c = counter.display()
        )),
    );

    let batch = vec![make_mr("mr-a", "feature-a")];
    let cfg = BatchConfig::default();
    let result = p
        .process_batch(&batch, "main", Some(&cfg), &CancellationToken::new())
        .await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert!(result.merged.is_empty());
    assert_eq!(ids(&result.culprits), vec!["mr-a"]);
}

#[tokio::test]
async fn process_batch_retry_on_flaky_multiple_mrs() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");
    create_feature_branch(&repo, "feature-b", "b.txt", "hello b\n");

    let counter_dir = TempDir::new().unwrap();
    let counter = counter_dir.path().join("gate_counter");
    let mut p = processor(&repo);
    p.config_mut().gates.insert(
        "flaky".to_string(),
        GateConfig::new(format!(
            "count=$(cat {c} 2>/dev/null || echo 0); count=$((count + 1)); echo $count > {c}; test $count -ge 2",
            c = counter.display()
        )),
    );

    let batch = vec![make_mr("mr-a", "feature-a"), make_mr("mr-b", "feature-b")];
    let cfg = BatchConfig {
        retry_batch_on_flaky: true,
        ..Default::default()
    };
    let result = p
        .process_batch(&batch, "main", Some(&cfg), &CancellationToken::new())
        .await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(result.merged.len(), 2, "expected both MRs merged after retry");
    assert!(result.culprits.is_empty());
}

#[tokio::test]
async fn process_batch_all_conflict() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "shared.txt", "version A\n");
    create_feature_branch(&repo, "feature-b", "shared.txt", "version B\n");

    // Advance main past the point the features branched from, with a
    // clashing change of its own.
    write_file(&repo.workdir, "shared.txt", "main version\n");
    run(&repo.workdir, "git", &["add", "."]);
    run(&repo.workdir, "git", &["commit", "-m", "main: add shared.txt"]);
    run(&repo.workdir, "git", &["push", "origin", "main"]);

    let p = processor(&repo);
    let batch = vec![make_mr("mr-a", "feature-a"), make_mr("mr-b", "feature-b")];
    let result = p
        .process_batch(&batch, "main", Some(&BatchConfig::default()), &CancellationToken::new())
        .await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert!(result.merged.is_empty());
    assert_eq!(ids(&result.conflicts), vec!["mr-a", "mr-b"]);
    assert_eq!(result.merge_commit, "");
}

#[tokio::test]
async fn process_batch_pushes_and_lands() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");
    create_feature_branch(&repo, "feature-b", "b.txt", "hello b\n");

    let p = processor(&repo);
    let batch = vec![make_mr("mr-a", "feature-a"), make_mr("mr-b", "feature-b")];
    let result = p
        .process_batch(&batch, "main", Some(&BatchConfig::default()), &CancellationToken::new())
        .await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(result.merged.len(), 2);

    let verify = clone_origin(&repo, "verify");
    for f in ["a.txt", "b.txt"] {
        assert!(verify.join(f).exists(), "expected {f} in fresh clone after push");
    }
}

#[tokio::test]
async fn process_batch_bisect_and_merge_good() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");
    create_feature_branch(&repo, "feature-b", "FAIL_MARKER", "fail\n");

    let mut p = processor(&repo);
    p.config_mut()
        .gates
        .insert("check".to_string(), fail_marker_gate(&repo));

    let batch = vec![make_mr("mr-a", "feature-a"), make_mr("mr-b", "feature-b")];
    let cfg = BatchConfig {
        retry_batch_on_flaky: false,
        ..Default::default()
    };
    let result = p
        .process_batch(&batch, "main", Some(&cfg), &CancellationToken::new())
        .await;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(ids(&result.merged), vec!["mr-a"]);
    assert_eq!(ids(&result.culprits), vec!["mr-b"]);
    assert!(!result.merge_commit.is_empty());

    let verify = clone_origin(&repo, "verify2");
    assert!(verify.join("a.txt").exists());
    assert!(!verify.join("FAIL_MARKER").exists());
}

#[tokio::test]
async fn process_batch_cancelled_before_start() {
    let repo = test_repo();
    create_feature_branch(&repo, "feature-a", "a.txt", "hello a\n");
    create_feature_branch(&repo, "feature-b", "b.txt", "hello b\n");

    let p = processor(&repo);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let batch = vec![make_mr("mr-a", "feature-a"), make_mr("mr-b", "feature-b")];
    let result = p
        .process_batch(&batch, "main", Some(&BatchConfig::default()), &cancel)
        .await;

    assert!(matches!(result.error, Some(ProcessError::Cancelled)));
    assert!(result.merged.is_empty());
}

// --- Merge messages ---

#[tokio::test]
async fn merge_message_uses_branch_head_commit() {
    let repo = test_repo();
    let dir = &repo.workdir;
    run(dir, "git", &["checkout", "-b", "feat-branch", "main"]);
    write_file(dir, "x.txt", "x\n");
    run(dir, "git", &["add", "."]);
    run(dir, "git", &["commit", "-m", "feat: add x feature"]);
    run(dir, "git", &["checkout", "main"]);

    let p = processor(&repo);
    let mr = make_mr("mr-x", "feat-branch");
    let msg = p.merge_message(&mr, &CancellationToken::new()).await;
    assert!(msg.contains("feat: add x feature"), "got {msg:?}");
}

#[tokio::test]
async fn merge_message_falls_back_for_missing_branch() {
    let repo = test_repo();
    let p = processor(&repo);
    let mr = MrInfo {
        source_issue: Some("gt-abc".to_string()),
        ..make_mr("mr-x", "nonexistent-branch")
    };
    let msg = p.merge_message(&mr, &CancellationToken::new()).await;
    assert!(msg.contains("Squash merge"), "got {msg:?}");
    assert!(msg.contains("gt-abc"), "got {msg:?}");
}
