//! Integration tests for the timefiles CLI
//!
//! These tests exercise the full CLI workflow using a temporary database.
//! They verify that commands work end-to-end without mocking.

use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// Helper to run timefiles CLI with a specific database path
fn run_timefiles(args: &[&str], db_path: &PathBuf) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_timefiles"))
        .args(args)
        .env("TIMEFILES_DB_PATH", db_path)
        .output()
        .expect("Failed to execute timefiles")
}

/// Helper to get stdout as string
fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Helper to get stderr as string
fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Create a task and return its full id (printed on the "id:" line)
fn create_task(db_path: &PathBuf, title: &str, parent: Option<&str>) -> String {
    let output = match parent {
        Some(parent) => run_timefiles(&["create", title, "--parent", parent], db_path),
        None => run_timefiles(&["create", title], db_path),
    };
    assert!(
        output.status.success(),
        "create '{}' failed: {}",
        title,
        stderr(&output)
    );
    stdout(&output)
        .lines()
        .find_map(|line| line.trim().strip_prefix("id: ").map(str::to_string))
        .expect("create should print the task id")
}

// =============================================================================
// Basic Command Tests
// =============================================================================

#[test]
fn test_help_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_timefiles"))
        .arg("--help")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("timefiles"));
    assert!(out.contains("time tracking"));
}

#[test]
fn test_version_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_timefiles"))
        .arg("--version")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    assert!(stdout(&output).contains("timefiles"));
}

#[test]
fn test_ping() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let output = run_timefiles(&["ping"], &db_path);
    assert!(output.status.success(), "ping failed: {}", stderr(&output));
    assert!(stdout(&output).contains("pong"));
}

// =============================================================================
// Shell Completion Tests
// =============================================================================

#[test]
fn test_completion_zsh() {
    let output = Command::new(env!("CARGO_BIN_EXE_timefiles"))
        .args(["completion", "zsh"])
        .output()
        .expect("Failed to execute");

    assert!(
        output.status.success(),
        "completion zsh failed: {}",
        stderr(&output)
    );
    assert!(
        stdout(&output).contains("#compdef timefiles"),
        "zsh completion should contain #compdef"
    );
}

#[test]
fn test_completion_bash() {
    let output = Command::new(env!("CARGO_BIN_EXE_timefiles"))
        .args(["completion", "bash"])
        .output()
        .expect("Failed to execute");

    assert!(
        output.status.success(),
        "completion bash failed: {}",
        stderr(&output)
    );
    assert!(
        stdout(&output).contains("_timefiles"),
        "bash completion should contain _timefiles function"
    );
}

// =============================================================================
// Task CRUD Tests
// =============================================================================

#[test]
fn test_create_and_overview() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    create_task(&db_path, "Write report", None);
    create_task(&db_path, "Read mail", None);

    let output = run_timefiles(&["overview"], &db_path);
    assert!(
        output.status.success(),
        "overview failed: {}",
        stderr(&output)
    );
    let out = stdout(&output);
    assert!(out.contains("Write report"));
    assert!(out.contains("Read mail"));
    assert!(out.contains("idle"));
}

#[test]
fn test_create_with_missing_parent_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let output = run_timefiles(&["create", "orphan", "--parent", "no-such-id"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not found"));
}

#[test]
fn test_create_with_empty_title_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let output = run_timefiles(&["create", "   "], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("title"));
}

#[test]
fn test_rename_round_trip() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let id = create_task(&db_path, "Original", None);
    let output = run_timefiles(&["rename", &id, "Changed"], &db_path);
    assert!(output.status.success(), "rename failed: {}", stderr(&output));
    let output = run_timefiles(&["rename", &id, "Original"], &db_path);
    assert!(output.status.success());

    let output = run_timefiles(&["overview"], &db_path);
    assert!(stdout(&output).contains("Original"));
    assert!(!stdout(&output).contains("Changed"));

    // both renames are kept as history
    let output = run_timefiles(&["events"], &db_path);
    let renames = stdout(&output).matches("rename").count();
    assert_eq!(renames, 2, "events output: {}", stdout(&output));
}

#[test]
fn test_archive_hides_task() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let id = create_task(&db_path, "Ephemeral", None);
    let output = run_timefiles(&["archive", &id], &db_path);
    assert!(output.status.success(), "archive failed: {}", stderr(&output));

    let output = run_timefiles(&["overview"], &db_path);
    assert!(!stdout(&output).contains("Ephemeral"));
}

#[test]
fn test_hard_delete_requires_archive_first() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let id = create_task(&db_path, "Victim", None);

    let output = run_timefiles(&["delete", &id, "--hard"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("archiv"));

    let output = run_timefiles(&["archive", &id], &db_path);
    assert!(output.status.success());
    let output = run_timefiles(&["delete", &id, "--hard"], &db_path);
    assert!(
        output.status.success(),
        "hard delete failed: {}",
        stderr(&output)
    );
}

// =============================================================================
// Timing Flow Tests
// =============================================================================

#[test]
fn test_start_pause_resume_stop_flow() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let id = create_task(&db_path, "Focus work", None);

    let output = run_timefiles(&["start", &id], &db_path);
    assert!(output.status.success(), "start failed: {}", stderr(&output));
    let output = run_timefiles(&["overview"], &db_path);
    assert!(stdout(&output).contains("running"));

    let output = run_timefiles(&["pause", &id], &db_path);
    assert!(output.status.success(), "pause failed: {}", stderr(&output));
    let output = run_timefiles(&["overview"], &db_path);
    assert!(stdout(&output).contains("paused"));

    let output = run_timefiles(&["resume", &id], &db_path);
    assert!(output.status.success(), "resume failed: {}", stderr(&output));

    let output = run_timefiles(&["stop", &id], &db_path);
    assert!(output.status.success(), "stop failed: {}", stderr(&output));
    let output = run_timefiles(&["overview"], &db_path);
    assert!(stdout(&output).contains("stopped"));
}

#[test]
fn test_second_start_preempts_first() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let a = create_task(&db_path, "Task A", None);
    let b = create_task(&db_path, "Task B", None);

    run_timefiles(&["start", &a], &db_path);
    let output = run_timefiles(&["start", &b], &db_path);
    assert!(output.status.success(), "start B failed: {}", stderr(&output));

    // exactly one running task, and it is B
    let output = run_timefiles(&["overview", "--json"], &db_path);
    let snapshot: serde_json::Value =
        serde_json::from_str(&stdout(&output)).expect("overview --json should be valid JSON");
    let tasks = snapshot["tasks"].as_array().unwrap();
    let running: Vec<_> = tasks
        .iter()
        .filter(|t| t["status"] == "running")
        .collect();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0]["id"], b.as_str());
    assert_eq!(snapshot["active_task_id"], b.as_str());

    // A was paused by the switch
    let paused: Vec<_> = tasks.iter().filter(|t| t["status"] == "paused").collect();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0]["id"], a.as_str());
}

#[test]
fn test_stop_idle_task_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let id = create_task(&db_path, "Never started", None);
    let output = run_timefiles(&["stop", &id], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid state"));
}

#[test]
fn test_subtask_flow_with_auto_resume() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let parent = create_task(&db_path, "Parent work", None);
    run_timefiles(&["start", &parent], &db_path);

    let output = run_timefiles(&["subtask", &parent, "Quick detour"], &db_path);
    assert!(output.status.success(), "subtask failed: {}", stderr(&output));
    let child = stdout(&output)
        .lines()
        .find_map(|line| line.trim().strip_prefix("id: ").map(str::to_string))
        .expect("subtask should print the child id");

    // the child runs, the parent waits
    let output = run_timefiles(&["overview", "--json"], &db_path);
    let snapshot: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(snapshot["active_task_id"], child.as_str());

    // stopping the child hands the clock back to the parent
    let output = run_timefiles(&["stop", &child], &db_path);
    assert!(output.status.success(), "stop failed: {}", stderr(&output));
    let output = run_timefiles(&["overview", "--json"], &db_path);
    let snapshot: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(snapshot["active_task_id"], parent.as_str());
}

#[test]
fn test_subtask_requires_running_parent() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let parent = create_task(&db_path, "Idle parent", None);
    let output = run_timefiles(&["subtask", &parent, "child"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid state"));
}

// =============================================================================
// Reparent Tests
// =============================================================================

#[test]
fn test_reparent_cycle_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let x = create_task(&db_path, "X", None);
    let y = create_task(&db_path, "Y", Some(&x));

    let output = run_timefiles(&["reparent", &x, "--parent", &y], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("cycle"));

    let output = run_timefiles(&["reparent", &x, "--parent", &x], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("cycle"));
}

#[test]
fn test_reparent_to_root() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let parent = create_task(&db_path, "Parent", None);
    let child = create_task(&db_path, "Child", Some(&parent));

    let output = run_timefiles(&["reparent", &child], &db_path);
    assert!(output.status.success(), "reparent failed: {}", stderr(&output));

    let output = run_timefiles(&["overview", "--json"], &db_path);
    let snapshot: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let child_view = snapshot["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["id"] == child.as_str())
        .unwrap();
    assert!(child_view["parent_id"].is_null());
}

// =============================================================================
// Tag Tests
// =============================================================================

#[test]
fn test_tag_add_remove_round_trip() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let id = create_task(&db_path, "Tagged", None);
    let output = run_timefiles(&["tag", "add", &id, "deep-work"], &db_path);
    assert!(output.status.success(), "tag add failed: {}", stderr(&output));

    let output = run_timefiles(&["overview"], &db_path);
    assert!(stdout(&output).contains("deep-work"));

    let output = run_timefiles(&["tag", "remove", &id, "deep-work"], &db_path);
    assert!(output.status.success());
    let output = run_timefiles(&["overview"], &db_path);
    assert!(!stdout(&output).contains("deep-work"));
}

#[test]
fn test_tag_add_is_idempotent() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let id = create_task(&db_path, "Tagged twice", None);
    run_timefiles(&["tag", "add", &id, "focus"], &db_path);
    let output = run_timefiles(&["tag", "add", &id, "focus"], &db_path);
    assert!(output.status.success());

    // one membership, one event
    let output = run_timefiles(&["events"], &db_path);
    assert_eq!(stdout(&output).matches("tag_add").count(), 1);
}

// =============================================================================
// Rest Suggestion Tests
// =============================================================================

#[test]
fn test_switch_produces_suggestion_and_supersession() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let a = create_task(&db_path, "A", None);
    let b = create_task(&db_path, "B", None);

    run_timefiles(&["start", &a], &db_path);
    run_timefiles(&["start", &b], &db_path);

    let output = run_timefiles(&["rest", "show"], &db_path);
    assert!(output.status.success(), "rest show failed: {}", stderr(&output));
    let first_show = stdout(&output);
    assert!(
        first_show.contains("Rest suggestion"),
        "expected a pending suggestion, got: {}",
        first_show
    );

    // another switch supersedes the pending suggestion
    run_timefiles(&["resume", &a], &db_path);
    let output = run_timefiles(&["rest", "show"], &db_path);
    assert!(stdout(&output).contains("Rest suggestion"));
}

#[test]
fn test_rest_accept_clears_pending() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let a = create_task(&db_path, "A", None);
    let b = create_task(&db_path, "B", None);
    run_timefiles(&["start", &a], &db_path);
    run_timefiles(&["start", &b], &db_path);

    let output = run_timefiles(&["overview", "--json"], &db_path);
    let snapshot: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let suggestion_id = snapshot["rest_suggestion"]["id"]
        .as_i64()
        .expect("snapshot should carry the pending suggestion");

    let output = run_timefiles(&["rest", "accept", &suggestion_id.to_string()], &db_path);
    assert!(output.status.success(), "accept failed: {}", stderr(&output));

    let output = run_timefiles(&["rest", "show"], &db_path);
    assert!(stdout(&output).contains("No pending rest suggestion"));
}

#[test]
fn test_rest_respond_unknown_id_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let output = run_timefiles(&["rest", "accept", "424242"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not found"));
}

// =============================================================================
// Detail View Tests
// =============================================================================

#[test]
fn test_show_task_detail() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let id = create_task(&db_path, "Inspected", None);
    run_timefiles(&["tag", "add", &id, "deep"], &db_path);
    run_timefiles(&["start", &id], &db_path);
    run_timefiles(&["stop", &id], &db_path);

    let output = run_timefiles(&["show", &id], &db_path);
    assert!(output.status.success(), "show failed: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Inspected"));
    assert!(out.contains("stopped"));
    assert!(out.contains("deep"));
    assert!(out.contains("start"));
    assert!(out.contains("stop"));
}

#[test]
fn test_show_unknown_task_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let output = run_timefiles(&["show", "no-such-task"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not found"));
}

// =============================================================================
// Overview Snapshot Tests
// =============================================================================

#[test]
fn test_overview_json_shape() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let id = create_task(&db_path, "Shape check", None);
    run_timefiles(&["start", &id], &db_path);

    let output = run_timefiles(&["overview", "--range", "today", "--json"], &db_path);
    assert!(output.status.success(), "overview failed: {}", stderr(&output));

    let snapshot: serde_json::Value =
        serde_json::from_str(&stdout(&output)).expect("Output should be valid JSON");
    assert_eq!(snapshot["range"], "today");
    assert!(snapshot["generated_at"].is_i64());
    assert_eq!(snapshot["active_task_id"], id.as_str());

    let task = &snapshot["tasks"].as_array().unwrap()[0];
    for field in [
        "id",
        "title",
        "status",
        "created_at",
        "tags",
        "inclusive_seconds",
        "exclusive_seconds",
    ] {
        assert!(!task[field].is_null(), "missing field {field}");
    }
}

#[test]
fn test_overview_rejects_unknown_range() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let output = run_timefiles(&["overview", "--range", "fortnight"], &db_path);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unsupported range"));
}

// =============================================================================
// Backup Tests
// =============================================================================

#[test]
fn test_backup_copies_database() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");
    let backup_path = temp_dir.path().join("backup.db");

    create_task(&db_path, "Saved", None);

    let output = run_timefiles(
        &["backup", "--output", backup_path.to_str().unwrap()],
        &db_path,
    );
    assert!(output.status.success(), "backup failed: {}", stderr(&output));
    assert!(backup_path.exists());

    // the copy is a usable database
    let output = run_timefiles(&["overview"], &backup_path);
    assert!(stdout(&output).contains("Saved"));
}
