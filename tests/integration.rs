use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn sqlcop_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("sqlcop");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[state]
path = "{}/data/state.sqlite"

[backup]
backup_dir = "{}/backups"

[model]
endpoint = "https://example.openai.azure.com"

[server]
bind = "127.0.0.1:7431"
"#,
        root.display(),
        root.display()
    );

    let config_path = config_dir.join("sqlcop.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_sqlcop(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = sqlcop_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        // A key must be present for commands that build the model client;
        // offline paths never send a request with it.
        .env("AZURE_OPENAI_API_KEY", "test-key")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sqlcop binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_sqlcop(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_sqlcop(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_sqlcop(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ask_without_database_returns_fixed_message() {
    let (_tmp, config_path) = setup_test_env();
    run_sqlcop(&config_path, &["init"]);

    let (stdout, stderr, success) =
        run_sqlcop(&config_path, &["ask", "How many orders are there?"]);
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    assert!(
        stdout.contains("There is no database loaded"),
        "unexpected output: {}",
        stdout
    );
}

#[test]
fn test_restore_rejects_wrong_extension() {
    let (tmp, config_path) = setup_test_env();
    run_sqlcop(&config_path, &["init"]);

    let bogus = tmp.path().join("dump.sql");
    fs::write(&bogus, b"not a backup").unwrap();

    let (_, stderr, success) = run_sqlcop(&config_path, &["restore", bogus.to_str().unwrap()]);
    assert!(!success);
    assert!(
        stderr.contains("Unsupported file type"),
        "unexpected stderr: {}",
        stderr
    );

    // No database became current
    let (stdout, _, success) = run_sqlcop(&config_path, &["ask", "anything?"]);
    assert!(success);
    assert!(stdout.contains("There is no database loaded"));
}

#[test]
fn test_ingest_without_embedding_provider_fails() {
    let (tmp, config_path) = setup_test_env();
    run_sqlcop(&config_path, &["init"]);

    let doc = tmp.path().join("notes.txt");
    fs::write(&doc, "some document text to ingest").unwrap();

    let (_, stderr, success) = run_sqlcop(&config_path, &["ingest", doc.to_str().unwrap()]);
    assert!(!success);
    assert!(
        stderr.contains("disabled"),
        "unexpected stderr: {}",
        stderr
    );

    // The failed operation recorded nothing
    let (stdout, _, success) = run_sqlcop(&config_path, &["sources"]);
    assert!(success);
    assert!(stdout.contains("No sources ingested."));
}

#[test]
fn test_sources_empty_by_default() {
    let (_tmp, config_path) = setup_test_env();
    run_sqlcop(&config_path, &["init"]);

    let (stdout, _, success) = run_sqlcop(&config_path, &["sources"]);
    assert!(success);
    assert!(stdout.contains("No sources ingested."));
}

#[test]
fn test_reset_clears_history() {
    let (_tmp, config_path) = setup_test_env();
    run_sqlcop(&config_path, &["init"]);

    // Record a turn via the no-database ask path
    run_sqlcop(&config_path, &["ask", "hello?"]);

    let (stdout, _, success) = run_sqlcop(&config_path, &["reset"]);
    assert!(success);
    assert!(stdout.contains("Session reset."));
}

#[test]
fn test_missing_config_is_a_clear_error() {
    let (tmp, _) = setup_test_env();
    let missing = tmp.path().join("nope.toml");

    let binary = sqlcop_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(missing.to_str().unwrap())
        .arg("init")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read config file"));
}
