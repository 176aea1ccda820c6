use agent_conductor::{config::GlobalConfig, AppError};

fn full_toml(root: &str) -> String {
    format!(
        r#"
default_project_root = '{root}'
host_cli = "claude"
host_cli_args = ["--print", "--output-format", "stream-json"]
http_port = 4100
ipc_name = "conductor-test"

[scheduler]
default_max_concurrent = 2
fail_fast = true

[queue]
stop_on_failure = false

[bridge]
poll_interval_ms = 50
include_existing = false

[reconnect]
base_delay_ms = 200
max_delay_ms = 2000
max_attempts = 4

[budget]
max_budget_usd = 2.5
max_turns = 30

[launcher]
terminate_grace_seconds = 1
"#
    )
}

fn root() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().to_str().expect("utf8 path").to_owned();
    (dir, path)
}

#[test]
fn parses_every_section() {
    let (_dir, root) = root();
    let config = GlobalConfig::from_toml_str(&full_toml(&root)).expect("valid config");

    assert_eq!(config.host_cli, "claude");
    assert_eq!(config.host_cli_args.len(), 3);
    assert_eq!(config.http_port, 4100);
    assert_eq!(config.ipc_name, "conductor-test");
    assert_eq!(config.scheduler.default_max_concurrent, 2);
    assert!(config.scheduler.fail_fast);
    assert!(!config.queue.stop_on_failure);
    assert_eq!(config.bridge.poll_interval_ms, 50);
    assert!(!config.bridge.include_existing);
    assert_eq!(config.reconnect.max_attempts, 4);
    assert_eq!(config.budget.max_budget_usd, Some(2.5));
    assert_eq!(config.budget.max_turns, Some(30));
    assert_eq!(config.launcher.terminate_grace_seconds, 1);
}

#[test]
fn minimal_config_uses_defaults() {
    let (_dir, root) = root();
    let raw = format!("default_project_root = '{root}'\nhost_cli = \"claude\"\n");
    let config = GlobalConfig::from_toml_str(&raw).expect("valid config");

    assert_eq!(config.http_port, 3000);
    assert_eq!(config.ipc_name, "agent-conductor");
    assert_eq!(config.scheduler.default_max_concurrent, 3);
    assert!(!config.scheduler.fail_fast);
    assert!(config.queue.stop_on_failure);
    assert_eq!(config.bridge.poll_interval_ms, 500);
    assert!(config.bridge.include_existing);
    assert_eq!(config.reconnect.base_delay_ms, 1000);
    assert_eq!(config.reconnect.max_delay_ms, 30_000);
    assert_eq!(config.reconnect.max_attempts, 10);
    assert!(config.budget.is_unbounded());
}

#[test]
fn db_path_defaults_under_project_root() {
    let (dir, root) = root();
    let raw = format!("default_project_root = '{root}'\nhost_cli = \"claude\"\n");
    let config = GlobalConfig::from_toml_str(&raw).expect("valid config");
    let canonical = dir.path().canonicalize().expect("canonical root");
    assert_eq!(
        config.db_path(),
        canonical.join(".conductor").join("conductor.db")
    );
}

#[test]
fn rejects_zero_max_concurrent() {
    let (_dir, root) = root();
    let raw = full_toml(&root).replace("default_max_concurrent = 2", "default_max_concurrent = 0");
    let err = GlobalConfig::from_toml_str(&raw).expect_err("zero concurrency");
    assert!(matches!(err, AppError::Config(msg) if msg.contains("default_max_concurrent")));
}

#[test]
fn rejects_inverted_backoff_bounds() {
    let (_dir, root) = root();
    let raw = full_toml(&root).replace("max_delay_ms = 2000", "max_delay_ms = 100");
    let err = GlobalConfig::from_toml_str(&raw).expect_err("inverted bounds");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn rejects_non_positive_default_budget() {
    let (_dir, root) = root();
    let raw = full_toml(&root).replace("max_budget_usd = 2.5", "max_budget_usd = 0.0");
    let err = GlobalConfig::from_toml_str(&raw).expect_err("zero budget");
    assert!(matches!(err, AppError::Config(msg) if msg.contains("budget")));
}

#[test]
fn rejects_missing_project_root() {
    let raw = "default_project_root = '/definitely/not/here/conductor'\nhost_cli = \"claude\"\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("missing root");
    assert!(matches!(err, AppError::Config(msg) if msg.contains("default_project_root")));
}

#[test]
fn rejects_blank_host_cli() {
    let (_dir, root) = root();
    let raw = format!("default_project_root = '{root}'\nhost_cli = \"  \"\n");
    let err = GlobalConfig::from_toml_str(&raw).expect_err("blank cli");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn load_from_path_reads_file() {
    let (dir, root) = root();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, full_toml(&root)).expect("write config");
    let config = GlobalConfig::load_from_path(&path).expect("load");
    assert_eq!(config.ipc_name, "conductor-test");
}
