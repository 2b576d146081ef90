//! CLI integration tests.
//!
//! These tests verify argument parsing, configuration loading and the
//! binary's commands end to end.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;

use scope_broker::cli::{parse_args_from, Args, CliCommand};
use scope_broker::config::{Config, HelperMode};
use scope_broker::resource::PermissionMode;

const BIN: &str = env!("CARGO_BIN_EXE_scope-broker");

fn args(args: &[&str]) -> Vec<OsString> {
    std::iter::once("scope-broker")
        .chain(args.iter().copied())
        .map(OsString::from)
        .collect()
}

/// The binary with an environment that cannot leak host settings in.
fn broker() -> Command {
    let mut command = Command::new(BIN);
    for (key, _) in std::env::vars_os() {
        if key.to_string_lossy().starts_with("SCOPE_BROKER_") {
            command.env_remove(key);
        }
    }
    command.env_remove("RUST_LOG");
    command
}

// ============================================================================
// CLI Argument Tests
// ============================================================================

#[test]
fn test_cli_defaults() {
    let result = parse_args_from(args(&[])).unwrap();

    assert!(result.command.is_none());
    assert!(result.config.is_none());
    assert!(result.helper.is_none());
    assert!(result.permission_mode.is_none());
    assert!(!result.help);
    assert!(!result.version);
}

#[test]
fn test_cli_full_options() {
    let result = parse_args_from(args(&[
        "-l",
        "debug",
        "--helper",
        "/usr/libexec/scope-helper",
        "--permission-mode",
        "deny_all",
        "exec",
        "-t",
        "30",
        "--",
        "restic",
        "snapshots",
    ]))
    .unwrap();

    assert_eq!(result.log_level, Some("debug".to_string()));
    assert_eq!(
        result.helper,
        Some(HelperMode::Path(PathBuf::from("/usr/libexec/scope-helper")))
    );
    assert_eq!(result.permission_mode, Some(PermissionMode::DenyAll));
    match result.command {
        Some(CliCommand::Exec(exec)) => {
            assert_eq!(exec.program, "restic");
            assert_eq!(exec.arguments, vec!["snapshots"]);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn test_cli_config_file() {
    let result = parse_args_from(args(&["-c", "/etc/scope-broker.json", "ping"])).unwrap();

    assert_eq!(
        result.config.unwrap().to_str().unwrap(),
        "/etc/scope-broker.json"
    );
}

#[test]
fn test_cli_invalid_input() {
    assert!(parse_args_from(args(&["--permission-mode", "ask", "ping"])).is_err());
    assert!(parse_args_from(args(&["launch"])).is_err());
    assert!(parse_args_from(args(&["exec"])).is_err());
}

// ============================================================================
// Configuration Loading Tests
// ============================================================================

#[test]
fn test_config_from_json_file() {
    let json = r#"{
        "storage": {
            "bookmark_store": "/srv/broker/bookmarks.json",
            "vault_dir": "/srv/broker/vault"
        },
        "access": {
            "max_duration_secs": 120,
            "permission_mode": "grant_all"
        },
        "channel": {
            "helper": "self",
            "default_timeout_secs": 60,
            "ping_timeout_ms": 500,
            "bookmark_env_prefix": "BACKUP_BOOKMARK"
        },
        "vault": {
            "sharing_group": "backup"
        },
        "logging": {
            "level": "debug"
        }
    }"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(
        config.storage.vault_dir,
        Some(PathBuf::from("/srv/broker/vault"))
    );
    assert_eq!(config.access.max_duration_secs, 120);
    assert_eq!(config.access.permission_mode, PermissionMode::GrantAll);
    assert_eq!(config.channel.helper, HelperMode::CurrentExe);
    assert_eq!(config.channel.default_timeout_secs, 60);
    assert_eq!(config.channel.bookmark_env_prefix, "BACKUP_BOOKMARK");
    assert_eq!(config.vault.sharing_group.as_deref(), Some("backup"));
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_config_priority_cli_over_file() {
    let json = r#"{
        "access": { "permission_mode": "deny_all" },
        "vault": { "sharing_group": "from-file" }
    }"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let args = Args {
        config: Some(file.path().to_path_buf()),
        permission_mode: Some(PermissionMode::GrantAll),
        sharing_group: Some("from-cli".to_string()),
        ..Args::default()
    };

    let config = Config::load(&args).unwrap();

    assert_eq!(config.access.permission_mode, PermissionMode::GrantAll);
    assert_eq!(config.vault.sharing_group.as_deref(), Some("from-cli"));
    assert_eq!(config.source.as_deref(), Some(file.path()));
}

#[test]
fn test_config_rejects_invalid_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(br#"{"access": {"max_duration_secs": 0}}"#).unwrap();

    let args = Args {
        config: Some(file.path().to_path_buf()),
        ..Args::default()
    };
    assert!(Config::load(&args).is_err());
}

#[test]
fn test_config_partial_deserialization() {
    let json = r#"{"channel": {"kill_grace_ms": 1000}}"#;
    let config: Config = serde_json::from_str(json).unwrap();

    assert_eq!(config.channel.kill_grace_ms, 1000);
    assert_eq!(config.channel.default_timeout_secs, 300); // Default
    assert_eq!(config.channel.helper, HelperMode::None); // Default
}

// ============================================================================
// Binary Tests
// ============================================================================

#[test]
fn test_binary_version() {
    let output = broker().arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("scope-broker "));
}

#[test]
fn test_binary_usage_error() {
    let output = broker().arg("frobnicate").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_binary_bookmark_then_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("source");
    std::fs::create_dir(&target).unwrap();
    let store = dir.path().join("bookmarks.json");

    let output = broker()
        .arg("--store")
        .arg(&store)
        .arg("bookmark")
        .arg(&target)
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let token = String::from_utf8(output.stdout).unwrap();
    assert!(store.exists());

    let output = broker()
        .args(["resolve", token.trim()])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert_eq!(
        PathBuf::from(String::from_utf8(output.stdout).unwrap().trim()),
        target.canonicalize().unwrap()
    );
}

#[test]
fn test_binary_bookmark_denied() {
    let dir = tempfile::tempdir().unwrap();
    let output = broker()
        .args(["--permission-mode", "deny_all", "bookmark"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("denied"));
}

#[test]
fn test_binary_secret_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let vault = dir.path().join("vault");

    let mut child = broker()
        .arg("--vault-dir")
        .arg(&vault)
        .args(["secret", "set", "repo1", "--group", "g1"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"correct horse\n")
        .unwrap();
    assert!(child.wait().unwrap().success());

    let output = broker()
        .arg("--vault-dir")
        .arg(&vault)
        .args(["secret", "get", "repo1", "-g", "g1"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert_eq!(String::from_utf8(output.stdout).unwrap(), "correct horse\n");

    // Not visible outside its group.
    let output = broker()
        .arg("--vault-dir")
        .arg(&vault)
        .args(["secret", "get", "repo1"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[cfg(unix)]
#[test]
fn test_binary_exec_reports_exit_code() {
    let output = broker()
        .args(["exec", "-w", "/", "--", "sh", "-c", "echo out; exit 3"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
}
