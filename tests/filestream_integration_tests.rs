// SPDX-License-Identifier: Apache-2.0

//! Filestream Integration Tests
//!
//! End-to-end runs of the agent against real files in scratch directories,
//! plus the startup contract of the `filestream` binary.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use filestream::init::agent::Agent;
use filestream::init::config::load_config;
use filestream::receivers::file::persistence::LOG_FILE_NAME;
use filestream::receivers::file::{FileId, RegistryStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("filestream.yml");
    std::fs::write(&path, contents).unwrap();
    path
}

fn run_binary(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_filestream"))
        .args(args)
        .env_remove("FILESTREAM_LOG_FORMAT")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run filestream binary")
}

fn combined_output(output: &Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clean_inactive_removes_closed_state() {
    let dir = TempDir::new().unwrap();
    let logs_dir = dir.path().join("logs");
    std::fs::create_dir(&logs_dir).unwrap();
    let registry_dir = dir.path().join("registry");

    let log_file = logs_dir.join("test-clean-inactive.log");
    {
        let mut file = std::fs::File::create(&log_file).unwrap();
        for i in 0..5 {
            writeln!(file, "log line {}", i).unwrap();
        }
        file.sync_all().unwrap();
    }
    let identity = FileId::from_path(&log_file).unwrap();

    let config_path = write_config(
        dir.path(),
        &format!(
            r#"
inputs:
  - type: filestream
    id: "test-clean-inactive"
    paths: ["{}"]
    clean_inactive: 3s
    ignore_older: 2s
    close:
      on_state_change:
        inactive: 1s
    prospector:
      scanner:
        check_interval: 1s
registry:
  path: "{}"
  cleanup_interval: 500ms
"#,
            logs_dir.join("*.log").display(),
            registry_dir.display()
        ),
    );

    let config = load_config(&config_path).unwrap();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(Agent::new(config, 64).run(cancel.clone()));

    // The removal is only visible in the log until shutdown compacts it
    let registry_log = registry_dir.join(LOG_FILE_NAME);
    let expected_key = format!(
        "\"key\":\"test-clean-inactive::{}-{}\"",
        identity.dev(),
        identity.ino()
    );
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    let contents = loop {
        let contents = std::fs::read_to_string(&registry_log).unwrap_or_default();
        if contents.contains("\"op\":\"remove\"") {
            break contents;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry entry was never removed, log:\n{}",
            contents
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    let remove_line = contents
        .lines()
        .find(|line| line.contains("\"op\":\"remove\""))
        .unwrap();
    assert!(remove_line.contains(&expected_key));

    // The entry went through a close before it was removed
    let phases: Vec<&str> = contents
        .lines()
        .filter(|line| line.contains(&expected_key))
        .filter_map(|line| {
            ["discovered", "reading", "inactive", "closed"]
                .into_iter()
                .find(|phase| line.contains(&format!("\"phase\":\"{}\"", phase)))
        })
        .collect();
    assert_eq!(phases.first(), Some(&"discovered"));
    assert_eq!(phases.last(), Some(&"closed"));
    assert!(phases.contains(&"inactive"));

    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert!(RegistryStore::replay(&registry_dir).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_resumes_from_stored_offset() {
    let dir = TempDir::new().unwrap();
    let log_file = dir.path().join("app.log");
    std::fs::write(&log_file, "first\n").unwrap();

    let config_path = write_config(
        dir.path(),
        &format!(
            r#"
inputs:
  - type: filestream
    id: "resume"
    paths: ["{}"]
    prospector:
      scanner:
        check_interval: 100ms
registry:
  path: "{}"
"#,
            dir.path().join("*.log").display(),
            dir.path().join("registry").display()
        ),
    );

    let run_until_offset = |offset: u64| {
        let config = load_config(&config_path).unwrap();
        let registry_dir = config.registry.path.clone();
        async move {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(Agent::new(config, 64).run(cancel.clone()));
            let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
            let needle = format!("\"offset\":{}", offset);
            loop {
                let contents =
                    std::fs::read_to_string(registry_dir.join(LOG_FILE_NAME)).unwrap_or_default();
                if contents.contains(&needle) {
                    break;
                }
                assert!(tokio::time::Instant::now() < deadline, "never reached {}", needle);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            cancel.cancel();
            handle.await.unwrap().unwrap();
            RegistryStore::replay(&registry_dir).unwrap()
        }
    };

    let states = run_until_offset(6).await;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].1.offset, 6);

    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_file)
            .unwrap();
        writeln!(file, "second").unwrap();
    }

    // Only the new line is read after the restart
    let states = run_until_offset(13).await;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].1.offset, 13);
}

#[test]
fn test_duplicate_ids_fail_startup() {
    let dir = TempDir::new().unwrap();
    let registry_dir = dir.path().join("registry");
    let config_path = write_config(
        dir.path(),
        &format!(
            r#"
inputs:
  - type: filestream
    paths: ["/tmp/*.log"]
  - type: filestream
    id: "duplicated-id-1"
    paths: ["/tmp/duplicated-id-1.log"]
  - type: filestream
    id: "duplicated-id-1"
    paths: ["/tmp/duplicated-id-1-2.log"]
  - type: filestream
    id: "unique-id-1"
    paths: ["/tmp/unique-id-1.log"]
registry:
  path: "{}"
"#,
            registry_dir.display()
        ),
    );

    let output = run_binary(&["start", "--config", config_path.to_str().unwrap()]);
    let text = combined_output(&output);

    assert!(!output.status.success(), "agent started:\n{}", text);
    assert_eq!(output.status.code(), Some(1));
    assert!(text.contains("filestream inputs validation error"), "{}", text);
    assert!(text.contains("duplicated-id-1"), "{}", text);
    assert!(!text.contains("Input 'filestream' starting"), "{}", text);
    assert!(!registry_dir.exists());
}

#[test]
fn test_inputs_without_ids_validate() {
    let dir = TempDir::new().unwrap();
    let config_path = write_config(
        dir.path(),
        r#"
inputs:
  - type: filestream
    paths: ["/tmp/*.log"]
  - type: filestream
    paths: ["/var/log/*.log"]
"#,
    );

    let output = run_binary(&["validate", "--config", config_path.to_str().unwrap()]);
    let text = combined_output(&output);

    assert!(output.status.success(), "{}", text);
    assert!(text.contains("Configuration is valid"), "{}", text);
}

#[test]
fn test_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.yml");

    let output = run_binary(&["validate", "--config", missing.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(combined_output(&output).contains("configuration file not found"));
}

#[test]
fn test_version() {
    let output = run_binary(&["version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with(env!("CARGO_PKG_VERSION")));
}
