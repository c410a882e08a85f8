use assert_cmd::Command;
use predicates::prelude::*;

fn transcriptor() -> Command {
    Command::cargo_bin("transcriptor").unwrap()
}

#[test]
fn help_lists_subcommands() {
    transcriptor()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("transcribe"))
        .stdout(predicate::str::contains("batch"))
        .stdout(predicate::str::contains("strategies"));
}

#[test]
fn platforms_lists_known_hosts() {
    transcriptor()
        .arg("platforms")
        .assert()
        .success()
        .stdout(predicate::str::contains("bilibili"))
        .stdout(predicate::str::contains("youtube"));
}

#[test]
fn strategies_are_listed_in_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "app:\n  max_concurrent_jobs: 1\n").unwrap();

    transcriptor()
        .current_dir(dir.path())
        .arg("strategies")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"(?s)bilibili-api.*direct-link.*you-get.*gallery-dl.*yt-dlp").unwrap());
}

#[test]
fn batch_without_inputs_fails() {
    transcriptor()
        .arg("batch")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No inputs"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "download:\n  max_parallel_segments: 0\n").unwrap();

    transcriptor()
        .current_dir(dir.path())
        .args(["config", "--show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_parallel_segments"));
}
