use assert_cmd::Command;
use predicates::str::{contains, starts_with};
use tempfile::tempdir;

const RULE: &str = r#"
name: example
source: 3
match: ['^https?://item\.example\.com/']
id:
  match: ['item\.example\.com/([0-9]+)\.html']
  index: 1
scripts:
  - name: price
    script: "document.querySelector('.price').innerText"
"#;

fn pricewatch() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("pricewatch"));
    cmd.env_remove("PRICEWATCH_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    pricewatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Pricewatch"));
}

#[test]
fn test_cli_version() {
    pricewatch().arg("--version").assert().success();
}

#[test]
fn test_cli_completions() {
    pricewatch()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(starts_with("_pricewatch"));
}

#[test]
fn test_rules_lists_valid_directory() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("example.yaml"), RULE).unwrap();
    std::fs::write(dir.path().join("README.md"), "not a rule").unwrap();

    pricewatch()
        .arg("rules")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(contains("example"))
        .stdout(contains("1 rules OK"));
}

#[test]
fn test_rules_json_output() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("example.yml"), RULE).unwrap();

    pricewatch()
        .args(["--format", "json", "rules"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(contains("\"name\": \"example\""))
        .stdout(contains("\"scripts\""));
}

#[test]
fn test_rules_rejects_bad_pattern() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("good.yaml"), RULE).unwrap();
    std::fs::write(
        dir.path().join("broken.yaml"),
        "name: broken\nmatch: ['([unclosed']\nid:\n  match: ['x']\n",
    )
    .unwrap();

    pricewatch()
        .arg("rules")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(contains("broken.yaml"));
}

#[test]
fn test_missing_config_is_fatal() {
    let dir = tempdir().unwrap();
    pricewatch()
        .current_dir(dir.path())
        .args(["crawl", "https://item.example.com/1.html"])
        .assert()
        .failure()
        .stderr(contains("Failed to read config file"));
}

#[test]
fn test_malformed_config_is_fatal() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("pricewatch.toml");
    std::fs::write(&config, "[task]\ncrawl_retry = 0\n").unwrap();

    pricewatch()
        .arg("--config")
        .arg(&config)
        .args(["normalize", "https://s.example/abc"])
        .assert()
        .failure()
        .stderr(contains("crawl_retry"));
}

#[test]
fn test_reload_requires_readable_pid_file() {
    let dir = tempdir().unwrap();
    pricewatch()
        .arg("reload")
        .arg("--pid-file")
        .arg(dir.path().join("missing.pid"))
        .assert()
        .failure()
        .stderr(contains("PID file"));
}
