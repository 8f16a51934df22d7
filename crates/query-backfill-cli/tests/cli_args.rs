#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn backfill() -> Result<Command, Box<dyn std::error::Error>> {
    Ok(Command::cargo_bin("query-backfill")?)
}

fn write_config(dir: &Path, body: &str) -> std::io::Result<std::path::PathBuf> {
    let path = dir.join("backfill.yml");
    std::fs::write(&path, body)?;
    Ok(path)
}

const VALID: &str = "\
queries:
  - name: cpu
    region: us-east-1
    query: SELECT timestamp, value, host FROM metrics
    workgroup: primary
    interval: 1h
";

#[test]
fn help_lists_the_path_flags() -> TestResult {
    backfill()?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config.file"))
        .stdout(predicate::str::contains("--tsdb.path"))
        .stdout(predicate::str::contains("--tsdb.tmp.path"));
    Ok(())
}

#[test]
fn missing_config_file_fails() -> TestResult {
    let tmp = TempDir::new()?;
    backfill()?
        .arg("--config.file")
        .arg(tmp.path().join("absent.yml"))
        .arg("--tsdb.path")
        .arg(tmp.path())
        .arg("--tsdb.tmp.path")
        .arg(tmp.path().join("work"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to read configuration file"));
    Ok(())
}

#[test]
fn malformed_interval_fails_at_startup() -> TestResult {
    let tmp = TempDir::new()?;
    let config = write_config(tmp.path(), &VALID.replace("interval: 1h", "interval: soon"))?;
    backfill()?
        .arg("--config.file")
        .arg(&config)
        .arg("--tsdb.path")
        .arg(tmp.path())
        .arg("--tsdb.tmp.path")
        .arg(tmp.path().join("work"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid interval 'soon'"));
    Ok(())
}

#[test]
fn empty_query_list_fails() -> TestResult {
    let tmp = TempDir::new()?;
    let config = write_config(tmp.path(), "queries: []\n")?;
    backfill()?
        .arg("--config.file")
        .arg(&config)
        .arg("--tsdb.path")
        .arg(tmp.path())
        .arg("--tsdb.tmp.path")
        .arg(tmp.path().join("work"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("defines no queries"));
    Ok(())
}

#[test]
fn missing_destination_store_fails() -> TestResult {
    let tmp = TempDir::new()?;
    let config = write_config(tmp.path(), VALID)?;
    backfill()?
        .arg("--config.file")
        .arg(&config)
        .arg("--tsdb.path")
        .arg(tmp.path().join("no-store"))
        .arg("--tsdb.tmp.path")
        .arg(tmp.path().join("work"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Destination store not found"));
    assert!(!tmp.path().join("work").exists());
    Ok(())
}
