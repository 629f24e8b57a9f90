//! Integration tests for the CLI binary.

use assert_cmd::Command;
use plexstore_core::store::layout;
use plexstore_core::{NameFilter, Phase, Resolution, SolutionStore, StoreLocation};
use predicates::str::contains;
use tempfile::TempDir;

mod common;

use common::{Omit, archive_path, write_sample_archive};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("plexstore"))
}

#[test]
fn converts_next_to_the_archive_by_default() -> TestResult {
    let tmp = TempDir::new()?;
    let archive = archive_path(&tmp, "Model Base Solution");
    write_sample_archive(&archive, Omit::default())?;

    cli()
        .arg(&archive)
        .assert()
        .success()
        .stdout(contains("Converted"))
        .stdout(contains("5 datasets"));

    let output = tmp.path().join("Model Base Solution.plexstore");
    assert!(output.join(layout::ATTRS_FILE_NAME).is_file());

    let rt = tokio::runtime::Runtime::new()?;
    let series = rt.block_on(async {
        let store = SolutionStore::open(StoreLocation::local(&output)).await?;
        store
            .query(
                "line",
                "Flow",
                NameFilter::only(["B1_B2"]),
                NameFilter::Any,
                Resolution::Interval,
                Phase::ShortTerm,
            )
            .await
    })?;
    assert_eq!(series.points.len(), 24);
    Ok(())
}

#[test]
fn explicit_output_and_json_report() -> TestResult {
    let tmp = TempDir::new()?;
    let archive = archive_path(&tmp, "run");
    write_sample_archive(&archive, Omit::default())?;
    let output = tmp.path().join("stores").join("run-store");

    let assert = cli()
        .args(["--json", "--sequential", "--output"])
        .arg(&output)
        .arg(&archive)
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone())?;
    let report: serde_json::Value = serde_json::from_str(stdout.trim())?;
    assert_eq!(report["datasets"], 5);
    assert_eq!(report["values_written"], 241);
    assert!(output.join("data").is_dir());
    assert!(!tmp.path().join("run.plexstore").exists());
    Ok(())
}

#[test]
fn output_with_many_archives_is_rejected() -> TestResult {
    let tmp = TempDir::new()?;
    let first = archive_path(&tmp, "a");
    let second = archive_path(&tmp, "b");
    write_sample_archive(&first, Omit::default())?;
    write_sample_archive(&second, Omit::default())?;

    cli()
        .arg("--output")
        .arg(tmp.path().join("out"))
        .arg(&first)
        .arg(&second)
        .assert()
        .failure()
        .stderr(contains("single archive"));
    assert!(!tmp.path().join("out").exists());
    Ok(())
}

#[test]
fn converts_every_archive_given() -> TestResult {
    let tmp = TempDir::new()?;
    let first = archive_path(&tmp, "a");
    let second = archive_path(&tmp, "b");
    write_sample_archive(&first, Omit::default())?;
    write_sample_archive(&second, Omit::default())?;

    cli().arg(&first).arg(&second).assert().success();
    assert!(tmp.path().join("a.plexstore").is_dir());
    assert!(tmp.path().join("b.plexstore").is_dir());
    Ok(())
}

#[test]
fn missing_log_member_fails_without_output() -> TestResult {
    let tmp = TempDir::new()?;
    let archive = archive_path(&tmp, "nolog");
    write_sample_archive(
        &archive,
        Omit {
            log: true,
            ..Omit::default()
        },
    )?;

    cli()
        .arg(&archive)
        .assert()
        .failure()
        .stderr(contains("no log member"));
    assert!(!tmp.path().join("nolog.plexstore").exists());
    Ok(())
}

#[test]
fn missing_metadata_member_fails() -> TestResult {
    let tmp = TempDir::new()?;
    let archive = archive_path(&tmp, "nometa");
    write_sample_archive(
        &archive,
        Omit {
            metadata: true,
            ..Omit::default()
        },
    )?;

    cli()
        .arg(&archive)
        .assert()
        .failure()
        .stderr(contains("no metadata member"));
    Ok(())
}

#[test]
fn unreadable_archive_is_reported() -> TestResult {
    let tmp = TempDir::new()?;
    let archive = archive_path(&tmp, "garbage");
    std::fs::write(&archive, b"definitely not a zip")?;

    cli()
        .arg(&archive)
        .assert()
        .failure()
        .stderr(contains("Not a readable zip archive"));

    cli()
        .arg(tmp.path().join("absent.zip"))
        .assert()
        .failure()
        .stderr(contains("Archive not found"));
    Ok(())
}

#[test]
fn invalid_compression_level_fails() -> TestResult {
    let tmp = TempDir::new()?;
    let archive = archive_path(&tmp, "level");
    write_sample_archive(&archive, Omit::default())?;

    cli()
        .args(["--compression-level", "99"])
        .arg(&archive)
        .assert()
        .failure()
        .stderr(contains("caused by"));
    assert!(!tmp.path().join("level.plexstore").exists());
    Ok(())
}
