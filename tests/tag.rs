use anyhow::Result;
use tempfile::tempdir;

mod common;

use common::*;

#[test]
fn tag_add_set_remove() -> Result<()> {
    let project_dir = std::env::current_dir()?;

    let backup_dir = tempdir()?;
    let backup_path = backup_dir.path();

    let working_dir = tempdir()?;
    let working_path = working_dir.path();

    cli_run(working_path, backup_path)?
        .args(["init"])
        .assert()
        .success();

    cli_run(working_path, backup_path)?
        .arg("backup")
        .arg(project_dir.join("src"))
        .assert()
        .success();

    let snaps = cli_run(working_path, backup_path)?
        .arg("snapshots")
        .assert()
        .success();
    assert!(!stdout(&snaps).contains('('));

    cli_run(working_path, backup_path)?
        .args(["tag", "--add", "weekly", "latest"])
        .assert()
        .success();

    let snaps = cli_run(working_path, backup_path)?
        .arg("snapshots")
        .assert()
        .success();
    assert!(stdout(&snaps).contains("(weekly)"));

    cli_run(working_path, backup_path)?
        .args(["tag", "--set", "nightly", "latest"])
        .assert()
        .success();

    let snaps = cli_run(working_path, backup_path)?
        .arg("snapshots")
        .assert()
        .success();
    let out = stdout(&snaps);
    assert!(out.contains("(nightly)"));
    assert!(!out.contains("weekly"));

    cli_run(working_path, backup_path)?
        .args(["tag", "--remove", "nightly", "latest"])
        .assert()
        .success();

    let snaps = cli_run(working_path, backup_path)?
        .arg("snapshots")
        .assert()
        .success();
    assert!(!stdout(&snaps).contains('('));

    Ok(())
}
