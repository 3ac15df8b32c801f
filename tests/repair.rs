use anyhow::Result;
use tempfile::tempdir;

mod common;

use common::*;

#[test]
fn repair_packs_round_trips_undamaged_packs() -> Result<()> {
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

    let before = cli_run(working_path, backup_path)?
        .args(["ls", "latest"])
        .assert()
        .success();
    let before = stdout(&before).trim().to_string();

    let pack_id = files_in(&backup_path.join("packs"))
        .next()
        .expect("no packs written")
        .file_stem()
        .expect("pack file has no stem")
        .to_string_lossy()
        .to_string();

    cli_run(working_path, backup_path)?
        .args(["repair", "packs", &pack_id])
        .assert()
        .success();

    cli_run(working_path, backup_path)?
        .args(["check", "--read-all"])
        .assert()
        .success();

    let after = cli_run(working_path, backup_path)?
        .args(["ls", "latest"])
        .assert()
        .success();
    let after = stdout(&after).trim().to_string();

    assert_eq!(before, after);

    Ok(())
}

#[test]
fn repair_snapshots_is_a_noop_when_nothing_is_missing() -> Result<()> {
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

    let before = cli_run(working_path, backup_path)?
        .args(["ls", "latest"])
        .assert()
        .success();
    let before = stdout(&before).trim().to_string();

    cli_run(working_path, backup_path)?
        .args(["repair", "snapshots"])
        .assert()
        .success();

    let after = cli_run(working_path, backup_path)?
        .args(["ls", "latest"])
        .assert()
        .success();
    let after = stdout(&after).trim().to_string();

    assert_eq!(before, after);

    Ok(())
}
