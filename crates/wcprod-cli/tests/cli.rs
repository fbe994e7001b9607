//! CLI integration tests using assert_cmd.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

const PROJECT_YAML: &str = "\
project: demo
rmin: 0
rmax: 100
zmin: 0
zmax: 100
gap_space: 50
gap_angle: 60
num_photons: 100
";

#[allow(deprecated)]
fn wcprod(db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("wcprod").unwrap();
    cmd.env_remove("WCPROD_DB_FILE")
        .env_remove("WCPROD_PRIORITIZE")
        .env_remove("WCPROD_SAMPLE_SIZE")
        .env_remove("WCPROD_MAX_ENTRIES_PER_SHARD")
        .env("RUST_LOG", "warn")
        .arg("--db")
        .arg(db);
    cmd
}

/// Temp dir with a registered `demo` project split into 3 shards.
fn registered() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("prod.db");
    let yaml = dir.path().join("demo.yaml");
    std::fs::write(&yaml, PROJECT_YAML).unwrap();
    wcprod(&db)
        .arg("register")
        .arg(&yaml)
        .args(["--max-entries", "500"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Sampling configs: 1296").and(predicate::str::contains("Shards: 3")));
    (dir, db)
}

fn select_json(db: &Path, extra: &[&str]) -> serde_json::Value {
    let output = wcprod(db)
        .args(["select", "demo"])
        .args(extra)
        .output()
        .unwrap();
    assert!(output.status.success(), "select failed: {output:?}");
    serde_json::from_slice(&output.stdout).unwrap()
}

// --- Help and arg validation (no database needed) ---

#[test]
fn help_shows_all_subcommands() {
    let dir = tempfile::tempdir().unwrap();
    wcprod(&dir.path().join("x.db"))
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("register")
                .and(predicate::str::contains("select"))
                .and(predicate::str::contains("lock"))
                .and(predicate::str::contains("unlock"))
                .and(predicate::str::contains("register-file"))
                .and(predicate::str::contains("files"))
                .and(predicate::str::contains("status"))
                .and(predicate::str::contains("check"))
                .and(predicate::str::contains("drop"))
                .and(predicate::str::contains("backup")),
        );
}

#[test]
fn worker_commands_do_not_create_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("missing.db");
    wcprod(&db)
        .args(["select", "demo"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot open production database"));
    assert!(!db.exists());
}

#[test]
fn register_rejects_bad_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("prod.db");
    let yaml = dir.path().join("bad.yaml");
    std::fs::write(&yaml, "project: demo\nrmin: 0\n").unwrap();
    wcprod(&db)
        .arg("register")
        .arg(&yaml)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot load project file"));
}

// --- Full production loop ---

#[test]
fn register_list_and_check() {
    let (_dir, db) = registered();
    wcprod(&db)
        .arg("list")
        .assert()
        .success()
        .stdout("demo\n");
    wcprod(&db)
        .args(["check", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));
    wcprod(&db)
        .args(["info", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Shard 2: configs 864 => 1295"));
}

#[test]
fn duplicate_registration_fails() {
    let (dir, db) = registered();
    wcprod(&db)
        .arg("register")
        .arg(dir.path().join("demo.yaml"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn select_then_register_file() {
    let (dir, db) = registered();
    let root = dir.path().join("storage");
    let work = select_json(
        &db,
        &["--storage-root", root.to_str().unwrap(), "--extension", "h5"],
    );
    let config_id = work["config_id"].as_i64().unwrap();
    assert_eq!(work["file_ctr"], 0);
    assert!(work.get("theta").is_some());
    let output_file = work["output_file"].as_str().unwrap().to_string();
    assert_eq!(output_file, format!("out_demo_{config_id:09}_000.h5"));

    let storage = PathBuf::from(work["storage_path"].as_str().unwrap());
    std::fs::create_dir_all(&storage).unwrap();
    let path = storage.join(&output_file);
    std::fs::write(&path, b"events").unwrap();

    wcprod(&db)
        .arg("register-file")
        .arg("demo")
        .arg(config_id.to_string())
        .arg(&path)
        .args(["40", "12.5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"registered\""));

    // Second registration of the same path is refused with exit code 2.
    wcprod(&db)
        .arg("register-file")
        .arg("demo")
        .arg(config_id.to_string())
        .arg(&path)
        .args(["40", "12.5"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("duplicate_path"));

    let output = wcprod(&db)
        .args(["files", "demo", "--config-id"])
        .arg(config_id.to_string())
        .output()
        .unwrap();
    assert!(output.status.success());
    let files: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(files.as_array().unwrap().len(), 1);
    assert_eq!(files[0]["units"], 40);

    let output = wcprod(&db).args(["status", "demo"]).output().unwrap();
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["unit_ctr"], 40);

    wcprod(&db).args(["check", "demo"]).assert().success();
}

#[test]
fn missing_file_is_rejected() {
    let (dir, db) = registered();
    wcprod(&db)
        .arg("register-file")
        .arg("demo")
        .arg("0")
        .arg(dir.path().join("nothing.root"))
        .args(["1", "1.0"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("missing_file"));
}

#[test]
fn locked_campaign_reports_complete() {
    let (_dir, db) = registered();
    wcprod(&db)
        .args(["lock", "demo", "--table", "0"])
        .assert()
        .success()
        .stdout("Locked 1 shard(s)\n");
    for _ in 0..5 {
        let work = select_json(&db, &[]);
        assert_ne!(work["table_id"], 0);
    }

    wcprod(&db).args(["lock", "demo"]).assert().success();
    wcprod(&db).args(["select", "demo"]).assert().code(3);
    wcprod(&db)
        .args(["select", "demo", "--no-prioritize"])
        .assert()
        .code(3);

    wcprod(&db).args(["unlock", "demo"]).assert().success();
    select_json(&db, &["--no-prioritize", "--sample-size", "0"]);
}

#[test]
fn backup_and_drop() {
    let (dir, db) = registered();
    let dest = dir.path().join("backup/prod.db");
    wcprod(&db).arg("backup").arg(&dest).assert().success();
    wcprod(&dest).arg("list").assert().success().stdout("demo\n");

    wcprod(&db).args(["drop", "demo"]).assert().success();
    wcprod(&db).arg("list").assert().success().stdout("");
    wcprod(&db)
        .args(["status", "demo"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn select_defaults_come_from_environment() {
    let (_dir, db) = registered();
    for _ in 0..3 {
        let output = wcprod(&db)
            .env("WCPROD_SAMPLE_SIZE", "1")
            .args(["select", "demo"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let work: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(work["config_id"], 0);
    }
}
