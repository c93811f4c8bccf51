use assert_cmd::Command;
use predicates::prelude::*;

fn devicegrid() -> Command {
    Command::cargo_bin("devicegrid").unwrap()
}

#[test]
fn test_init_writes_valid_config() {
    let dir = tempfile::tempdir().unwrap();

    devicegrid()
        .current_dir(dir.path())
        .args(["init", "--platform", "ios"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created devicegrid.toml"));

    let written = std::fs::read_to_string(dir.path().join("devicegrid.toml")).unwrap();
    assert!(written.contains(r#"platforms = ["ios"]"#));

    devicegrid()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Platforms: iOS"));
}

#[test]
fn test_init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("devicegrid.toml"), "# mine\n").unwrap();

    devicegrid()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    let kept = std::fs::read_to_string(dir.path().join("devicegrid.toml")).unwrap();
    assert_eq!(kept, "# mine\n");
}

#[test]
fn test_validate_reports_port_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.toml");
    std::fs::write(
        &path,
        r#"
[server]
port = 4750

[suite]
name = "smoke"
command = "true"
"#,
    )
    .unwrap();

    devicegrid()
        .arg("--config")
        .arg(&path)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("overlaps the device port range"));
}

#[test]
fn test_validate_missing_file() {
    let dir = tempfile::tempdir().unwrap();

    devicegrid()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_data_get_reads_test_data_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("testdata.json"),
        r#"{ "LOGIN_001": { "username": "standard_user", "password": "secret_sauce" } }"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("devicegrid.toml"),
        r#"
[suite]
name = "login"
command = "true"

[data]
path = "testdata.json"
"#,
    )
    .unwrap();

    devicegrid()
        .current_dir(dir.path())
        .args(["data", "get", "LOGIN_001", "password"])
        .assert()
        .success()
        .stdout("secret_sauce\n");

    devicegrid()
        .current_dir(dir.path())
        .args(["data", "dump", "LOGIN_001"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""username": "standard_user""#));
}

#[test]
fn test_data_without_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("devicegrid.toml"),
        "[suite]\nname = \"login\"\ncommand = \"true\"\n",
    )
    .unwrap();

    devicegrid()
        .current_dir(dir.path())
        .args(["data", "get", "LOGIN_001", "password"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No test data configured"));
}

#[test]
fn test_data_from_csv_sheet() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("testdata.csv"),
        "TestCaseId,username,password\nLOGIN_002,locked_out_user,\nLOGIN_001,standard_user,secret_sauce\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("devicegrid.toml"),
        r#"
[suite]
name = "login"
command = "true"

[data]
path = "testdata.csv"
"#,
    )
    .unwrap();

    devicegrid()
        .current_dir(dir.path())
        .args(["data", "get", "LOGIN_001", "password"])
        .assert()
        .success()
        .stdout("secret_sauce\n");

    devicegrid()
        .current_dir(dir.path())
        .args(["data", "get", "LOGIN_002", "password"])
        .assert()
        .success()
        .stdout("\n");

    devicegrid()
        .current_dir(dir.path())
        .args(["data", "dump"])
        .assert()
        .success()
        .stdout("LOGIN_001\nLOGIN_002\n");
}
