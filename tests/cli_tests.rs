use assert_cmd::Command;
use predicates::prelude::*;
use retrace::{CallDescriptor, PolicyTable, RecordConfig, Session, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_trace(dir: &Path) -> PathBuf {
    let path = dir.join("run.trace");
    let file = std::fs::File::create(&path).unwrap();
    let config = RecordConfig::new()
        .with_pid(300)
        .with_argv(vec!["app.py".into(), "--fast".into()])
        .with_metadata("host", "ci");
    let session = Session::begin_recording(file, config, PolicyTable::new()).unwrap();
    session
        .call(&CallDescriptor::new("time.time"), &mut |_: &CallDescriptor| {
            Ok(Value::Float(1.5))
        })
        .unwrap();
    let child = session.fork(301).unwrap();
    child.finish().unwrap();
    session.finish().unwrap();
    path
}

#[test]
fn test_info_shows_header() {
    let dir = TempDir::new().unwrap();
    let trace = write_trace(dir.path());

    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("retrace").unwrap();
    cmd.arg("info")
        .arg(&trace)
        .assert()
        .success()
        .stdout(predicate::str::contains("root pid:         300"))
        .stdout(predicate::str::contains("argv:             app.py --fast"))
        .stdout(predicate::str::contains("meta host: ci"));
}

#[test]
fn test_pids_and_dump() {
    let dir = TempDir::new().unwrap();
    let trace = write_trace(dir.path());

    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("retrace").unwrap();
    cmd.arg("pids")
        .arg(&trace)
        .assert()
        .success()
        .stdout("300\n301\n");

    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("retrace").unwrap();
    let output = cmd.arg("dump").arg(&trace).arg("--json").output().unwrap();
    assert!(output.status.success());
    let lines: Vec<serde_json::Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let kinds: Vec<&str> = lines.iter().map(|l| l["kind"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["SYNC", "RESULT", "SYNC", "RESULT"]);
    assert_eq!(lines[1]["message"], "RESULT 1.5");
    assert_eq!(lines[3]["message"], "RESULT 301");

    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("retrace").unwrap();
    cmd.args(["dump", "--pid", "301"])
        .arg(&trace)
        .assert()
        .success()
        .stdout(predicate::str::contains("[main] RESULT 0"));
}

#[test]
fn test_fork_path_expansion() {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("retrace").unwrap();
    cmd.args(["fork-path", "child-2-1-1"])
        .assert()
        .success()
        .stdout("1101\n");

    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("retrace").unwrap();
    cmd.args(["fork-path", "sideways-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("must start with 'child' or 'parent'"));
}

#[test]
fn test_truncated_trace_fails() {
    let dir = TempDir::new().unwrap();
    let trace = write_trace(dir.path());
    let bytes = std::fs::read(&trace).unwrap();
    std::fs::write(&trace, &bytes[..bytes.len() - 2]).unwrap();

    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("retrace").unwrap();
    cmd.arg("pids")
        .arg(&trace)
        .assert()
        .failure()
        .stderr(predicate::str::contains("R100"));
}
