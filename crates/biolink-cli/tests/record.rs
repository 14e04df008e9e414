use assert_cmd::Command;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn record(log_dir: &Path, subject: &str) -> Command {
    let mut cmd = Command::cargo_bin("biolink").unwrap();
    cmd.args([
        "record",
        "--subject",
        subject,
        "--experiment",
        "cli",
        "--no-serial",
        "--no-live-feed",
        "--log-dir",
        log_dir.to_str().unwrap(),
    ]);
    cmd
}

fn summary(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let line = text.lines().last().expect("summary line");
    serde_json::from_str(line).unwrap()
}

#[test]
fn nolog_run_writes_only_the_message_log() {
    let temp = tempdir().unwrap();
    let output = record(temp.path(), "nolog")
        .write_stdin("stop\n")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = summary(&output);
    assert_eq!(json["cause"], "stop requested");
    assert_eq!(json["forced"], false);
    assert!(json["archive"].is_null());

    let names: Vec<String> = fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 1, "{:?}", names);
    assert!(names[0].starts_with("BioLink_MsgLog_"));
    let log = fs::read_to_string(temp.path().join(&names[0])).unwrap();
    assert!(log.contains("stop requested"));
}

#[test]
fn countdown_worker_process_ends_the_run() {
    let temp = tempdir().unwrap();
    let output = record(temp.path(), "s01")
        .args([
            "--extension",
            "countdown",
            "--option",
            "count=2",
            "--option",
            "interval_ms=100",
        ])
        .write_stdin("")
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = summary(&output);
    assert_eq!(json["cause"], "extension requested the end");
    assert_eq!(json["extension_events"], 2);

    let archive = json["archive"].as_str().unwrap();
    assert!(Path::new(archive).exists());
    let base = archive.trim_end_matches(".npz");
    let extension_log = fs::read_to_string(format!("{}_countdown.txt", base)).unwrap();
    assert!(extension_log.contains("remaining"));
}

#[test]
fn unknown_device_fails_before_recording() {
    let temp = tempdir().unwrap();
    record(temp.path(), "s01")
        .args(["--device", "00:07:80:79:6F:E0"])
        .write_stdin("")
        .assert()
        .failure();
}
