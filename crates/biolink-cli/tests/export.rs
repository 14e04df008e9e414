use assert_cmd::Command;
use serde_json::Value;
use std::fs;
use tempfile::tempdir;

#[test]
fn recorded_run_exports_as_tab_delimited_text() {
    let temp = tempdir().unwrap();
    let output = Command::cargo_bin("biolink")
        .unwrap()
        .args([
            "record",
            "--subject",
            "s02",
            "--experiment",
            "export",
            "--channels",
            "ecg,eda",
            "--no-serial",
            "--log-dir",
            temp.path().to_str().unwrap(),
        ])
        .write_stdin("stop\n")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    let json: Value = serde_json::from_str(text.lines().last().unwrap()).unwrap();
    let archive = json["archive"].as_str().unwrap().to_string();
    let metadata: Value =
        serde_json::from_str(&fs::read_to_string(json["metadata"].as_str().unwrap()).unwrap())
            .unwrap();
    assert_eq!(metadata["subject_id"], "s02");
    assert_eq!(metadata["channels"], serde_json::json!(["ecg", "eda"]));
    assert_eq!(metadata["frame_cnt"], json["frames"]);

    let out = temp.path().join("run.txt");
    Command::cargo_bin("biolink")
        .unwrap()
        .args([
            "export",
            "--archive",
            &archive,
            "--out",
            out.to_str().unwrap(),
        ])
        .assert()
        .success();
    let exported = fs::read_to_string(&out).unwrap();
    assert!(exported.contains("# Columns: frame\tecg\teda\tserial_events\textension_events"));
    let rows = exported.lines().filter(|l| !l.starts_with('#')).count();
    assert_eq!(rows as u64, json["frames"].as_u64().unwrap());
}
