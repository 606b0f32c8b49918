//! End-to-end tests for form-replay.
//!
//! Runs the built binary against journals on disk.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

const JOURNAL: &str = r#"# two users edit a contact form
{"type":"field_add","fieldId":"F1","userId":"alice","seq":1,"timestamp":1000,"value":{"id":"F1","type":"short_text","label":"Name","sectionId":"S1"}}
{"type":"field_update","fieldId":"F1","userId":"bob","seq":1,"timestamp":2000,"value":{"label":"Full Name"}}
{"type":"field_add","fieldId":"F2","userId":"bob","seq":2,"timestamp":2100,"value":{"id":"F2","type":"single_choice","label":"Plan","options":["Free","Pro"],"sectionId":"S2"}}
{"type":"field_delete","fieldId":"F1","userId":"alice","seq":2,"timestamp":1500,"value":null}
"#;

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_form-replay"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run form-replay")
}

fn write_journal(dir: &Path, text: &str) -> String {
    let path = dir.join("ops.jsonl");
    fs::write(&path, text).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn test_prints_converged_tree() {
    let temp = TempDir::new().unwrap();
    let journal = write_journal(temp.path(), JOURNAL);

    let output = run(&[&journal, "--section", "S1", "--section", "S2", "--check"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let tree: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let fields = tree["fields"].as_object().unwrap();
    assert!(!fields.contains_key("F1"), "delete should win over the later update");
    assert_eq!(fields["F2"]["options"], serde_json::json!(["Free", "Pro"]));
    assert_eq!(tree["sections"][1]["rows"][0]["fields"][0], "F2");
}

#[test]
fn test_writes_output_file() {
    let temp = TempDir::new().unwrap();
    let journal = write_journal(temp.path(), JOURNAL);
    let out = temp.path().join("tree.json");

    let output = run(&[
        &journal,
        "-s",
        "S1",
        "-s",
        "S2",
        "--pretty",
        "--output",
        out.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    assert!(fs::read_to_string(&out).unwrap().contains("\n  \"sections\""));
}

#[test]
fn test_invalid_journal_fails_with_line_number() {
    let temp = TempDir::new().unwrap();
    let journal = write_journal(temp.path(), "{\"type\":\"field_move\",\"userId\":\"a\"}\n");

    let output = run(&[&journal]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("line 1"));
}
