use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Seeded {
    teacher: String,
    student: String,
    assignment: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seeded {
    let teacher = request_ok(
        stdin,
        reader,
        "s1",
        "users.create",
        json!({
            "name": "Prof Nieto",
            "email": "nieto@school.test",
            "role": "teacher",
            "subject": "Math"
        }),
    )["userId"]
        .as_str()
        .expect("userId")
        .to_string();
    let student = request_ok(
        stdin,
        reader,
        "s2",
        "students.create",
        json!({ "name": "Eva Luz", "gradeLabel": "2nd" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let assignment = request_ok(
        stdin,
        reader,
        "s3",
        "assignments.create",
        json!({ "name": "Homework 1", "kind": "homework" }),
    )["assignmentId"]
        .as_str()
        .expect("assignmentId")
        .to_string();
    Seeded {
        teacher,
        student,
        assignment,
    }
}

#[test]
fn out_of_range_values_are_rejected() {
    let workspace = temp_dir("gradebook-validation-range");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    for (i, bad) in [json!(0.5), json!(5.1), json!(-1.0), json!("four")]
        .iter()
        .enumerate()
    {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("{}", i + 1),
            "grades.updateCell",
            json!({
                "studentId": seeded.student,
                "assignmentId": seeded.assignment,
                "teacherId": seeded.teacher,
                "trimester": "1T",
                "value": bad
            }),
        );
        assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
        assert_eq!(error_code(&resp), "bad_params", "value {}", bad);
    }

    // The boundaries themselves are accepted.
    for (i, good) in [json!(1.0), json!(5.0)].iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.updateCell",
            json!({
                "studentId": seeded.student,
                "assignmentId": seeded.assignment,
                "teacherId": seeded.teacher,
                "trimester": "1T",
                "value": good
            }),
        );
    }

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn unknown_references_are_not_found() {
    let workspace = temp_dir("gradebook-validation-refs");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "grades.updateCell",
        json!({
            "studentId": "missing",
            "assignmentId": seeded.assignment,
            "teacherId": seeded.teacher,
            "trimester": "1T",
            "value": 3.0
        }),
    );
    assert_eq!(error_code(&resp), "not_found");

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "grades.updateCell",
        json!({
            "studentId": seeded.student,
            "assignmentId": seeded.assignment,
            "teacherId": seeded.teacher,
            "trimester": "9T",
            "value": 3.0
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn bulk_update_reports_per_edit_diagnostics() {
    let workspace = temp_dir("gradebook-validation-bulk");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.bulkUpdate",
        json!({
            "teacherId": seeded.teacher,
            "trimester": "1T",
            "edits": [
                { "studentId": seeded.student, "assignmentId": seeded.assignment, "value": 4.2 },
                { "studentId": seeded.student, "assignmentId": seeded.assignment, "value": 9.0 },
                { "studentId": "missing", "assignmentId": seeded.assignment, "value": 3.0 },
                { "assignmentId": seeded.assignment, "value": 3.0 }
            ]
        }),
    );

    assert_eq!(result["updated"].as_u64(), Some(1));
    assert_eq!(result["rejected"].as_u64(), Some(3));
    let errors = result["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[0]["index"].as_i64(), Some(1));
    assert_eq!(errors[0]["code"].as_str(), Some("bad_params"));
    assert_eq!(errors[1]["code"].as_str(), Some("not_found"));
    assert_eq!(errors[2]["code"].as_str(), Some("bad_params"));

    // The valid edit landed.
    let avg = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "averages.trimester",
        json!({
            "studentId": seeded.student,
            "teacherId": seeded.teacher,
            "trimester": "1T"
        }),
    );
    assert_eq!(avg["average"].as_f64(), Some(4.2));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn bulk_update_rejects_oversized_payloads() {
    let workspace = temp_dir("gradebook-validation-bulk-limit");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed(&mut stdin, &mut reader);

    let edits: Vec<serde_json::Value> = (0..5001)
        .map(|_| {
            json!({
                "studentId": seeded.student,
                "assignmentId": seeded.assignment,
                "value": 3.0
            })
        })
        .collect();

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.bulkUpdate",
        json!({
            "teacherId": seeded.teacher,
            "trimester": "1T",
            "edits": edits
        }),
    );
    assert_eq!(result["updated"].as_u64(), Some(0));
    assert_eq!(result["limitExceeded"].as_bool(), Some(true));
    assert_eq!(result["rejected"].as_u64(), Some(5001));

    drop(stdin);
    let _ = child.wait();
}
