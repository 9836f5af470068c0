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

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn start(workspace: &PathBuf) -> Sidecar {
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Sidecar {
            child,
            stdin,
            reader,
            next_id: 0,
        };
        s.request_ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
        s
    }

    fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = format!("{}", self.next_id);
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn request_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    fn create_teacher(&mut self, name: &str, subject: &str) -> String {
        let res = self.request_ok(
            "users.create",
            json!({
                "name": name,
                "email": format!("{}@school.test", name.to_lowercase().replace(' ', ".")),
                "role": "teacher",
                "subject": subject
            }),
        );
        res["userId"].as_str().expect("userId").to_string()
    }

    fn create_student(&mut self, name: &str, grade_label: &str) -> String {
        let res = self.request_ok(
            "students.create",
            json!({ "name": name, "gradeLabel": grade_label }),
        );
        res["studentId"].as_str().expect("studentId").to_string()
    }

    fn create_assignment(&mut self, name: &str, kind: &str) -> String {
        let res = self.request_ok(
            "assignments.create",
            json!({ "name": name, "kind": kind }),
        );
        res["assignmentId"].as_str().expect("assignmentId").to_string()
    }

    fn set_grade(
        &mut self,
        student_id: &str,
        assignment_id: &str,
        teacher_id: &str,
        trimester: &str,
        value: serde_json::Value,
    ) {
        self.request_ok(
            "grades.updateCell",
            json!({
                "studentId": student_id,
                "assignmentId": assignment_id,
                "teacherId": teacher_id,
                "trimester": trimester,
                "value": value
            }),
        );
    }

    fn shutdown(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

#[test]
fn trimester_average_weights_by_activity_kind() {
    let workspace = temp_dir("gradebook-averages-weighting");
    let mut s = Sidecar::start(&workspace);

    let teacher = s.create_teacher("Prof Rios", "Math");
    let student = s.create_student("Maria Ada", "5th");
    let hw = s.create_assignment("Homework 1", "homework");
    let exam = s.create_assignment("Term Exam", "exam");

    s.set_grade(&student, &hw, &teacher, "1T", json!(2.0));
    s.set_grade(&student, &exam, &teacher, "1T", json!(4.0));

    // (2*1 + 4*3) / (1+3) = 3.5
    let res = s.request_ok(
        "averages.trimester",
        json!({ "studentId": student, "teacherId": teacher, "trimester": "1T" }),
    );
    assert_eq!(res["average"].as_f64(), Some(3.5));
    assert_eq!(res["passed"].as_bool(), Some(true));

    s.shutdown();
}

#[test]
fn trimester_average_ignores_cleared_cells_and_empty_scope_is_zero() {
    let workspace = temp_dir("gradebook-averages-nulls");
    let mut s = Sidecar::start(&workspace);

    let teacher = s.create_teacher("Prof Vega", "Science");
    let student = s.create_student("Juan Soto", "4th");
    let hw = s.create_assignment("Homework 1", "homework");
    let partial = s.create_assignment("Partial 1", "partial");

    s.set_grade(&student, &hw, &teacher, "1T", json!(4.0));
    s.set_grade(&student, &partial, &teacher, "1T", json!(2.0));
    // Clearing the partial removes it from both sides of the division.
    s.set_grade(&student, &partial, &teacher, "1T", serde_json::Value::Null);

    let res = s.request_ok(
        "averages.trimester",
        json!({ "studentId": student, "teacherId": teacher, "trimester": "1T" }),
    );
    assert_eq!(res["average"].as_f64(), Some(4.0));

    // A scope with no graded entries reports exactly 0.0, not an error.
    let res = s.request_ok(
        "averages.trimester",
        json!({ "studentId": student, "teacherId": teacher, "trimester": "2T" }),
    );
    assert_eq!(res["average"].as_f64(), Some(0.0));
    assert_eq!(res["passed"].as_bool(), Some(false));

    s.shutdown();
}

#[test]
fn final_average_truncates_and_counts_empty_trimesters() {
    let workspace = temp_dir("gradebook-averages-final");
    let mut s = Sidecar::start(&workspace);

    let teacher = s.create_teacher("Prof Lema", "History");
    let student = s.create_student("Rosa Mena", "6th");
    let hw = s.create_assignment("Homework 1", "homework");

    // T1 = 3.5, T2 = 3.5, T3 = 3.4 -> mean 3.4666... -> truncated to 3.4.
    s.set_grade(&student, &hw, &teacher, "1T", json!(3.5));
    s.set_grade(&student, &hw, &teacher, "2T", json!(3.5));
    s.set_grade(&student, &hw, &teacher, "3T", json!(3.4));

    let res = s.request_ok("averages.final", json!({ "teacherId": teacher }));
    let rows = res["students"].as_array().expect("students");
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row["t1"].as_f64(), Some(3.5));
    assert_eq!(row["t2"].as_f64(), Some(3.5));
    assert_eq!(row["t3"].as_f64(), Some(3.4));
    assert_eq!(row["finalAverage"].as_f64(), Some(3.4));
    assert_eq!(row["passed"].as_bool(), Some(true));

    // Clear T2/T3: they contribute 0.0 each, so 3.5 / 3 -> 1.1 truncated.
    s.set_grade(&student, &hw, &teacher, "2T", serde_json::Value::Null);
    s.set_grade(&student, &hw, &teacher, "3T", serde_json::Value::Null);
    let res = s.request_ok("averages.final", json!({ "teacherId": teacher }));
    let row = &res["students"].as_array().expect("students")[0];
    assert_eq!(row["finalAverage"].as_f64(), Some(1.1));
    assert_eq!(row["passed"].as_bool(), Some(false));

    s.shutdown();
}

#[test]
fn approval_stats_over_a_ten_student_roster() {
    let workspace = temp_dir("gradebook-averages-stats");
    let mut s = Sidecar::start(&workspace);

    let teacher = s.create_teacher("Prof Diaz", "English");
    let hw = s.create_assignment("Homework 1", "homework");

    // 7 students pass with 4.0 across the year, 3 fail with 2.0.
    for i in 0..10 {
        let student = s.create_student(&format!("Student {}", i), "5th");
        let value = if i < 7 { 4.0 } else { 2.0 };
        for trimester in ["1T", "2T", "3T"] {
            s.set_grade(&student, &hw, &teacher, trimester, json!(value));
        }
    }

    let stats = s.request_ok("averages.approvalStats", json!({ "teacherId": teacher }));
    assert_eq!(stats["totalStudents"].as_u64(), Some(10));
    assert_eq!(stats["approvedStudents"].as_u64(), Some(7));
    assert_eq!(stats["failedStudents"].as_u64(), Some(3));
    assert_eq!(stats["approvalPercentage"].as_f64(), Some(70.0));
    assert_eq!(stats["failurePercentage"].as_f64(), Some(30.0));

    s.shutdown();
}

#[test]
fn approval_stats_on_empty_group_reports_zero_percent() {
    let workspace = temp_dir("gradebook-averages-empty");
    let mut s = Sidecar::start(&workspace);

    let teacher = s.create_teacher("Prof Sol", "Art");
    let group = s.request_ok(
        "groups.create",
        json!({ "name": "7-A", "gradeLabel": "7th" }),
    );
    let group_id = group["groupId"].as_str().expect("groupId");

    let stats = s.request_ok(
        "averages.approvalStats",
        json!({ "teacherId": teacher, "groupId": group_id }),
    );
    assert_eq!(stats["totalStudents"].as_u64(), Some(0));
    assert_eq!(stats["approvalPercentage"].as_f64(), Some(0.0));
    assert_eq!(stats["failurePercentage"].as_f64(), Some(0.0));

    s.shutdown();
}

#[test]
fn grades_get_reflects_last_write() {
    let workspace = temp_dir("gradebook-averages-grid");
    let mut s = Sidecar::start(&workspace);

    let teacher = s.create_teacher("Prof Paz", "Music");
    let student = s.create_student("Leo Gil", "3rd");
    let hw = s.create_assignment("Homework 1", "homework");

    s.set_grade(&student, &hw, &teacher, "1T", json!(2.5));
    // Overwrite in place: last write wins, no history.
    s.set_grade(&student, &hw, &teacher, "1T", json!(4.5));

    let grid = s.request_ok(
        "grades.get",
        json!({ "teacherId": teacher, "trimester": "1T" }),
    );
    let rows = grid["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["values"][0].as_f64(), Some(4.5));
    assert_eq!(rows[0]["average"].as_f64(), Some(4.5));

    s.shutdown();
}
