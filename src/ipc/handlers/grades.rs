use crate::calc::{self, GRADE_MAX, GRADE_MIN};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    assignment_exists, db_conn, group_student_ids, now_iso, optional_str, required_str,
    required_trimester, student_exists, teacher_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const GRADES_BULK_UPDATE_MAX_EDITS: usize = 5000;

/// A grade write is either a clear (null) or a number inside the grading
/// scale. Out-of-range values are rejected outright; silently clamping them
/// would skew every downstream average.
fn resolve_grade_value(raw: Option<&serde_json::Value>) -> Result<Option<f64>, HandlerErr> {
    let Some(v) = raw else {
        return Err(HandlerErr::bad_params("missing value (number or null)"));
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(value) = v.as_f64() else {
        return Err(HandlerErr::bad_params("value must be a number or null"));
    };
    if !(GRADE_MIN..=GRADE_MAX).contains(&value) {
        return Err(HandlerErr::with_details(
            "bad_params",
            format!("value must be between {} and {}", GRADE_MIN, GRADE_MAX),
            json!({ "value": value }),
        ));
    }
    Ok(Some(value))
}

fn check_entry_refs(
    conn: &Connection,
    student_id: &str,
    assignment_id: &str,
    teacher_id: &str,
) -> Result<(), HandlerErr> {
    if !student_exists(conn, student_id)? {
        return Err(HandlerErr::with_details(
            "not_found",
            "student not found",
            json!({ "studentId": student_id }),
        ));
    }
    if !assignment_exists(conn, assignment_id)? {
        return Err(HandlerErr::with_details(
            "not_found",
            "assignment not found",
            json!({ "assignmentId": assignment_id }),
        ));
    }
    if !teacher_exists(conn, teacher_id)? {
        return Err(HandlerErr::with_details(
            "not_found",
            "teacher not found",
            json!({ "teacherId": teacher_id }),
        ));
    }
    Ok(())
}

fn upsert_entry(
    conn: &Connection,
    student_id: &str,
    assignment_id: &str,
    teacher_id: &str,
    trimester: &str,
    value: Option<f64>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO grade_entries(student_id, assignment_id, teacher_id, trimester, value, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, assignment_id, teacher_id, trimester) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        (student_id, assignment_id, teacher_id, trimester, value, now_iso()),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "grade_entries" }),
        )
    })?;
    Ok(())
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let trimester = match required_trimester(&req.params, "trimester") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match teacher_exists(conn, &teacher_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return e.response(&req.id),
    }

    let roster_filter = match optional_str(&req.params, "groupId") {
        Some(gid) => match group_student_ids(conn, &gid) {
            Ok(ids) => Some(ids),
            Err(e) => return e.response(&req.id),
        },
        None => None,
    };

    let book = match calc::load_grade_book(conn, Some(&teacher_id)) {
        Ok(b) => b,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let rows: Vec<serde_json::Value> = book
        .students
        .iter()
        .filter(|s| {
            roster_filter
                .as_ref()
                .map(|ids| ids.contains(&s.id))
                .unwrap_or(true)
        })
        .map(|s| {
            let values: Vec<Option<f64>> = book
                .assignments
                .iter()
                .map(|a| book.value_of(&s.id, &a.id, &teacher_id, trimester))
                .collect();
            let average = calc::trimester_average(&book, &s.id, &teacher_id, trimester);
            json!({
                "studentId": s.id,
                "name": s.name,
                "gradeLabel": s.grade_label,
                "values": values,
                "average": average,
                "passed": calc::has_passed(average)
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "trimester": trimester.as_str(),
            "assignments": book.assignments,
            "rows": rows
        }),
    )
}

fn handle_grades_update_cell(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_id = match required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let assignment_id = match required_str(&req.params, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let teacher_id = match required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let trimester = match required_trimester(&req.params, "trimester") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let value = match resolve_grade_value(req.params.get("value")) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Err(e) = check_entry_refs(conn, &student_id, &assignment_id, &teacher_id) {
        return e.response(&req.id);
    }
    if let Err(e) = upsert_entry(
        conn,
        &student_id,
        &assignment_id,
        &teacher_id,
        trimester.as_str(),
        value,
    ) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_grades_bulk_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let teacher_id = match required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let trimester = match required_trimester(&req.params, "trimester") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits[]", None);
    };

    if edits_arr.len() > GRADES_BULK_UPDATE_MAX_EDITS {
        let rejected = edits_arr.len();
        return ok(
            &req.id,
            json!({
                "ok": true,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_edits",
                    "message": format!(
                        "bulk payload exceeds max edits: {} > {}",
                        rejected, GRADES_BULK_UPDATE_MAX_EDITS
                    )
                }]
            }),
        );
    }

    match teacher_exists(conn, &teacher_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return e.response(&req.id),
    }

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, edit) in edits_arr.iter().enumerate() {
        let Some(obj) = edit.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("edit at index {} must be an object", i),
            }));
            continue;
        };

        let student_id = match obj.get("studentId").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => {
                errors.push(json!({
                    "index": i,
                    "code": "bad_params",
                    "message": format!("edit at index {} missing studentId", i),
                }));
                continue;
            }
        };
        let assignment_id = match obj.get("assignmentId").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => {
                errors.push(json!({
                    "index": i,
                    "code": "bad_params",
                    "message": format!("edit at index {} missing assignmentId", i),
                }));
                continue;
            }
        };

        let value = match resolve_grade_value(obj.get("value")) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };

        if let Err(e) = check_entry_refs(conn, &student_id, &assignment_id, &teacher_id) {
            errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            }));
            continue;
        }

        match upsert_entry(
            conn,
            &student_id,
            &assignment_id,
            &teacher_id,
            trimester.as_str(),
            value,
        ) {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let rejected = errors.len();
    let mut result = json!({ "ok": true, "updated": updated });
    if rejected > 0 {
        let obj = result.as_object_mut().expect("result should be object");
        obj.insert("rejected".into(), json!(rejected));
        obj.insert("errors".into(), json!(errors));
    }

    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.get" => Some(handle_grades_get(state, req)),
        "grades.updateCell" => Some(handle_grades_update_cell(state, req)),
        "grades.bulkUpdate" => Some(handle_grades_bulk_update(state, req)),
        _ => None,
    }
}
