use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_iso, optional_str, required_str, student_exists, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, grade_label, schedule, sort_order
         FROM students
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let grade_label: String = row.get(2)?;
            let schedule: Option<String> = row.get(3)?;
            let sort_order: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "gradeLabel": grade_label,
                "schedule": schedule,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let name = match required_str(&req.params, "name") {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        Ok(_) => return err(&req.id, "bad_params", "name must not be empty", None),
        Err(e) => return e.response(&req.id),
    };
    let grade_label = match required_str(&req.params, "gradeLabel") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let schedule = optional_str(&req.params, "schedule");

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, name, grade_label, schedule, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&student_id, &name, &grade_label, &schedule, next_sort, now_iso()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id, "name": name }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_id = match required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let existing: Option<(String, String, Option<String>)> = match conn
        .query_row(
            "SELECT name, grade_label, schedule FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((cur_name, cur_grade, cur_schedule)) = existing else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let name = optional_str(&req.params, "name").unwrap_or(cur_name);
    if name.trim().is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let grade_label = optional_str(&req.params, "gradeLabel").unwrap_or(cur_grade);
    let schedule = match req.params.get("schedule") {
        Some(v) if v.is_null() => None,
        Some(v) => v.as_str().map(|s| s.to_string()),
        None => cur_schedule,
    };

    if let Err(e) = conn.execute(
        "UPDATE students SET name = ?, grade_label = ?, schedule = ?, updated_at = ? WHERE id = ?",
        (&name, &grade_label, &schedule, now_iso(), &student_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn delete_student_rows(conn: &rusqlite::Connection, student_id: &str) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Dependent rows first; no ON DELETE CASCADE in the schema.
    for (table, sql) in [
        ("grade_entries", "DELETE FROM grade_entries WHERE student_id = ?"),
        (
            "attendance_records",
            "DELETE FROM attendance_records WHERE student_id = ?",
        ),
        (
            "discipline_records",
            "DELETE FROM discipline_records WHERE student_id = ?",
        ),
        ("group_students", "DELETE FROM group_students WHERE student_id = ?"),
        // Parent accounts exist to follow one student; they go with it.
        ("users", "DELETE FROM users WHERE role = 'parent' AND student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ] {
        tx.execute(sql, [student_id]).map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": table }))
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_id = match required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    }

    if let Err(e) = delete_student_rows(conn, &student_id) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
