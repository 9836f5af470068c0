use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str, student_exists, teacher_exists, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

fn parse_status(raw: &str) -> Result<&'static str, HandlerErr> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "present" => Ok("present"),
        "absent" => Ok("absent"),
        "late" => Ok("late"),
        other => Err(HandlerErr::with_details(
            "bad_params",
            "status must be one of: present, absent, late",
            json!({ "status": other }),
        )),
    }
}

/// Dates travel as ISO `YYYY-MM-DD`; stored as TEXT so range filters are
/// plain string comparisons.
fn parse_date(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| {
        HandlerErr::with_details(
            "bad_params",
            format!("{} must be an ISO date (YYYY-MM-DD)", key),
            json!({ key: raw }),
        )
    })?;
    Ok(raw)
}

fn handle_attendance_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_id = match required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let teacher_id = match required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let date = match parse_date(&req.params, "date") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let status = match required_str(&req.params, "status").and_then(|s| parse_status(&s)) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    }
    match teacher_exists(conn, &teacher_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return e.response(&req.id),
    }

    let record_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO attendance_records(id, date, student_id, teacher_id, status)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(date, student_id, teacher_id) DO UPDATE SET
           status = excluded.status",
        (&record_id, &date, &student_id, &teacher_id, status),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_records" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_attendance_for_date(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let date = match parse_date(&req.params, "date") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT student_id, status
         FROM attendance_records
         WHERE teacher_id = ? AND date = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&teacher_id, &date), |row| {
            let student_id: String = row.get(0)?;
            let status: String = row.get(1)?;
            Ok(json!({ "studentId": student_id, "status": status }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(records) => ok(&req.id, json!({ "date": date, "records": records })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn range_rows(
    conn: &Connection,
    teacher_id: &str,
    from: &str,
    to: &str,
) -> Result<Vec<(String, String, String)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT date, student_id, status
             FROM attendance_records
             WHERE teacher_id = ? AND date >= ? AND date <= ?
             ORDER BY date",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map((teacher_id, from, to), |r| {
        Ok((r.get(0)?, r.get(1)?, r.get(2)?))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_attendance_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let from = match parse_date(&req.params, "from") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let to = match parse_date(&req.params, "to") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let rows = match range_rows(conn, &teacher_id, &from, &to) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Newest day first, matching the history view.
    let mut by_date: BTreeMap<String, (i64, i64, i64)> = BTreeMap::new();
    for (date, _, status) in &rows {
        let counts = by_date.entry(date.clone()).or_insert((0, 0, 0));
        match status.as_str() {
            "present" => counts.0 += 1,
            "absent" => counts.1 += 1,
            "late" => counts.2 += 1,
            _ => {}
        }
    }

    let days: Vec<serde_json::Value> = by_date
        .into_iter()
        .rev()
        .map(|(date, (present, absent, late))| {
            let total = present + absent + late;
            let present_percentage = if total > 0 {
                present as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            json!({
                "date": date,
                "presentCount": present,
                "absentCount": absent,
                "lateCount": late,
                "total": total,
                "presentPercentage": present_percentage
            })
        })
        .collect();

    ok(&req.id, json!({ "days": days }))
}

fn handle_attendance_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let from = match parse_date(&req.params, "from") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let to = match parse_date(&req.params, "to") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut students_stmt = match conn.prepare(
        "SELECT id, name FROM students ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students: Vec<(String, String)> = match students_stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = match range_rows(conn, &teacher_id, &from, &to) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut per_student: BTreeMap<&str, (i64, i64, i64)> = BTreeMap::new();
    for (_, student_id, status) in &rows {
        let counts = per_student.entry(student_id.as_str()).or_insert((0, 0, 0));
        match status.as_str() {
            "present" => counts.0 += 1,
            "absent" => counts.1 += 1,
            "late" => counts.2 += 1,
            _ => {}
        }
    }

    let stats: Vec<serde_json::Value> = students
        .iter()
        .map(|(id, name)| {
            let (present, absent, late) = per_student.get(id.as_str()).copied().unwrap_or((0, 0, 0));
            let total = present + absent + late;
            let percentage = if total > 0 {
                present as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            json!({
                "studentId": id,
                "studentName": name,
                "present": present,
                "absent": absent,
                "late": late,
                "percentage": percentage
            })
        })
        .collect();

    ok(&req.id, json!({ "stats": stats }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(handle_attendance_mark(state, req)),
        "attendance.forDate" => Some(handle_attendance_for_date(state, req)),
        "attendance.history" => Some(handle_attendance_history(state, req)),
        "attendance.stats" => Some(handle_attendance_stats(state, req)),
        _ => None,
    }
}
