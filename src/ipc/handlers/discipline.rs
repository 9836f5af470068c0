use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_str, required_str, student_exists, teacher_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

fn parse_kind(raw: &str) -> Result<&'static str, HandlerErr> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "citation" => Ok("citation"),
        "comment" => Ok("comment"),
        other => Err(HandlerErr::with_details(
            "bad_params",
            "kind must be one of: citation, comment",
            json!({ "kind": other }),
        )),
    }
}

fn parse_status(raw: &str) -> Result<&'static str, HandlerErr> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "pending" => Ok("pending"),
        "resolved" => Ok("resolved"),
        "escalated" => Ok("escalated"),
        other => Err(HandlerErr::with_details(
            "bad_params",
            "status must be one of: pending, resolved, escalated",
            json!({ "status": other }),
        )),
    }
}

fn handle_discipline_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let date = match required_str(&req.params, "date") {
        Ok(v) => {
            if NaiveDate::parse_from_str(&v, "%Y-%m-%d").is_err() {
                return err(
                    &req.id,
                    "bad_params",
                    "date must be an ISO date (YYYY-MM-DD)",
                    Some(json!({ "date": v })),
                );
            }
            v
        }
        Err(e) => return e.response(&req.id),
    };
    let time = match required_str(&req.params, "time") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let kind = match required_str(&req.params, "kind").and_then(|s| parse_kind(&s)) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let description = match required_str(&req.params, "description") {
        Ok(v) if !v.trim().is_empty() => v,
        Ok(_) => return err(&req.id, "bad_params", "description must not be empty", None),
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
        "INSERT INTO discipline_records(id, student_id, teacher_id, date, time, kind,
                                        description, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'pending')",
        (
            &record_id,
            &student_id,
            &teacher_id,
            &date,
            &time,
            kind,
            &description,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "discipline_records" })),
        );
    }

    ok(&req.id, json!({ "recordId": record_id, "status": "pending" }))
}

fn handle_discipline_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_id = optional_str(&req.params, "studentId");
    let from = optional_str(&req.params, "from");
    let to = optional_str(&req.params, "to");

    // Filters are optional and combine; newest entries first.
    let mut sql = String::from(
        "SELECT id, student_id, teacher_id, date, time, kind, description, status
         FROM discipline_records
         WHERE 1 = 1",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(sid) = &student_id {
        sql.push_str(" AND student_id = ?");
        binds.push(sid.clone());
    }
    if let Some(from) = &from {
        sql.push_str(" AND date >= ?");
        binds.push(from.clone());
    }
    if let Some(to) = &to {
        sql.push_str(" AND date <= ?");
        binds.push(to.clone());
    }
    sql.push_str(" ORDER BY date DESC, time DESC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let teacher_id: String = row.get(2)?;
            let date: String = row.get(3)?;
            let time: String = row.get(4)?;
            let kind: String = row.get(5)?;
            let description: String = row.get(6)?;
            let status: String = row.get(7)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "teacherId": teacher_id,
                "date": date,
                "time": time,
                "kind": kind,
                "description": description,
                "status": status
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(records) => ok(&req.id, json!({ "records": records })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_discipline_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let record_id = match required_str(&req.params, "recordId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let status = match required_str(&req.params, "status").and_then(|s| parse_status(&s)) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let changed = match conn.execute(
        "UPDATE discipline_records SET status = ? WHERE id = ?",
        (status, &record_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "discipline record not found", None);
    }

    ok(&req.id, json!({ "recordId": record_id, "status": status }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "discipline.create" => Some(handle_discipline_create(state, req)),
        "discipline.list" => Some(handle_discipline_list(state, req)),
        "discipline.setStatus" => Some(handle_discipline_set_status(state, req)),
        _ => None,
    }
}
