use rusqlite::Connection;
use serde_json::json;

use crate::calc::{ActivityKind, Trimester};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

/// Handler-level failure carried until a response can be built with the
/// request id.
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn bad_params(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("bad_params", message)
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn required_trimester(params: &serde_json::Value, key: &str) -> Result<Trimester, HandlerErr> {
    let raw = required_str(params, key)?;
    Trimester::parse(&raw).ok_or_else(|| {
        HandlerErr::with_details(
            "bad_params",
            "trimester must be one of: 1T, 2T, 3T",
            json!({ "trimester": raw }),
        )
    })
}

pub fn required_activity_kind(
    params: &serde_json::Value,
    key: &str,
) -> Result<ActivityKind, HandlerErr> {
    let raw = required_str(params, key)?;
    ActivityKind::parse(&raw).ok_or_else(|| {
        HandlerErr::with_details(
            "bad_params",
            "kind must be one of: homework, partial, exam",
            json!({ "kind": raw }),
        )
    })
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn row_exists(
    conn: &Connection,
    sql: &str,
    id: &str,
) -> Result<bool, HandlerErr> {
    use rusqlite::OptionalExtension;
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    row_exists(conn, "SELECT 1 FROM students WHERE id = ?", student_id)
}

pub fn teacher_exists(conn: &Connection, user_id: &str) -> Result<bool, HandlerErr> {
    row_exists(
        conn,
        "SELECT 1 FROM users WHERE id = ? AND role = 'teacher'",
        user_id,
    )
}

pub fn assignment_exists(conn: &Connection, assignment_id: &str) -> Result<bool, HandlerErr> {
    row_exists(conn, "SELECT 1 FROM assignments WHERE id = ?", assignment_id)
}

pub fn group_exists(conn: &Connection, group_id: &str) -> Result<bool, HandlerErr> {
    row_exists(conn, "SELECT 1 FROM study_groups WHERE id = ?", group_id)
}

/// Student ids belonging to a group, in roster order.
pub fn group_student_ids(conn: &Connection, group_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id
             FROM group_students gs
             JOIN students s ON s.id = gs.student_id
             WHERE gs.group_id = ?
             ORDER BY s.sort_order",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map([group_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}
