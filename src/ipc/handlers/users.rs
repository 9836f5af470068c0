use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_iso, optional_str, required_str, student_exists, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Teacher,
    Parent,
    Director,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Teacher => "teacher",
            UserRole::Parent => "parent",
            UserRole::Director => "director",
            UserRole::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<UserRole> {
        match s.trim().to_ascii_lowercase().as_str() {
            "teacher" => Some(UserRole::Teacher),
            "parent" => Some(UserRole::Parent),
            "director" => Some(UserRole::Director),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }
}

/// Role-tagged account record. Each variant carries only the fields that
/// belong to its role, so a director can never surface a stray `studentId`
/// and a parent never a `subject`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role")]
pub enum UserRecord {
    #[serde(rename = "teacher", rename_all = "camelCase")]
    Teacher {
        id: String,
        name: String,
        email: String,
        status: String,
        subject: String,
    },
    #[serde(rename = "parent", rename_all = "camelCase")]
    Parent {
        id: String,
        name: String,
        email: String,
        status: String,
        student_id: String,
    },
    #[serde(rename = "director", rename_all = "camelCase")]
    Director {
        id: String,
        name: String,
        email: String,
        status: String,
    },
    #[serde(rename = "admin", rename_all = "camelCase")]
    Admin {
        id: String,
        name: String,
        email: String,
        status: String,
    },
}

struct RawUser {
    id: String,
    name: String,
    email: String,
    role: String,
    status: String,
    subject: Option<String>,
    student_id: Option<String>,
}

fn into_record(raw: RawUser) -> Result<UserRecord, HandlerErr> {
    let Some(role) = UserRole::parse(&raw.role) else {
        return Err(HandlerErr::with_details(
            "bad_params",
            "unknown role in store",
            json!({ "userId": raw.id, "role": raw.role }),
        ));
    };
    Ok(match role {
        UserRole::Teacher => UserRecord::Teacher {
            id: raw.id,
            name: raw.name,
            email: raw.email,
            status: raw.status,
            subject: raw.subject.unwrap_or_default(),
        },
        UserRole::Parent => UserRecord::Parent {
            id: raw.id,
            name: raw.name,
            email: raw.email,
            status: raw.status,
            student_id: raw.student_id.unwrap_or_default(),
        },
        UserRole::Director => UserRecord::Director {
            id: raw.id,
            name: raw.name,
            email: raw.email,
            status: raw.status,
        },
        UserRole::Admin => UserRecord::Admin {
            id: raw.id,
            name: raw.name,
            email: raw.email,
            status: raw.status,
        },
    })
}

fn load_users(conn: &Connection, role: Option<UserRole>) -> Result<Vec<UserRecord>, HandlerErr> {
    let sql = "SELECT id, name, email, role, status, subject, student_id
               FROM users
               ORDER BY name";
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let raw: Vec<RawUser> = stmt
        .query_map([], |r| {
            Ok(RawUser {
                id: r.get(0)?,
                name: r.get(1)?,
                email: r.get(2)?,
                role: r.get(3)?,
                status: r.get(4)?,
                subject: r.get(5)?,
                student_id: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut records = Vec::with_capacity(raw.len());
    for row in raw {
        if let Some(want) = role {
            if UserRole::parse(&row.role) != Some(want) {
                continue;
            }
        }
        records.push(into_record(row)?);
    }
    Ok(records)
}

fn parse_status(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let status = optional_str(params, "status").unwrap_or_else(|| "active".to_string());
    match status.as_str() {
        "active" | "inactive" => Ok(status),
        other => Err(HandlerErr::with_details(
            "bad_params",
            "status must be one of: active, inactive",
            json!({ "status": other }),
        )),
    }
}

/// Role-specific columns for an insert/update: (subject, student_id).
/// Fields that do not belong to the role are rejected rather than ignored.
fn role_fields(
    conn: &Connection,
    role: UserRole,
    params: &serde_json::Value,
) -> Result<(Option<String>, Option<String>), HandlerErr> {
    let subject = optional_str(params, "subject");
    let student_id = optional_str(params, "studentId");

    match role {
        UserRole::Teacher => {
            if student_id.is_some() {
                return Err(HandlerErr::bad_params("studentId is not a teacher field"));
            }
            let Some(subject) = subject else {
                return Err(HandlerErr::bad_params("teacher requires subject"));
            };
            Ok((Some(subject), None))
        }
        UserRole::Parent => {
            if subject.is_some() {
                return Err(HandlerErr::bad_params("subject is not a parent field"));
            }
            let Some(student_id) = student_id else {
                return Err(HandlerErr::bad_params("parent requires studentId"));
            };
            if !student_exists(conn, &student_id)? {
                return Err(HandlerErr::with_details(
                    "not_found",
                    "linked student not found",
                    json!({ "studentId": student_id }),
                ));
            }
            Ok((None, Some(student_id)))
        }
        UserRole::Director | UserRole::Admin => {
            if subject.is_some() || student_id.is_some() {
                return Err(HandlerErr::bad_params(format!(
                    "subject/studentId are not {} fields",
                    role.as_str()
                )));
            }
            Ok((None, None))
        }
    }
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let role = match optional_str(&req.params, "role") {
        Some(raw) => match UserRole::parse(&raw) {
            Some(r) => Some(r),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "role must be one of: teacher, parent, director, admin",
                    Some(json!({ "role": raw })),
                )
            }
        },
        None => None,
    };

    match load_users(conn, role) {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let name = match required_str(&req.params, "name") {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        Ok(_) => return err(&req.id, "bad_params", "name must not be empty", None),
        Err(e) => return e.response(&req.id),
    };
    let email = match required_str(&req.params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let role = match required_str(&req.params, "role") {
        Ok(raw) => match UserRole::parse(&raw) {
            Some(r) => r,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "role must be one of: teacher, parent, director, admin",
                    Some(json!({ "role": raw })),
                )
            }
        },
        Err(e) => return e.response(&req.id),
    };
    let status = match parse_status(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let (subject, student_id) = match role_fields(conn, role, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, name, email, role, status, subject, student_id, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &name,
            &email,
            role.as_str(),
            &status,
            &subject,
            &student_id,
            now_iso(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(&req.id, json!({ "userId": user_id, "role": role.as_str() }))
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let user_id = match required_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let existing: Option<(String, String, String, String, Option<String>, Option<String>)> =
        match conn
            .query_row(
                "SELECT name, email, role, status, subject, student_id FROM users WHERE id = ?",
                [&user_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                    ))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let Some((cur_name, cur_email, role_raw, cur_status, cur_subject, cur_student)) = existing
    else {
        return err(&req.id, "not_found", "user not found", None);
    };
    let Some(role) = UserRole::parse(&role_raw) else {
        return err(
            &req.id,
            "bad_params",
            "unknown role in store",
            Some(json!({ "role": role_raw })),
        );
    };

    // The role itself is immutable; changing it would silently re-shape the
    // record. Create a new account instead.
    if req.params.get("role").is_some() {
        return err(&req.id, "bad_params", "role cannot be changed", None);
    }

    let name = optional_str(&req.params, "name").unwrap_or(cur_name);
    let email = optional_str(&req.params, "email").unwrap_or(cur_email);
    let status = match req.params.get("status") {
        Some(_) => match parse_status(&req.params) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        },
        None => cur_status,
    };

    let has_role_fields =
        req.params.get("subject").is_some() || req.params.get("studentId").is_some();
    let (subject, student_id) = if has_role_fields {
        // Re-validate the full role field set against the stored role.
        let merged = json!({
            "subject": req.params.get("subject").cloned()
                .or_else(|| cur_subject.clone().map(serde_json::Value::String)),
            "studentId": req.params.get("studentId").cloned()
                .or_else(|| cur_student.clone().map(serde_json::Value::String)),
        });
        match role_fields(conn, role, &merged) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        }
    } else {
        (cur_subject, cur_student)
    };

    if let Err(e) = conn.execute(
        "UPDATE users SET name = ?, email = ?, status = ?, subject = ?, student_id = ?,
                          updated_at = ?
         WHERE id = ?",
        (&name, &email, &status, &subject, &student_id, now_iso(), &user_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "userId": user_id }))
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let user_id = match required_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "user not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Rows authored by the account go with it; dependency order, no cascade.
    for (table, sql) in [
        ("grade_entries", "DELETE FROM grade_entries WHERE teacher_id = ?"),
        (
            "attendance_records",
            "DELETE FROM attendance_records WHERE teacher_id = ?",
        ),
        (
            "discipline_records",
            "DELETE FROM discipline_records WHERE teacher_id = ?",
        ),
        ("group_teachers", "DELETE FROM group_teachers WHERE user_id = ?"),
        ("users", "DELETE FROM users WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&user_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        _ => None,
    }
}
