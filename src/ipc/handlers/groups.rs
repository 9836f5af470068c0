use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, group_exists, group_student_ids, required_str, student_exists, teacher_exists,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_groups_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Correlated subqueries keep the counts join-free.
    let mut stmt = match conn.prepare(
        "SELECT
           g.id,
           g.name,
           g.grade_label,
           (SELECT COUNT(*) FROM group_students gs WHERE gs.group_id = g.id) AS student_count,
           (SELECT COUNT(*) FROM group_teachers gt WHERE gt.group_id = g.id) AS teacher_count
         FROM study_groups g
         ORDER BY g.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let grade_label: String = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            let teacher_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "gradeLabel": grade_label,
                "studentCount": student_count,
                "teacherCount": teacher_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(groups) => ok(&req.id, json!({ "groups": groups })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_groups_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let group_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO study_groups(id, name, grade_label) VALUES(?, ?, ?)",
        (&group_id, &name, &grade_label),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "study_groups" })),
        );
    }

    ok(&req.id, json!({ "groupId": group_id, "name": name }))
}

fn handle_groups_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let group_id = match required_str(&req.params, "groupId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let existing: Option<(String, String)> = match conn
        .query_row(
            "SELECT name, grade_label FROM study_groups WHERE id = ?",
            [&group_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((cur_name, cur_grade)) = existing else {
        return err(&req.id, "not_found", "group not found", None);
    };

    let name = req
        .params
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or(cur_name);
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let grade_label = req
        .params
        .get("gradeLabel")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or(cur_grade);

    if let Err(e) = conn.execute(
        "UPDATE study_groups SET name = ?, grade_label = ? WHERE id = ?",
        (&name, &grade_label, &group_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "groupId": group_id }))
}

fn handle_groups_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let group_id = match required_str(&req.params, "groupId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match group_exists(conn, &group_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "group not found", None),
        Err(e) => return e.response(&req.id),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (table, sql) in [
        ("group_students", "DELETE FROM group_students WHERE group_id = ?"),
        ("group_teachers", "DELETE FROM group_teachers WHERE group_id = ?"),
        ("study_groups", "DELETE FROM study_groups WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&group_id]) {
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

fn ids_param(req: &Request, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = req.params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing {}[]", key)));
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, v) in arr.iter().enumerate() {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::bad_params(format!(
                "{}[{}] must be a string",
                key, i
            )));
        };
        out.push(s.to_string());
    }
    Ok(out)
}

fn replace_membership(
    conn: &Connection,
    group_id: &str,
    table: &str,
    column: &str,
    ids: &[String],
) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tx.execute(&format!("DELETE FROM {} WHERE group_id = ?", table), [group_id])
        .map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": table }))
        })?;
    for id in ids {
        tx.execute(
            &format!("INSERT INTO {}(group_id, {}) VALUES(?, ?)", table, column),
            (group_id, id),
        )
        .map_err(|e| {
            HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": table }))
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))
}

fn handle_groups_set_students(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let group_id = match required_str(&req.params, "groupId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match group_exists(conn, &group_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "group not found", None),
        Err(e) => return e.response(&req.id),
    }
    let student_ids = match ids_param(req, "studentIds") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    for sid in &student_ids {
        match student_exists(conn, sid) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "student not found",
                    Some(json!({ "studentId": sid })),
                )
            }
            Err(e) => return e.response(&req.id),
        }
    }

    if let Err(e) = replace_membership(conn, &group_id, "group_students", "student_id", &student_ids)
    {
        return e.response(&req.id);
    }
    ok(&req.id, json!({ "groupId": group_id, "studentCount": student_ids.len() }))
}

fn handle_groups_set_teachers(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let group_id = match required_str(&req.params, "groupId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match group_exists(conn, &group_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "group not found", None),
        Err(e) => return e.response(&req.id),
    }
    let teacher_ids = match ids_param(req, "teacherIds") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    for tid in &teacher_ids {
        match teacher_exists(conn, tid) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "teacher not found",
                    Some(json!({ "teacherId": tid })),
                )
            }
            Err(e) => return e.response(&req.id),
        }
    }

    if let Err(e) = replace_membership(conn, &group_id, "group_teachers", "user_id", &teacher_ids) {
        return e.response(&req.id);
    }
    ok(&req.id, json!({ "groupId": group_id, "teacherCount": teacher_ids.len() }))
}

fn handle_groups_for_teacher(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match teacher_exists(conn, &teacher_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return e.response(&req.id),
    }

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.name, g.grade_label
         FROM study_groups g
         JOIN group_teachers gt ON gt.group_id = g.id
         WHERE gt.user_id = ?
         ORDER BY g.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let groups: Vec<(String, String, String)> = match stmt
        .query_map([&teacher_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut out = Vec::with_capacity(groups.len());
    for (id, name, grade_label) in groups {
        let student_ids = match group_student_ids(conn, &id) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        out.push(json!({
            "id": id,
            "name": name,
            "gradeLabel": grade_label,
            "studentIds": student_ids
        }));
    }

    ok(&req.id, json!({ "groups": out }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "groups.list" => Some(handle_groups_list(state, req)),
        "groups.create" => Some(handle_groups_create(state, req)),
        "groups.update" => Some(handle_groups_update(state, req)),
        "groups.delete" => Some(handle_groups_delete(state, req)),
        "groups.setStudents" => Some(handle_groups_set_students(state, req)),
        "groups.setTeachers" => Some(handle_groups_set_teachers(state, req)),
        "groups.forTeacher" => Some(handle_groups_for_teacher(state, req)),
        _ => None,
    }
}
