use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, group_student_ids, optional_str, required_str, required_trimester, student_exists,
    teacher_exists,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_averages_trimester(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let trimester = match required_trimester(&req.params, "trimester") {
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

    let book = match calc::load_grade_book(conn, Some(&teacher_id)) {
        Ok(b) => b,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let average = calc::trimester_average(&book, &student_id, &teacher_id, trimester);
    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "trimester": trimester.as_str(),
            "average": average,
            "passed": calc::has_passed(average)
        }),
    )
}

/// Roster for the stats/summary surfaces: the whole school list, or one
/// group's students when `groupId` is given.
fn roster_student_ids(
    conn: &rusqlite::Connection,
    req: &Request,
    book: &calc::GradeBook,
) -> Result<Vec<String>, serde_json::Value> {
    match optional_str(&req.params, "groupId") {
        Some(gid) => group_student_ids(conn, &gid).map_err(|e| e.response(&req.id)),
        None => Ok(book.students.iter().map(|s| s.id.clone()).collect()),
    }
}

fn handle_averages_final(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let book = match calc::load_grade_book(conn, Some(&teacher_id)) {
        Ok(b) => b,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let roster = match roster_student_ids(conn, req, &book) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let rows: Vec<calc::StudentAverages> = book
        .students
        .iter()
        .filter(|s| roster.contains(&s.id))
        .map(|s| calc::student_averages(&book, s, &teacher_id))
        .collect();

    ok(&req.id, json!({ "teacherId": teacher_id, "students": rows }))
}

fn handle_averages_approval_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let book = match calc::load_grade_book(conn, Some(&teacher_id)) {
        Ok(b) => b,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let roster = match roster_student_ids(conn, req, &book) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let stats = calc::approval_stats(&book, roster.iter().map(|s| s.as_str()), &teacher_id);
    ok(&req.id, json!(stats))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "averages.trimester" => Some(handle_averages_trimester(state, req)),
        "averages.final" => Some(handle_averages_final(state, req)),
        "averages.approvalStats" => Some(handle_averages_approval_stats(state, req)),
        _ => None,
    }
}
