use crate::calc;
use crate::export;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str, required_trimester, teacher_exists};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

fn handle_export_grades_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let trimester = match required_trimester(&req.params, "trimester") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let teacher_id = optional_str(&req.params, "teacherId");
    if let Some(tid) = &teacher_id {
        match teacher_exists(conn, tid) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
            Err(e) => return e.response(&req.id),
        }
    }

    // All teachers' entries are needed when no filter is given.
    let book = match calc::load_grade_book(conn, teacher_id.as_deref()) {
        Ok(b) => b,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let sheet = export::grades_sheet(&book, teacher_id.as_deref(), trimester);
    ok(&req.id, json!({ "sheet": sheet }))
}

fn handle_export_averages_model(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let sheet = export::averages_sheet(&book, &teacher_id);
    ok(&req.id, json!({ "sheet": sheet }))
}

fn handle_export_write_workbook(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let out_path = match required_str(&req.params, "outPath") {
        Ok(v) => PathBuf::from(v),
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

    // Both sheets come from the same snapshot and the same engine calls the
    // display path uses, so the workbook can never disagree with the UI.
    let sheets = [
        export::grades_sheet(&book, Some(&teacher_id), trimester),
        export::averages_sheet(&book, &teacher_id),
    ];

    match export::write_workbook(&out_path, &sheets) {
        Ok(summary) => {
            info!(
                path = %out_path.to_string_lossy(),
                sheets = summary.sheet_count,
                "workbook written"
            );
            ok(
                &req.id,
                json!({
                    "outPath": out_path.to_string_lossy(),
                    "summary": summary
                }),
            )
        }
        Err(e) => err(&req.id, "io_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "export.gradesModel" => Some(handle_export_grades_model(state, req)),
        "export.averagesModel" => Some(handle_export_averages_model(state, req)),
        "export.writeWorkbook" => Some(handle_export_write_workbook(state, req)),
        _ => None,
    }
}
