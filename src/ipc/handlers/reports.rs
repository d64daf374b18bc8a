use crate::calc;
use crate::ipc::error::{calc_err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn parse_filters(req: &Request) -> Result<calc::PautaFilters, serde_json::Value> {
    calc::parse_pauta_filters(req.params.get("filters")).map_err(|e| calc_err(&req.id, e))
}

fn handle_pauta_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filters = match parse_filters(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let ctx = calc::CalcContext {
        conn,
        class_id: &class_id,
    };
    match calc::compute_pauta(&ctx, &filters) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_pauta_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filters = calc::PautaFilters {
        student_id: Some(student_id),
        include_inactive: true,
    };

    let ctx = calc::CalcContext {
        conn,
        class_id: &class_id,
    };
    let model = match calc::compute_pauta(&ctx, &filters) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    ok(
        &req.id,
        json!({
            "class": model.class,
            "generatedAt": model.generated_at,
            "policy": model.policy,
            "disciplines": model.disciplines,
            "student": model.students.first(),
            "issues": model.issues
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "pauta.generate" => Some(handle_pauta_generate(state, req)),
        "pauta.student" => Some(handle_pauta_student(state, req)),
        _ => None,
    }
}
