use crate::calc::{self, ComponentRow};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, ensure_exists, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

const GRADES_BULK_UPDATE_MAX_EDITS: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GradeWrite {
    Saved,
    Cleared,
}

fn query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

/// `null` clears; anything else must be a finite number.
fn parse_value(v: Option<&serde_json::Value>) -> Result<Option<f64>, HandlerErr> {
    let Some(v) = v else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing value".to_string(),
            details: None,
        });
    };
    if v.is_null() {
        return Ok(None);
    }
    match v.as_f64() {
        Some(n) if n.is_finite() => Ok(Some(n)),
        _ => Err(HandlerErr {
            code: "bad_params",
            message: "value must be number or null".to_string(),
            details: Some(json!({ "value": v })),
        }),
    }
}

fn check_scale(component: &ComponentRow, value: f64) -> Result<(), HandlerErr> {
    if value < component.scale_min || value > component.scale_max {
        return Err(HandlerErr {
            code: "out_of_scale",
            message: format!(
                "{} must be within {}..={}",
                component.def.code, component.scale_min, component.scale_max
            ),
            details: Some(json!({
                "value": value,
                "scaleMin": component.scale_min,
                "scaleMax": component.scale_max
            })),
        });
    }
    Ok(())
}

/// Student and component must exist and belong to the same class.
fn resolve_target(
    conn: &Connection,
    student_id: &str,
    component_id: &str,
) -> Result<ComponentRow, HandlerErr> {
    let component = calc::load_component(conn, component_id).map_err(|e| HandlerErr {
        code: if e.code == "not_found" {
            "not_found"
        } else {
            "db_query_failed"
        },
        message: e.message,
        details: Some(json!({ "componentId": component_id })),
    })?;
    if component.def.is_calculated {
        return Err(HandlerErr {
            code: "bad_params",
            message: "calculated components cannot be entered directly".to_string(),
            details: Some(json!({ "componentId": component_id, "code": component.def.code })),
        });
    }

    let student_class: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    let Some(student_class) = student_class else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: Some(json!({ "studentId": student_id })),
        });
    };
    let discipline_class: String = conn
        .query_row(
            "SELECT class_id FROM disciplines WHERE id = ?",
            [&component.discipline_id],
            |r| r.get(0),
        )
        .map_err(query_err)?;
    if student_class != discipline_class {
        return Err(HandlerErr {
            code: "bad_params",
            message: "student and component belong to different classes".to_string(),
            details: Some(json!({ "studentId": student_id, "componentId": component_id })),
        });
    }
    Ok(component)
}

fn write_grade(
    conn: &Connection,
    student_id: &str,
    component_id: &str,
    value: Option<f64>,
) -> Result<GradeWrite, HandlerErr> {
    let component = resolve_target(conn, student_id, component_id)?;
    let Some(value) = value else {
        conn.execute(
            "DELETE FROM grades WHERE student_id = ? AND component_id = ?",
            (student_id, component_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "grades" })),
        })?;
        return Ok(GradeWrite::Cleared);
    };
    check_scale(&component, value)?;

    let grade_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO grades(id, student_id, component_id, trimester, value, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, component_id) DO UPDATE SET
           trimester = excluded.trimester,
           value = excluded.value,
           updated_at = excluded.updated_at",
        (
            &grade_id,
            student_id,
            component_id,
            component.def.trimester,
            value,
            &now,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;
    debug!(student = %student_id, component = %component.def.code, value, "grade saved");
    Ok(GradeWrite::Saved)
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let discipline_id = match required_str(req, "disciplineId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "disciplines", &discipline_id, "discipline") {
        return e;
    }

    let components = match calc::load_components(conn, &discipline_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let mut stmt = match conn.prepare(
        "SELECT g.student_id, g.component_id, g.value, g.updated_at
         FROM grades g
         JOIN components c ON c.id = g.component_id
         JOIN students s ON s.id = g.student_id
         WHERE c.discipline_id = ?
         ORDER BY s.sort_order, c.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&discipline_id], |r| {
            let student_id: String = r.get(0)?;
            let component_id: String = r.get(1)?;
            let value: f64 = r.get(2)?;
            let updated_at: Option<String> = r.get(3)?;
            Ok(json!({
                "studentId": student_id,
                "componentId": component_id,
                "value": value,
                "updatedAt": updated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(grades) => ok(
            &req.id,
            json!({
                "components": components.iter().map(|c| c.to_json()).collect::<Vec<_>>(),
                "grades": grades
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let value = match parse_value(req.params.get("value")) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match write_grade(conn, &student_id, &component_id, value) {
        Ok(GradeWrite::Saved) => ok(&req.id, json!({ "ok": true, "cleared": false })),
        Ok(GradeWrite::Cleared) => ok(&req.id, json!({ "ok": true, "cleared": true })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_grades_bulk_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
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

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut updated: usize = 0;
    let mut cleared: usize = 0;
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
        let student_id = obj.get("studentId").and_then(|v| v.as_str());
        let component_id = obj.get("componentId").and_then(|v| v.as_str());
        let (Some(student_id), Some(component_id)) = (student_id, component_id) else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("edit at index {} missing studentId/componentId", i),
            }));
            continue;
        };

        let result =
            parse_value(obj.get("value")).and_then(|v| write_grade(&tx, student_id, component_id, v));
        match result {
            Ok(GradeWrite::Saved) => updated += 1,
            Ok(GradeWrite::Cleared) => cleared += 1,
            Err(e) => {
                let mut entry = json!({
                    "index": i,
                    "studentId": student_id,
                    "componentId": component_id,
                    "code": e.code,
                    "message": e.message,
                });
                if let Some(d) = e.details {
                    entry["details"] = d;
                }
                errors.push(entry);
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let mut result = json!({ "ok": true, "updated": updated, "cleared": cleared });
    if !errors.is_empty() {
        result["rejected"] = json!(errors.len());
        result["errors"] = json!(errors);
    }
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.get" => Some(handle_grades_get(state, req)),
        "grades.set" => Some(handle_grades_set(state, req)),
        "grades.bulkUpdate" => Some(handle_grades_bulk_update(state, req)),
        _ => None,
    }
}
