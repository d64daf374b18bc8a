use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, db_conn, ensure_exists, next_sort_order, parse_bool, parse_f64_range,
    parse_nullable_string_max, parse_string_max, patch_obj, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;
use uuid::Uuid;

const FULL_NAME_MAX: usize = 160;

fn parse_attendance(v: &serde_json::Value, key: &str) -> Result<Option<f64>, String> {
    if v.is_null() {
        return Ok(None);
    }
    parse_f64_range(v, key, 0.0, 100.0).map(Some)
}

fn parse_gender(v: &serde_json::Value, key: &str) -> Result<Option<String>, String> {
    Ok(parse_nullable_string_max(v, key, 16)?.map(|s| s.to_uppercase()))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut stmt = match conn.prepare(
        "SELECT id, process_no, full_name, gender, attendance_pct, active, sort_order, updated_at
         FROM students
         WHERE class_id = ? AND (active = 1 OR ?)
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&class_id, include_inactive), |r| {
            let id: String = r.get(0)?;
            let process_no: Option<String> = r.get(1)?;
            let full_name: String = r.get(2)?;
            let gender: Option<String> = r.get(3)?;
            let attendance_pct: Option<f64> = r.get(4)?;
            let active: i64 = r.get(5)?;
            let sort_order: i64 = r.get(6)?;
            let updated_at: Option<String> = r.get(7)?;
            Ok(json!({
                "id": id,
                "processNo": process_no,
                "fullName": full_name,
                "gender": gender,
                "attendancePct": attendance_pct,
                "active": active != 0,
                "sortOrder": sort_order,
                "updatedAt": updated_at
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
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let full_name = match req.params.get("fullName") {
        Some(v) => match parse_string_max(v, "fullName", FULL_NAME_MAX) {
            Ok(s) if !s.is_empty() => s,
            Ok(_) => return err(&req.id, "bad_params", "fullName must not be empty", None),
            Err(m) => return bad_params(req, m),
        },
        None => return err(&req.id, "bad_params", "missing fullName", None),
    };
    let null = serde_json::Value::Null;
    let process_no = match parse_nullable_string_max(
        req.params.get("processNo").unwrap_or(&null),
        "processNo",
        32,
    ) {
        Ok(v) => v,
        Err(m) => return bad_params(req, m),
    };
    let gender = match parse_gender(req.params.get("gender").unwrap_or(&null), "gender") {
        Ok(v) => v,
        Err(m) => return bad_params(req, m),
    };
    let attendance_pct =
        match parse_attendance(req.params.get("attendancePct").unwrap_or(&null), "attendancePct") {
            Ok(v) => v,
            Err(m) => return bad_params(req, m),
        };

    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    let sort_order = match next_sort_order(conn, req, "students", "class_id", &class_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, process_no, full_name, gender, attendance_pct, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &student_id,
            &class_id,
            &process_no,
            &full_name,
            &gender,
            attendance_pct,
            sort_order,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "sortOrder": sort_order }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match patch_obj(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "students", &student_id, "student") {
        return e;
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (k, v) in patch {
        let parsed: Result<(&'static str, Value), String> = match k.as_str() {
            "fullName" => parse_string_max(v, k, FULL_NAME_MAX).and_then(|s| {
                if s.is_empty() {
                    Err("fullName must not be empty".to_string())
                } else {
                    Ok(("full_name", Value::Text(s)))
                }
            }),
            "processNo" => parse_nullable_string_max(v, k, 32)
                .map(|s| ("process_no", s.map(Value::Text).unwrap_or(Value::Null))),
            "gender" => parse_gender(v, k)
                .map(|s| ("gender", s.map(Value::Text).unwrap_or(Value::Null))),
            "attendancePct" => parse_attendance(v, k)
                .map(|n| ("attendance_pct", n.map(Value::Real).unwrap_or(Value::Null))),
            "active" => parse_bool(v, k).map(|b| ("active", Value::Integer(b as i64))),
            _ => Err(format!("unknown student field: {}", k)),
        };
        match parsed {
            Ok((column, value)) => {
                sets.push(column);
                binds.push(value);
            }
            Err(m) => return bad_params(req, m),
        }
    }
    if sets.is_empty() {
        return ok(&req.id, json!({ "ok": true }));
    }

    let sql = format!(
        "UPDATE students SET {}, updated_at = ? WHERE id = ?",
        sets.iter()
            .map(|c| format!("{} = ?", c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    binds.push(Value::Text(chrono::Utc::now().to_rfc3339()));
    binds.push(Value::Text(student_id));
    if let Err(e) = conn.execute(&sql, params_from_iter(binds)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "students", &student_id, "student") {
        return e;
    }
    if let Err(e) = conn.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    ok(&req.id, json!({ "ok": true }))
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
