use crate::calc;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{
    bad_params, db_conn, ensure_exists, parse_nullable_string_max, parse_string_max, patch_obj,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::info;
use uuid::Uuid;

const CLASS_NAME_MAX: usize = 120;
const CLASS_META_MAX: usize = 64;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.academic_year,
           c.education_level,
           c.grade_level,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1) AS student_count,
           (SELECT COUNT(*) FROM disciplines d WHERE d.class_id = c.id) AS discipline_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let academic_year: Option<String> = row.get(2)?;
            let education_level: Option<String> = row.get(3)?;
            let grade_level: Option<String> = row.get(4)?;
            let student_count: i64 = row.get(5)?;
            let discipline_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "academicYear": academic_year,
                "educationLevel": education_level,
                "gradeLevel": grade_level,
                "studentCount": student_count,
                "disciplineCount": discipline_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn optional_meta(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) => parse_nullable_string_max(v, key, CLASS_META_MAX).map_err(|m| bad_params(req, m)),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let name = match req.params.get("name") {
        Some(v) => match parse_string_max(v, "name", CLASS_NAME_MAX) {
            Ok(s) => s,
            Err(m) => return bad_params(req, m),
        },
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let mut meta = Vec::with_capacity(3);
    for key in ["academicYear", "educationLevel", "gradeLevel"] {
        match optional_meta(req, key) {
            Ok(v) => meta.push(v),
            Err(e) => return e,
        }
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, academic_year, education_level, grade_level)
         VALUES(?, ?, ?, ?, ?)",
        (&class_id, &name, &meta[0], &meta[1], &meta[2]),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    info!(class = %class_id, name = %name, "class created");
    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match patch_obj(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (k, v) in patch {
        let column = match k.as_str() {
            "name" => {
                let name = match parse_string_max(v, k, CLASS_NAME_MAX) {
                    Ok(s) => s,
                    Err(m) => return bad_params(req, m),
                };
                if name.is_empty() {
                    return err(&req.id, "bad_params", "name must not be empty", None);
                }
                binds.push(Value::Text(name));
                "name"
            }
            "academicYear" | "educationLevel" | "gradeLevel" => {
                let parsed = match parse_nullable_string_max(v, k, CLASS_META_MAX) {
                    Ok(s) => s,
                    Err(m) => return bad_params(req, m),
                };
                binds.push(parsed.map(Value::Text).unwrap_or(Value::Null));
                match k.as_str() {
                    "academicYear" => "academic_year",
                    "educationLevel" => "education_level",
                    _ => "grade_level",
                }
            }
            _ => return bad_params(req, format!("unknown class field: {}", k)),
        };
        sets.push(column);
    }
    if sets.is_empty() {
        return ok(&req.id, json!({ "ok": true }));
    }

    let sql = format!(
        "UPDATE classes SET {} WHERE id = ?",
        sets.iter()
            .map(|c| format!("{} = ?", c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    binds.push(Value::Text(class_id));
    if let Err(e) = conn.execute(&sql, params_from_iter(binds)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }

    // Disciplines, components, students, grades and mandatory rows cascade.
    if let Err(e) = conn.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    info!(class = %class_id, "class deleted");
    ok(&req.id, json!({ "ok": true }))
}

fn handle_mandatory_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }

    let disciplines = match calc::load_disciplines(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let configured = match calc::load_mandatory_ids(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let effective = calc::effective_mandatory(&disciplines, &configured);
    let effective_rows: Vec<serde_json::Value> = disciplines
        .iter()
        .filter(|d| effective.contains(&d.id))
        .map(|d| json!({ "id": d.id, "name": d.name }))
        .collect();

    ok(
        &req.id,
        json!({
            "configured": configured,
            "usingFallback": configured.is_empty(),
            "effective": effective_rows
        }),
    )
}

fn handle_mandatory_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw_ids) = req.params.get("disciplineIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing disciplineIds[]", None);
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }

    let disciplines = match calc::load_disciplines(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let mut ids: BTreeSet<String> = BTreeSet::new();
    for (i, v) in raw_ids.iter().enumerate() {
        let Some(id) = v.as_str() else {
            return bad_params(req, format!("disciplineIds[{}] must be string", i));
        };
        if !disciplines.iter().any(|d| d.id == id) {
            return err(
                &req.id,
                "bad_params",
                "discipline does not belong to class",
                Some(json!({ "disciplineId": id })),
            );
        }
        ids.insert(id.to_string());
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM class_mandatory_disciplines WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "class_mandatory_disciplines" })),
        );
    }
    for id in &ids {
        if let Err(e) = tx.execute(
            "INSERT INTO class_mandatory_disciplines(class_id, discipline_id) VALUES(?, ?)",
            (&class_id, id),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "class_mandatory_disciplines" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "count": ids.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        "classes.mandatory.get" => Some(handle_mandatory_get(state, req)),
        "classes.mandatory.set" => Some(handle_mandatory_set(state, req)),
        _ => None,
    }
}
