use crate::calc::{self, ComponentRow};
use crate::formula::Formula;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{
    bad_params, db_conn, ensure_exists, next_sort_order, parse_bool, parse_f64_range,
    parse_i64_range, parse_string_max, patch_obj, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::resolve::CalcScope;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

const DISCIPLINE_NAME_MAX: usize = 120;
const COMPONENT_CODE_MAX: usize = 16;
const FORMULA_MAX: usize = 500;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl HandlerErr {
    fn bad(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

fn handle_disciplines_list(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT
           d.id,
           d.name,
           d.sort_order,
           (SELECT COUNT(*) FROM components c WHERE c.discipline_id = d.id) AS component_count
         FROM disciplines d
         WHERE d.class_id = ?
         ORDER BY d.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let sort_order: i64 = r.get(2)?;
            let component_count: i64 = r.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "sortOrder": sort_order,
                "componentCount": component_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(disciplines) => ok(&req.id, json!({ "disciplines": disciplines })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn parse_discipline_name(req: &Request, v: &Value) -> Result<String, Value> {
    match parse_string_max(v, "name", DISCIPLINE_NAME_MAX) {
        Ok(s) if !s.is_empty() => Ok(s),
        Ok(_) => Err(err(&req.id, "bad_params", "name must not be empty", None)),
        Err(m) => Err(bad_params(req, m)),
    }
}

fn handle_disciplines_create(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match req.params.get("name") {
        Some(v) => match parse_discipline_name(req, v) {
            Ok(s) => s,
            Err(e) => return e,
        },
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    let sort_order = match next_sort_order(conn, req, "disciplines", "class_id", &class_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let discipline_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO disciplines(id, class_id, name, sort_order) VALUES(?, ?, ?, ?)",
        (&discipline_id, &class_id, &name, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "disciplines" })),
        );
    }
    ok(
        &req.id,
        json!({ "disciplineId": discipline_id, "name": name, "sortOrder": sort_order }),
    )
}

fn handle_disciplines_update(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let discipline_id = match required_str(req, "disciplineId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match patch_obj(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "disciplines", &discipline_id, "discipline") {
        return e;
    }

    for (k, v) in patch {
        let result = match k.as_str() {
            "name" => match parse_discipline_name(req, v) {
                Ok(name) => conn.execute(
                    "UPDATE disciplines SET name = ? WHERE id = ?",
                    (&name, &discipline_id),
                ),
                Err(e) => return e,
            },
            "sortOrder" => match parse_i64_range(v, k, 0, 10_000) {
                Ok(n) => conn.execute(
                    "UPDATE disciplines SET sort_order = ? WHERE id = ?",
                    (n, &discipline_id),
                ),
                Err(m) => return bad_params(req, m),
            },
            _ => return bad_params(req, format!("unknown discipline field: {}", k)),
        };
        if let Err(e) = result {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "disciplines" })),
            );
        }
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_disciplines_delete(state: &mut AppState, req: &Request) -> Value {
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
    if let Err(e) = conn.execute("DELETE FROM disciplines WHERE id = ?", [&discipline_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "disciplines" })),
        );
    }
    ok(&req.id, json!({ "ok": true }))
}

struct ComponentDraft {
    code: String,
    name: String,
    weight: f64,
    trimester: Option<i64>,
    is_calculated: bool,
    formula: Option<String>,
    depends_on: Vec<String>,
    scope: CalcScope,
    scale_min: f64,
    scale_max: f64,
    is_final: bool,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_draft(fields: &Map<String, Value>) -> Result<ComponentDraft, HandlerErr> {
    let null = Value::Null;
    let get = |k: &str| fields.get(k).unwrap_or(&null);

    let code = match fields.get("code") {
        Some(v) => parse_string_max(v, "code", COMPONENT_CODE_MAX)
            .map_err(HandlerErr::bad)?
            .to_uppercase(),
        None => return Err(HandlerErr::bad("missing code")),
    };
    if !is_identifier(&code) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "code must be letters, digits or '_' and start with a letter".to_string(),
            details: Some(json!({ "code": code })),
        });
    }

    let name = match get("name") {
        Value::Null => code.clone(),
        v => {
            let s = parse_string_max(v, "name", DISCIPLINE_NAME_MAX).map_err(HandlerErr::bad)?;
            if s.is_empty() {
                code.clone()
            } else {
                s
            }
        }
    };
    let weight = match get("weight") {
        Value::Null => 0.0,
        v => parse_f64_range(v, "weight", 0.0, 100.0).map_err(HandlerErr::bad)?,
    };
    let trimester = match get("trimester") {
        Value::Null => None,
        v => Some(parse_i64_range(v, "trimester", 1, 3).map_err(HandlerErr::bad)?),
    };
    let is_calculated = match get("isCalculated") {
        Value::Null => false,
        v => parse_bool(v, "isCalculated").map_err(HandlerErr::bad)?,
    };
    let is_final = match get("isFinal") {
        Value::Null => false,
        v => parse_bool(v, "isFinal").map_err(HandlerErr::bad)?,
    };
    let scope = match get("scope") {
        Value::Null => CalcScope::Trimestral,
        v => {
            let s = v.as_str().ok_or_else(|| HandlerErr::bad("scope must be string"))?;
            CalcScope::parse(s)
                .ok_or_else(|| HandlerErr::bad("scope must be one of: trimestral, annual"))?
        }
    };
    let scale_min = match get("scaleMin") {
        Value::Null => 0.0,
        v => parse_f64_range(v, "scaleMin", -calc::GRADE_SCALE_LIMIT, calc::GRADE_SCALE_LIMIT)
            .map_err(HandlerErr::bad)?,
    };
    let scale_max = match get("scaleMax") {
        Value::Null => 20.0,
        v => parse_f64_range(v, "scaleMax", -calc::GRADE_SCALE_LIMIT, calc::GRADE_SCALE_LIMIT)
            .map_err(HandlerErr::bad)?,
    };
    if scale_min >= scale_max {
        return Err(HandlerErr {
            code: "bad_params",
            message: "scaleMin must be below scaleMax".to_string(),
            details: Some(json!({ "scaleMin": scale_min, "scaleMax": scale_max })),
        });
    }

    let formula = match get("formula") {
        Value::Null => None,
        v => {
            let s = parse_string_max(v, "formula", FORMULA_MAX).map_err(HandlerErr::bad)?;
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
    };
    let depends_on = match get("dependsOn") {
        Value::Null => Vec::new(),
        Value::Array(items) => {
            let mut out: Vec<String> = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let Some(id) = item.as_str() else {
                    return Err(HandlerErr::bad(format!("dependsOn[{}] must be string", i)));
                };
                if !out.iter().any(|x| x == id) {
                    out.push(id.to_string());
                }
            }
            out
        }
        _ => return Err(HandlerErr::bad("dependsOn must be an array")),
    };

    if is_calculated && formula.is_none() {
        return Err(HandlerErr::bad("calculated components require a formula"));
    }
    if !is_calculated && (formula.is_some() || !depends_on.is_empty()) {
        return Err(HandlerErr::bad(
            "formula and dependsOn are only allowed on calculated components",
        ));
    }

    Ok(ComponentDraft {
        code,
        name,
        weight,
        trimester,
        is_calculated,
        formula,
        depends_on,
        scope,
        scale_min,
        scale_max,
        is_final,
    })
}

/// Checks a draft against the other components of its discipline.
fn check_draft(
    draft: &ComponentDraft,
    self_id: Option<&str>,
    siblings: &[ComponentRow],
) -> Result<(), HandlerErr> {
    let others: Vec<&ComponentRow> = siblings
        .iter()
        .filter(|c| Some(c.def.id.as_str()) != self_id)
        .collect();

    if others
        .iter()
        .any(|c| c.def.code.eq_ignore_ascii_case(&draft.code) && c.def.trimester == draft.trimester)
    {
        return Err(HandlerErr {
            code: "bad_params",
            message: "component code already used in this trimester".to_string(),
            details: Some(json!({ "code": draft.code, "trimester": draft.trimester })),
        });
    }

    let mut dep_codes: Vec<String> = Vec::with_capacity(draft.depends_on.len());
    for dep_id in &draft.depends_on {
        let Some(dep) = others.iter().find(|c| &c.def.id == dep_id) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "dependency is not a component of this discipline".to_string(),
                details: Some(json!({ "dependsOn": dep_id })),
            });
        };
        if draft.scope == CalcScope::Trimestral && dep.def.trimester != draft.trimester {
            return Err(HandlerErr {
                code: "bad_params",
                message: "trimestral components may only depend on their own trimester"
                    .to_string(),
                details: Some(json!({
                    "dependsOn": dep_id,
                    "trimester": draft.trimester,
                    "dependencyTrimester": dep.def.trimester
                })),
            });
        }
        let dep_code = dep.def.code.trim().to_uppercase();
        if dep_codes.contains(&dep_code) {
            return Err(HandlerErr {
                code: "bad_params",
                message: "two dependencies share the same code".to_string(),
                details: Some(json!({ "code": dep_code, "dependsOn": dep_id })),
            });
        }
        dep_codes.push(dep_code);
    }

    let Some(text) = draft.formula.as_deref() else {
        return Ok(());
    };
    let formula = Formula::parse(text).map_err(|e| HandlerErr {
        code: "invalid_formula",
        message: e.to_string(),
        details: Some(json!({ "formula": text })),
    })?;
    if let Some(target) = formula.target() {
        if target != draft.code {
            return Err(HandlerErr {
                code: "invalid_formula",
                message: "formula target does not match the component code".to_string(),
                details: Some(json!({ "formula": text, "target": target, "code": draft.code })),
            });
        }
    }
    let unknown: Vec<String> = formula
        .variables()
        .into_iter()
        .filter(|v| !dep_codes.contains(v))
        .collect();
    if !unknown.is_empty() {
        return Err(HandlerErr {
            code: "invalid_formula",
            message: "formula reads variables that are not declared dependencies".to_string(),
            details: Some(json!({ "formula": text, "unknownVariables": unknown })),
        });
    }
    Ok(())
}

fn discipline_name(conn: &Connection, discipline_id: &str) -> Result<Option<String>, HandlerErr> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        "SELECT name FROM disciplines WHERE id = ?",
        [discipline_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// Re-checks every component that reads `component_id` against the saved rows.
fn check_dependents(
    conn: &Connection,
    discipline_id: &str,
    component_id: &str,
) -> Result<(), HandlerErr> {
    let rows = calc::load_components(conn, discipline_id).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.message,
        details: None,
    })?;
    for row in rows
        .iter()
        .filter(|c| c.def.depends_on.iter().any(|d| d == component_id))
    {
        let Value::Object(fields) = row.to_json() else {
            continue;
        };
        let checked =
            parse_draft(&fields).and_then(|draft| check_draft(&draft, Some(&row.def.id), &rows));
        if let Err(mut e) = checked {
            e.message = format!("{} (dependent {})", e.message, row.def.code);
            let mut details = match e.details.take() {
                Some(Value::Object(m)) => m,
                _ => Map::new(),
            };
            details.insert("dependent".to_string(), Value::String(row.def.code.clone()));
            e.details = Some(Value::Object(details));
            return Err(e);
        }
    }
    Ok(())
}

/// Stored grades that fall outside `[scale_min, scale_max]`.
fn grades_outside_scale(
    conn: &Connection,
    component_id: &str,
    scale_min: f64,
    scale_max: f64,
) -> Result<Vec<Value>, HandlerErr> {
    let query_err = |e: rusqlite::Error| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    };
    let mut stmt = conn
        .prepare(
            "SELECT student_id, value FROM grades
             WHERE component_id = ? AND (value < ? OR value > ?)",
        )
        .map_err(query_err)?;
    stmt.query_map((component_id, scale_min, scale_max), |r| {
        let student_id: String = r.get(0)?;
        let value: f64 = r.get(1)?;
        Ok(json!({ "studentId": student_id, "value": value }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

/// Rejects the write when the discipline's graph no longer orders.
fn ensure_acyclic(conn: &Connection, discipline_id: &str, name: &str) -> Result<(), calc::CalcError> {
    let rows = calc::load_components(conn, discipline_id)?;
    calc::discipline_plan(discipline_id, name, &rows).map(|_| ())
}

fn handle_components_list(state: &mut AppState, req: &Request) -> Value {
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
    match calc::load_components(conn, &discipline_id) {
        Ok(rows) => {
            let components: Vec<Value> = rows.iter().map(|c| c.to_json()).collect();
            ok(&req.id, json!({ "components": components }))
        }
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_components_create(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let discipline_id = match required_str(req, "disciplineId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(fields) = req.params.as_object() else {
        return err(&req.id, "bad_params", "params must be an object", None);
    };
    let name = match discipline_name(conn, &discipline_id) {
        Ok(Some(n)) => n,
        Ok(None) => return err(&req.id, "not_found", "discipline not found", None),
        Err(e) => return e.response(&req.id),
    };
    let draft = match parse_draft(fields) {
        Ok(d) => d,
        Err(e) => return e.response(&req.id),
    };
    let siblings = match calc::load_components(conn, &discipline_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    if let Err(e) = check_draft(&draft, None, &siblings) {
        return e.response(&req.id);
    }
    let sort_order = match next_sort_order(conn, req, "components", "discipline_id", &discipline_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let component_id = Uuid::new_v4().to_string();
    let depends_json = json!(draft.depends_on).to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO components(id, discipline_id, code, name, weight, trimester, is_calculated,
           formula, depends_on, calc_scope, scale_min, scale_max, is_final, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &component_id,
            &discipline_id,
            &draft.code,
            &draft.name,
            draft.weight,
            draft.trimester,
            draft.is_calculated as i64,
            &draft.formula,
            &depends_json,
            draft.scope.as_str(),
            draft.scale_min,
            draft.scale_max,
            draft.is_final as i64,
            sort_order,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "components" })),
        );
    }
    if let Err(e) = ensure_acyclic(&tx, &discipline_id, &name) {
        let _ = tx.rollback();
        return calc_err(&req.id, e);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(discipline = %name, code = %draft.code, "component created");
    ok(
        &req.id,
        json!({ "componentId": component_id, "code": draft.code, "sortOrder": sort_order }),
    )
}

const COMPONENT_PATCH_FIELDS: [&str; 11] = [
    "code",
    "name",
    "weight",
    "trimester",
    "isCalculated",
    "formula",
    "dependsOn",
    "scope",
    "scaleMin",
    "scaleMax",
    "isFinal",
];

fn handle_components_update(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match patch_obj(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(k) = patch.keys().find(|k| !COMPONENT_PATCH_FIELDS.contains(&k.as_str())) {
        return bad_params(req, format!("unknown component field: {}", k));
    }

    let current = match calc::load_component(conn, &component_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let name = match discipline_name(conn, &current.discipline_id) {
        Ok(Some(n)) => n,
        Ok(None) => return err(&req.id, "not_found", "discipline not found", None),
        Err(e) => return e.response(&req.id),
    };

    let mut merged = match current.to_json() {
        Value::Object(m) => m,
        _ => return err(&req.id, "internal", "component row is not an object", None),
    };
    for (k, v) in patch {
        merged.insert(k.clone(), v.clone());
    }
    let draft = match parse_draft(&merged) {
        Ok(d) => d,
        Err(e) => return e.response(&req.id),
    };
    let siblings = match calc::load_components(conn, &current.discipline_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    if let Err(e) = check_draft(&draft, Some(&component_id), &siblings) {
        return e.response(&req.id);
    }

    let depends_json = json!(draft.depends_on).to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    match grades_outside_scale(&tx, &component_id, draft.scale_min, draft.scale_max) {
        Ok(outside) if outside.is_empty() => {}
        Ok(outside) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "out_of_scale",
                format!("{} stored grades fall outside the new scale", outside.len()),
                Some(json!({
                    "scaleMin": draft.scale_min,
                    "scaleMax": draft.scale_max,
                    "grades": outside
                })),
            );
        }
        Err(e) => {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
    }
    if let Err(e) = tx.execute(
        "UPDATE components SET
           code = ?, name = ?, weight = ?, trimester = ?, is_calculated = ?, formula = ?,
           depends_on = ?, calc_scope = ?, scale_min = ?, scale_max = ?, is_final = ?
         WHERE id = ?",
        (
            &draft.code,
            &draft.name,
            draft.weight,
            draft.trimester,
            draft.is_calculated as i64,
            &draft.formula,
            &depends_json,
            draft.scope.as_str(),
            draft.scale_min,
            draft.scale_max,
            draft.is_final as i64,
            &component_id,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "components" })),
        );
    }
    if let Err(e) = check_dependents(&tx, &current.discipline_id, &component_id) {
        let _ = tx.rollback();
        return e.response(&req.id);
    }
    if let Err(e) = ensure_acyclic(&tx, &current.discipline_id, &name) {
        let _ = tx.rollback();
        return calc_err(&req.id, e);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_components_delete(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current = match calc::load_component(conn, &component_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let siblings = match calc::load_components(conn, &current.discipline_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let dependents: Vec<&str> = siblings
        .iter()
        .filter(|c| c.def.depends_on.iter().any(|d| d == &component_id))
        .map(|c| c.def.code.as_str())
        .collect();
    if !dependents.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "component is used by calculated components",
            Some(json!({ "dependents": dependents })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM components WHERE id = ?", [&component_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "components" })),
        );
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "disciplines.list" => Some(handle_disciplines_list(state, req)),
        "disciplines.create" => Some(handle_disciplines_create(state, req)),
        "disciplines.update" => Some(handle_disciplines_update(state, req)),
        "disciplines.delete" => Some(handle_disciplines_delete(state, req)),
        "components.list" => Some(handle_components_list(state, req)),
        "components.create" => Some(handle_components_create(state, req)),
        "components.update" => Some(handle_components_update(state, req)),
        "components.delete" => Some(handle_components_delete(state, req)),
        _ => None,
    }
}
