use crate::calc::{self, CalculationSettings};
use crate::classify::PolicyBook;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_bool, parse_f64_range, parse_i64_range, parse_string_max};
use crate::ipc::types::{AppState, Request};
use crate::resolve::MissingValuePolicy;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::info;

const FINAL_CODES_MAX: usize = 8;

#[derive(Clone, Copy)]
enum SetupSection {
    Classification,
    Calculation,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "classification" => Some(Self::Classification),
            "calculation" => Some(Self::Calculation),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Classification => calc::CLASSIFICATION_SETTINGS_KEY,
            Self::Calculation => calc::CALCULATION_SETTINGS_KEY,
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Classification => json!(PolicyBook::default()),
        SetupSection::Calculation => json!(CalculationSettings::default()),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

/// Thresholds follow whatever scale the components use.
fn parse_threshold(v: &Value, key: &str) -> Result<f64, String> {
    parse_f64_range(v, key, -calc::GRADE_SCALE_LIMIT, calc::GRADE_SCALE_LIMIT)
}

/// Validates one policy field. `Ok(None)` means "unset" (only for patches).
fn parse_policy_field(k: &str, v: &Value, is_patch: bool) -> Result<Option<Value>, String> {
    if v.is_null() && is_patch {
        return Ok(None);
    }
    let parsed = match k {
        "passThreshold" => Value::from(parse_threshold(v, k)?),
        "disciplineThresholds" => {
            let obj = v
                .as_object()
                .ok_or_else(|| format!("{} must be an object", k))?;
            let mut out = Map::new();
            for (id, t) in obj {
                out.insert(id.clone(), Value::from(parse_threshold(t, id)?));
            }
            Value::Object(out)
        }
        "maxConditionalFailures" => Value::from(parse_i64_range(v, k, 0, 20)?),
        "minAttendancePct" => {
            if v.is_null() {
                Value::Null
            } else {
                Value::from(parse_f64_range(v, k, 0.0, 100.0)?)
            }
        }
        "attendanceOutcome" => {
            let s = parse_string_max(v, k, 16)?.to_ascii_lowercase();
            if s != "fail" && s != "conditional" {
                return Err("attendanceOutcome must be one of: fail, conditional".into());
            }
            Value::String(s)
        }
        "requireAllGrades" => Value::Bool(parse_bool(v, k)?),
        _ => return Err(format!("unknown policy field: {}", k)),
    };
    Ok(Some(parsed))
}

fn merge_policy(target: &mut Map<String, Value>, patch: &Value, is_patch: bool, path: &str) -> Result<(), String> {
    let patch = patch
        .as_object()
        .ok_or_else(|| format!("{} must be an object", path))?;
    for (k, v) in patch {
        match parse_policy_field(k, v, is_patch)? {
            Some(parsed) => {
                target.insert(k.clone(), parsed);
            }
            None => {
                target.remove(k);
            }
        }
    }
    Ok(())
}

/// `{label: patch | null}`; `null` drops the label.
fn merge_policy_map(target: &mut Value, patch: &Value, path: &str) -> Result<(), String> {
    let patch = patch
        .as_object()
        .ok_or_else(|| format!("{} must be an object", path))?;
    if !target.is_object() {
        *target = json!({});
    }
    let target = as_object_mut(target)?;
    for (label, entry) in patch {
        let label_key = label.trim().to_string();
        if label_key.is_empty() {
            return Err(format!("{} labels must not be empty", path));
        }
        if entry.is_null() {
            target.remove(&label_key);
            continue;
        }
        let slot = target
            .entry(label_key.clone())
            .or_insert_with(|| json!({}));
        let slot = as_object_mut(slot)?;
        merge_policy(slot, entry, true, &format!("{}.{}", path, label_key))?;
    }
    Ok(())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Classification => match k.as_str() {
                "default" => {
                    let slot = obj.entry(k.clone()).or_insert_with(|| json!({}));
                    merge_policy(as_object_mut(slot)?, v, false, k)?;
                }
                "byEducationLevel" | "byGradeLevel" => {
                    let slot = obj.entry(k.clone()).or_insert_with(|| json!({}));
                    merge_policy_map(slot, v, k)?;
                }
                _ => return Err(format!("unknown classification field: {}", k)),
            },
            SetupSection::Calculation => match k.as_str() {
                "missingValuePolicy" => {
                    let s = parse_string_max(v, k, 16)?;
                    if MissingValuePolicy::parse(&s).is_none() {
                        return Err("missingValuePolicy must be one of: treatAsZero, skip".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "finalCodes" => {
                    let items = v
                        .as_array()
                        .ok_or_else(|| "finalCodes must be an array".to_string())?;
                    if items.is_empty() || items.len() > FINAL_CODES_MAX {
                        return Err(format!("finalCodes must have 1..={} entries", FINAL_CODES_MAX));
                    }
                    let mut codes: Vec<Value> = Vec::with_capacity(items.len());
                    for item in items {
                        let code = parse_string_max(item, "finalCodes[]", 16)?.to_uppercase();
                        if code.is_empty() {
                            return Err("finalCodes entries must not be empty".into());
                        }
                        codes.push(Value::String(code));
                    }
                    obj.insert(k.clone(), Value::Array(codes));
                }
                _ => return Err(format!("unknown calculation field: {}", k)),
            },
        }
    }

    // The merged value must still load as the typed settings.
    let check = match section {
        SetupSection::Classification => serde_json::from_value::<PolicyBook>(current.clone()).map(|_| ()),
        SetupSection::Calculation => {
            serde_json::from_value::<CalculationSettings>(current.clone()).map(|_| ())
        }
    };
    check.map_err(|e| format!("invalid {} settings: {}", section.key(), e))
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut base = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let (Some(base_obj), Some(saved_obj)) = (base.as_object_mut(), saved.as_object()) {
            for (k, v) in saved_obj {
                base_obj.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(base)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classification = match load_section(conn, SetupSection::Classification) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let calculation = match load_section(conn, SetupSection::Calculation) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "classification": classification,
            "calculation": calculation
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section_raw, "settings updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
