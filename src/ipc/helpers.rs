use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn patch_obj<'a>(req: &'a Request) -> Result<&'a Map<String, Value>, Value> {
    req.params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| err(&req.id, "bad_params", "patch must be an object", None))
}

/// Trimmed string of at most `max_len` chars.
pub fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

/// `null` or blank => `None`.
pub fn parse_nullable_string_max(
    v: &Value,
    key: &str,
    max_len: usize,
) -> Result<Option<String>, String> {
    if v.is_null() {
        return Ok(None);
    }
    let s = parse_string_max(v, key, max_len)?;
    Ok(if s.is_empty() { None } else { Some(s) })
}

pub fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

pub fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

pub fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v.as_f64().ok_or_else(|| format!("{} must be number", key))?;
    if !n.is_finite() || n < min || n > max {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

pub fn bad_params(req: &Request, message: String) -> Value {
    err(&req.id, "bad_params", message, None)
}

/// Fails with `not_found` unless `SELECT 1 FROM {table} WHERE id = ?` matches.
pub fn ensure_exists(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), Value> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let exists: Option<i64> = conn
        .query_row(&sql, [id], |r| r.get(0))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if exists.is_none() {
        return Err(err(
            &req.id,
            "not_found",
            format!("{} not found", what),
            Some(json!({ "id": id })),
        ));
    }
    Ok(())
}

/// Next `sort_order` for rows of `table` under `parent_col = parent_id`.
pub fn next_sort_order(
    conn: &Connection,
    req: &Request,
    table: &str,
    parent_col: &str,
    parent_id: &str,
) -> Result<i64, Value> {
    let sql = format!(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM {} WHERE {} = ?",
        table, parent_col
    );
    conn.query_row(&sql, [parent_id], |r| r.get(0))
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}
