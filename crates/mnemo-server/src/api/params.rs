//! Parameter merging and time parsing
//!
//! Several GET endpoints accept parameters both as query strings and as a
//! JSON body (GET-with-body is supported); body values win. Time bounds
//! arrive either as RFC 3339 timestamps or as bare `YYYY-MM-DD` dates.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Merge query params and an optional JSON body into one object.
///
/// Body keys override query keys, mirroring "body is the preferred method".
pub fn merge_params(query: HashMap<String, String>, body: &[u8]) -> Map<String, Value> {
    let mut merged: Map<String, Value> = query
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    if !body.is_empty() {
        if let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(body) {
            for (key, value) in object {
                merged.insert(key, value);
            }
        }
    }
    merged
}

/// Fetch a string parameter
pub fn get_str(params: &Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Fetch an unsigned integer parameter (accepts numbers and numeric strings)
pub fn get_usize(params: &Map<String, Value>, key: &str) -> Option<usize> {
    match params.get(key) {
        Some(Value::Number(n)) => n.as_u64().map(|v| v as usize),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Fetch a float parameter
pub fn get_f32(params: &Map<String, Value>, key: &str) -> Option<f32> {
    match params.get(key) {
        Some(Value::Number(n)) => n.as_f64().map(|v| v as f32),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Fetch a string-list parameter (JSON array or comma-separated string)
pub fn get_str_list(params: &Map<String, Value>, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => {
            s.split(',').map(|part| part.trim().to_string()).collect()
        }
        _ => Vec::new(),
    }
}

/// Parse a time bound into epoch milliseconds.
///
/// Accepts RFC 3339 timestamps and bare dates; a bare date maps to the
/// start of the day, or the end of it when `is_end` is set, so date-only
/// ranges stay closed on both sides.
pub fn parse_time_bound(value: &str, is_end: bool) -> Option<i64> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Some(timestamp.with_timezone(&Utc).timestamp_millis());
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let time = if is_end {
        date.and_hms_milli_opt(23, 59, 59, 999)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Some(time.and_utc().timestamp_millis())
}

// ============================================================================
// TESTS
// ============================================================================
