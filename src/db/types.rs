//! SQLite row to JSON conversion.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies the declared column type
//! 2. A decoder per category extracts the value, falling back to probing the
//!    runtime value when the declaration says nothing useful

use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo};

/// Logical category for column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Text,
    Binary,
    Json,
    Unknown,
}

/// Classify a SQLite declared type name into a logical category.
///
/// Follows SQLite's affinity rules loosely: anything containing "int" is an
/// integer, "char"/"clob"/"text" is text, "blob" is binary, "real"/"floa"/
/// "doub"/"numeric"/"decimal" is a float.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.contains("int") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("real")
        || lower.contains("floa")
        || lower.contains("doub")
        || lower.contains("numeric")
        || lower.contains("decimal")
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("clob") || lower.contains("text") {
        return TypeCategory::Text;
    }

    // "NULL" for expressions without a declared type, dates, etc.
    TypeCategory::Unknown
}

/// Encode binary data as a base64 JSON string.
pub fn binary_to_json(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    JsonValue::String(STANDARD.encode(bytes))
}

/// Column names of a row, in order.
pub fn column_names(row: &SqliteRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// Convert a row into a JSON object keyed by column name.
pub fn row_to_json(row: &SqliteRow) -> serde_json::Map<String, JsonValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let category = categorize_type(col.type_info().name());
            (col.name().to_string(), decode_column(row, idx, category))
        })
        .collect()
}

fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Boolean => decode_boolean(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Binary => decode_binary(row, idx),
        TypeCategory::Json => decode_json(row, idx),
        TypeCategory::Text => decode_text(row, idx),
        TypeCategory::Unknown => decode_any(row, idx),
    }
}

fn decode_integer(row: &SqliteRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<i64>, _>(idx) {
        Ok(Some(v)) => JsonValue::Number(v.into()),
        Ok(None) => JsonValue::Null,
        Err(_) => decode_any(row, idx),
    }
}

fn decode_boolean(row: &SqliteRow, idx: usize) -> JsonValue {
    row.try_get::<Option<bool>, _>(idx)
        .ok()
        .flatten()
        .map(JsonValue::Bool)
        .unwrap_or(JsonValue::Null)
}

fn decode_float(row: &SqliteRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<f64>, _>(idx) {
        Ok(Some(v)) => float_to_json(v),
        Ok(None) => JsonValue::Null,
        Err(_) => decode_any(row, idx),
    }
}

fn decode_binary(row: &SqliteRow, idx: usize) -> JsonValue {
    row.try_get::<Option<Vec<u8>>, _>(idx)
        .ok()
        .flatten()
        .map(|v| binary_to_json(&v))
        .unwrap_or(JsonValue::Null)
}

fn decode_json(row: &SqliteRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(Some(v)) => serde_json::from_str(&v).unwrap_or(JsonValue::String(v)),
        Ok(None) => JsonValue::Null,
        Err(_) => decode_any(row, idx),
    }
}

fn decode_text(row: &SqliteRow, idx: usize) -> JsonValue {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(Some(v)) => JsonValue::String(v),
        Ok(None) => JsonValue::Null,
        Err(_) => decode_any(row, idx),
    }
}

/// Probe the runtime value when the declared type is unknown or lied.
fn decode_any(row: &SqliteRow, idx: usize) -> JsonValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(float_to_json).unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(JsonValue::String).unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(|b| binary_to_json(&b)).unwrap_or(JsonValue::Null);
    }
    JsonValue::Null
}

fn float_to_json(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}
