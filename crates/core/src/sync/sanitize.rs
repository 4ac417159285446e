//! Payload sanitization for staged mutations.
//!
//! Callers frequently echo cached rows back through forms, so payloads can
//! arrive carrying local metadata and stringified array/number fields. The
//! sanitizer strips the former and normalizes the latter per the entity's
//! descriptor before anything is queued for the remote service.

use serde_json::{Map, Value};

use crate::errors::{Error, Result};

use super::EntityDescriptor;

/// Local metadata keys that must never reach the remote service. Both the
/// storage column names and the camelCase forms a serialized [`LocalRecord`]
/// carries, since forms often echo serialized records back verbatim.
///
/// [`LocalRecord`]: super::LocalRecord
pub const LOCAL_META_FIELDS: [&str; 14] = [
    "local_key",
    "has_pending_writes",
    "pending_action",
    "last_local_change",
    "sync_error",
    "scope_key",
    "queue_id",
    "localKey",
    "hasPendingWrites",
    "pendingAction",
    "lastLocalChange",
    "syncError",
    "scopeKey",
    "queueId",
];

/// Sanitize a staged payload: requires a JSON object, strips local metadata,
/// and normalizes array/number fields named by the descriptor.
pub fn sanitize_payload(descriptor: &EntityDescriptor, payload: &Value) -> Result<Value> {
    let object = payload.as_object().ok_or_else(|| {
        Error::validation(format!(
            "{} payload must be a JSON object",
            descriptor.entity.as_str()
        ))
    })?;

    let mut sanitized = Map::with_capacity(object.len());
    for (key, value) in object {
        if LOCAL_META_FIELDS.contains(&key.as_str()) {
            continue;
        }
        sanitized.insert(key.clone(), value.clone());
    }

    for field in descriptor.array_fields {
        if let Some(value) = sanitized.get_mut(*field) {
            *value = normalize_array(value.clone());
        }
    }
    for field in descriptor.number_fields {
        if let Some(value) = sanitized.get_mut(*field) {
            *value = normalize_number(value.clone());
        }
    }

    Ok(Value::Object(sanitized))
}

fn normalize_array(value: Value) -> Value {
    match value {
        Value::Array(_) => value,
        Value::Null => Value::Array(Vec::new()),
        Value::String(text) => {
            // Forms sometimes submit arrays as JSON text or comma lists.
            if let Ok(parsed @ Value::Array(_)) = serde_json::from_str::<Value>(&text) {
                return parsed;
            }
            let items = text
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect();
            Value::Array(items)
        }
        other => Value::Array(vec![other]),
    }
}

fn normalize_number(value: Value) -> Value {
    match value {
        Value::Number(_) | Value::Null => value,
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                return Value::from(int);
            }
            if let Ok(float) = trimmed.parse::<f64>() {
                if let Some(number) = serde_json::Number::from_f64(float) {
                    return Value::Number(number);
                }
            }
            Value::Null
        }
        _ => Value::Null,
    }
}
