//! Dotted field-path lookups into JSON payloads.

use serde_json::Value;
use tracing::trace;

/// Walks `path` (e.g. `"user.profile.email"`) through `record`.
///
/// Returns `None` when any segment is missing or when a segment or the
/// final value is `null`. Numeric segments index into arrays.
pub fn resolve<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;

    for part in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };

        match next {
            Some(Value::Null) | None => {
                trace!("Field '{}' not found in record", part);
                return None;
            }
            Some(value) => current = value,
        }
    }

    Some(current)
}

/// Renders a resolved value as a plain string: strings are taken verbatim,
/// everything else uses its JSON text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
