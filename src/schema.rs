//! Payload shape validators used by the producer pipeline.

use serde_json::Value;

/// Outcome of a validation pass. Validators never fail; they report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.into()],
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    /// All errors joined into one human-readable reason.
    pub fn reason(&self) -> String {
        self.errors.join("; ")
    }
}

pub trait SchemaValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> ValidationResult;

    fn name(&self) -> &str;
}

/// Accepts string payloads whose length (in characters) is within bounds.
#[derive(Debug, Clone, Default)]
pub struct StringSchema {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
}

impl StringSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_length(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }
}

impl SchemaValidator for StringSchema {
    fn validate(&self, payload: &Value) -> ValidationResult {
        let Value::String(text) = payload else {
            return ValidationResult::invalid("payload must be a string");
        };

        let len = text.chars().count();
        let mut errors = Vec::new();
        if let Some(min) = self.min_length {
            if len < min {
                errors.push(format!("payload length {} is below minimum {}", len, min));
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                errors.push(format!("payload length {} exceeds maximum {}", len, max));
            }
        }
        ValidationResult::from_errors(errors)
    }

    fn name(&self) -> &str {
        "string"
    }
}

/// Accepts structured JSON payloads.
///
/// Objects and arrays pass as-is; a string payload must itself contain
/// well-formed JSON. Optional `required_fields` must be present at the top
/// level of the (parsed) object.
#[derive(Debug, Clone, Default)]
pub struct JsonSchema {
    pub required_fields: Vec<String>,
}

impl JsonSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }
}

impl SchemaValidator for JsonSchema {
    fn validate(&self, payload: &Value) -> ValidationResult {
        let parsed;
        let document = match payload {
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(value) => {
                    parsed = value;
                    &parsed
                }
                Err(e) => return ValidationResult::invalid(format!("payload is not valid JSON: {}", e)),
            },
            Value::Object(_) | Value::Array(_) => payload,
            _ => return ValidationResult::invalid("payload must be a JSON object or array"),
        };

        if self.required_fields.is_empty() {
            return ValidationResult::valid();
        }

        let Value::Object(map) = document else {
            return ValidationResult::invalid("payload must be a JSON object");
        };

        let errors = self
            .required_fields
            .iter()
            .filter(|field| map.get(field.as_str()).map_or(true, Value::is_null))
            .map(|field| format!("missing required field '{}'", field))
            .collect();
        ValidationResult::from_errors(errors)
    }

    fn name(&self) -> &str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_schema_bounds() {
        let schema = StringSchema::new().min_length(2).max_length(5);

        assert!(schema.validate(&json!("abc")).is_valid);
        assert!(!schema.validate(&json!("a")).is_valid);
        assert!(!schema.validate(&json!("abcdef")).is_valid);
        assert!(!schema.validate(&json!(42)).is_valid);
    }

    #[test]
    fn test_json_schema_well_formedness() {
        let schema = JsonSchema::new();

        assert!(schema.validate(&json!({"a": 1})).is_valid);
        assert!(schema.validate(&json!([1, 2])).is_valid);
        assert!(schema.validate(&json!(r#"{"a": 1}"#)).is_valid);
        assert!(!schema.validate(&json!("{not json")).is_valid);
        assert!(!schema.validate(&json!(3)).is_valid);
    }

    #[test]
    fn test_json_schema_required_fields() {
        let schema = JsonSchema::new().require("id").require("type");

        assert!(schema.validate(&json!({"id": 1, "type": "a"})).is_valid);

        let result = schema.validate(&json!({"id": 1, "type": null}));
        assert!(!result.is_valid);
        assert_eq!(result.reason(), "missing required field 'type'");
    }
}
