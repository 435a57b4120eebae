use serde_json::Value;

use crate::types::HealthError;

/// Interprets the body of a health endpoint.
pub trait ResponseCheck: Send + Sync {
    fn evaluate(&self, body: &str) -> Result<(), HealthError>;
}

impl<F> ResponseCheck for F
where
    F: Fn(&str) -> Result<(), HealthError> + Send + Sync,
{
    fn evaluate(&self, body: &str) -> Result<(), HealthError> {
        self(body)
    }
}

/// Body, trimmed of whitespace, must be exactly `ok`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimmedOk;

impl ResponseCheck for TrimmedOk {
    fn evaluate(&self, body: &str) -> Result<(), HealthError> {
        if body.trim_matches(|c| c == ' ' || c == '\r' || c == '\n') != "ok" {
            return Err(HealthError::Body(body.to_string()));
        }
        Ok(())
    }
}

/// Body is a JSON object whose `field` must equal `expected`. Booleans and
/// numbers are compared by their JSON text, so `true` and `"true"` both match
/// an expectation of `"true"`.
#[derive(Debug, Clone)]
pub struct JsonField {
    pub field: String,
    pub expected: String,
}

impl JsonField {
    pub fn new(field: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
        }
    }
}

impl ResponseCheck for JsonField {
    fn evaluate(&self, body: &str) -> Result<(), HealthError> {
        let payload: Value =
            serde_json::from_str(body).map_err(|e| HealthError::Payload(e.to_string()))?;

        let actual = match payload.get(&self.field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => {
                return Err(HealthError::Payload(format!(
                    "field '{}' missing in {}",
                    self.field, body
                )))
            }
            Some(other) => other.to_string(),
        };

        if actual != self.expected {
            return Err(HealthError::Body(format!(
                "{} = {} (want {})",
                self.field, actual, self.expected
            )));
        }
        Ok(())
    }
}
