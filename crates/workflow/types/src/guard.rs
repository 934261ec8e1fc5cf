//! Guard conditions on transitions
//!
//! Guards are plain data so templates can be supplied as configuration.
//! Field paths are dotted (`customer.tier`) and resolve into the event
//! payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A predicate that must hold for a transition to commit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Guard {
    /// Payload field exists and is not null
    FieldPresent { field: String },
    /// Payload field equals a JSON value
    FieldEquals { field: String, value: Value },
    /// Numeric payload field is >= `min`
    FieldAtLeast { field: String, min: f64 },
    /// Numeric payload field is <= `max`
    FieldAtMost { field: String, max: f64 },
    /// Instance metadata key equals a value
    MetadataEquals { key: String, value: String },
    All { guards: Vec<Guard> },
    Any { guards: Vec<Guard> },
    Not { guard: Box<Guard> },
}

impl Guard {
    pub fn field_present(field: impl Into<String>) -> Self {
        Self::FieldPresent {
            field: field.into(),
        }
    }

    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn field_at_least(field: impl Into<String>, min: f64) -> Self {
        Self::FieldAtLeast {
            field: field.into(),
            min,
        }
    }

    pub fn field_at_most(field: impl Into<String>, max: f64) -> Self {
        Self::FieldAtMost {
            field: field.into(),
            max,
        }
    }

    /// Evaluate the guard.
    ///
    /// Returns `Err(reason)` describing the first failed condition.
    pub fn evaluate(
        &self,
        payload: &Value,
        metadata: &HashMap<String, String>,
    ) -> Result<(), String> {
        match self {
            Guard::FieldPresent { field } => match lookup(payload, field) {
                Some(v) if !v.is_null() => Ok(()),
                _ => Err(format!("field '{}' is missing", field)),
            },
            Guard::FieldEquals { field, value } => match lookup(payload, field) {
                Some(actual) if actual == value => Ok(()),
                Some(actual) => Err(format!(
                    "field '{}' is {} but must equal {}",
                    field, actual, value
                )),
                None => Err(format!("field '{}' is missing", field)),
            },
            Guard::FieldAtLeast { field, min } => {
                let n = number(payload, field)?;
                if n >= *min {
                    Ok(())
                } else {
                    Err(format!("field '{}' is {} but must be >= {}", field, n, min))
                }
            }
            Guard::FieldAtMost { field, max } => {
                let n = number(payload, field)?;
                if n <= *max {
                    Ok(())
                } else {
                    Err(format!("field '{}' is {} but must be <= {}", field, n, max))
                }
            }
            Guard::MetadataEquals { key, value } => match metadata.get(key) {
                Some(actual) if actual == value => Ok(()),
                Some(actual) => Err(format!(
                    "metadata '{}' is '{}' but must equal '{}'",
                    key, actual, value
                )),
                None => Err(format!("metadata '{}' is missing", key)),
            },
            Guard::All { guards } => {
                for guard in guards {
                    guard.evaluate(payload, metadata)?;
                }
                Ok(())
            }
            Guard::Any { guards } => {
                let mut reasons = Vec::new();
                for guard in guards {
                    match guard.evaluate(payload, metadata) {
                        Ok(()) => return Ok(()),
                        Err(reason) => reasons.push(reason),
                    }
                }
                Err(format!("no alternative held: {}", reasons.join("; ")))
            }
            Guard::Not { guard } => match guard.evaluate(payload, metadata) {
                Ok(()) => Err("negated condition held".to_string()),
                Err(_) => Ok(()),
            },
        }
    }
}

/// Resolve a dotted path inside a JSON value
fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(payload, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

fn number(payload: &Value, field: &str) -> Result<f64, String> {
    match lookup(payload, field) {
        Some(v) => v
            .as_f64()
            .ok_or_else(|| format!("field '{}' is not a number", field)),
        None => Err(format!("field '{}' is missing", field)),
    }
}
