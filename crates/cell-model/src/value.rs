//! Engine-boundary values
//!
//! Cell values, timer callbacks, and persistent-KV entries all cross the
//! host boundary as this tagged union. Payloads are UTF-8 strings;
//! booleans serialize as `"0"`/`"1"`, numbers with the shortest
//! round-trippable decimal.

/// How a cell type maps payloads to values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Boolean,
    Numeric,
    Text,
}

/// A dynamically-typed value at the engine boundary
///
/// `Object` carries a runtime identity handle; it never appears as a cell
/// value and exists so value-change conditions can compare script objects
/// by identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Object(u64),
}

impl Value {
    /// Serialize for an MQTT payload.
    #[must_use]
    pub fn to_payload(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => {
                if *b {
                    "1".to_string()
                } else {
                    "0".to_string()
                }
            }
            // Rust's float Display is the shortest representation that
            // round-trips, which is exactly the payload contract
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Object(_) => String::new(),
        }
    }

    /// Parse a payload according to the target kind.
    ///
    /// Numeric payloads that don't parse stay as text so a misbehaving
    /// publisher can't wedge the cell.
    #[must_use]
    pub fn parse(payload: &str, kind: ValueKind) -> Value {
        match kind {
            ValueKind::Boolean => Value::Bool(payload == "1"),
            ValueKind::Numeric => {
                if let Ok(n) = payload.parse::<i64>() {
                    Value::Int(n)
                } else if let Ok(f) = payload.parse::<f64>() {
                    Value::Float(f)
                } else {
                    Value::Text(payload.to_string())
                }
            }
            ValueKind::Text => Value::Text(payload.to_string()),
        }
    }

    /// Truthiness for level/edge conditions.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }

    /// Convert a JSON value to the boundary representation for `kind`.
    ///
    /// Used for virtual-cell initial values and `/on` writes.
    #[must_use]
    pub fn from_json(json: &serde_json::Value, kind: ValueKind) -> Value {
        match (kind, json) {
            (ValueKind::Boolean, serde_json::Value::Bool(b)) => Value::Bool(*b),
            (ValueKind::Boolean, serde_json::Value::Number(n)) => {
                Value::Bool(n.as_i64() != Some(0))
            }
            (ValueKind::Boolean, serde_json::Value::String(s)) => Value::Bool(s == "1"),
            (ValueKind::Numeric, serde_json::Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            (ValueKind::Numeric, serde_json::Value::String(s)) => {
                Value::parse(s, ValueKind::Numeric)
            }
            (ValueKind::Text, serde_json::Value::String(s)) => Value::Text(s.clone()),
            (ValueKind::Text, other) => Value::Text(other.to_string()),
            _ => Value::Null,
        }
    }

    /// JSON rendering for persistent values and `readConfig` results.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Object(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}
