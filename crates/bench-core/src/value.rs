//! Values carried by virtual instruments built from physical readings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A scalar instrument value.
///
/// Serialized untagged, so YAML/JSON `true`, `3`, `2.5` and `"on"` map directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstrumentValue {
    /// Boolean flag (e.g. interlock closed)
    Bool(bool),
    /// Integer reading or count
    Int(i64),
    /// Floating point measurement
    Float(f64),
    /// Text status
    Text(String),
}

impl InstrumentValue {
    /// Numeric view of the value. Booleans map to 0/1, text is not numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InstrumentValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            InstrumentValue::Int(i) => Some(*i as f64),
            InstrumentValue::Float(f) => Some(*f),
            InstrumentValue::Text(_) => None,
        }
    }

    /// Convert back to a JSON value for physical-instrument calls.
    pub fn to_json(&self) -> Value {
        match self {
            InstrumentValue::Bool(b) => Value::Bool(*b),
            InstrumentValue::Int(i) => Value::from(*i),
            InstrumentValue::Float(f) => Value::from(*f),
            InstrumentValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for InstrumentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentValue::Bool(b) => write!(f, "{b}"),
            InstrumentValue::Int(i) => write!(f, "{i}"),
            InstrumentValue::Float(v) => write!(f, "{v}"),
            InstrumentValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl TryFrom<Value> for InstrumentValue {
    type Error = anyhow::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(b) => Ok(InstrumentValue::Bool(b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(InstrumentValue::Int(i))
                } else {
                    n.as_f64()
                        .map(InstrumentValue::Float)
                        .ok_or_else(|| anyhow::anyhow!("number {n} is not representable"))
                }
            }
            Value::String(s) => Ok(InstrumentValue::Text(s)),
            other => Err(anyhow::anyhow!(
                "reading {other} is not a scalar instrument value"
            )),
        }
    }
}

impl From<bool> for InstrumentValue {
    fn from(value: bool) -> Self {
        InstrumentValue::Bool(value)
    }
}

impl From<i64> for InstrumentValue {
    fn from(value: i64) -> Self {
        InstrumentValue::Int(value)
    }
}

impl From<f64> for InstrumentValue {
    fn from(value: f64) -> Self {
        InstrumentValue::Float(value)
    }
}

impl From<&str> for InstrumentValue {
    fn from(value: &str) -> Self {
        InstrumentValue::Text(value.to_string())
    }
}

impl From<String> for InstrumentValue {
    fn from(value: String) -> Self {
        InstrumentValue::Text(value)
    }
}
