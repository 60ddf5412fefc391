use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved store key for the aggregate device reachability.
/// Never part of the discoverable sensor set.
pub const AVAILABILITY_SENSOR: &str = "__availability__";

/// A telemetry value: the cloud sends numbers for measurements and
/// strings for modes/states, with no schema telling which is which.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Number(f64),
    Text(String),
}

impl SensorValue {
    #[cfg(test)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorValue::Number(n) => Some(*n),
            SensorValue::Text(_) => None,
        }
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Number(n) => write!(f, "{n}"),
            SensorValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for SensorValue {
    fn from(n: f64) -> Self {
        SensorValue::Number(n)
    }
}

impl From<&str> for SensorValue {
    fn from(s: &str) -> Self {
        SensorValue::Text(s.to_string())
    }
}

/// Latest known value of one sensor stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub name: String,
    pub value: SensorValue,
    pub unit: Option<String>,
    /// Source record as received, for observers that need extra fields
    pub raw: serde_json::Value,
}

impl SensorReading {
    pub fn new(name: impl Into<String>, value: impl Into<SensorValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            unit: None,
            raw: serde_json::Value::Null,
        }
    }

    pub(crate) fn availability(state: Availability) -> Self {
        Self::new(AVAILABILITY_SENSOR, state.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    #[default]
    Online,
    Offline,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Online => "online",
            Availability::Offline => "offline",
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
