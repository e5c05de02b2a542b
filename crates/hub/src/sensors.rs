//! Last known value of every sensor the hub has heard about.
//!
//! Values arrive over MQTT and are keyed by qualified ref
//! (`<node_id>/<sensor_id>`).  A sensor that reported something unusable is
//! kept as "unavailable" rather than silently reusing its previous value.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize)]
pub struct SensorValue {
    pub value: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Default)]
pub struct SensorCache {
    values: HashMap<String, SensorValue>,
}

impl SensorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sensor: &str, value: Option<f64>, at: OffsetDateTime) {
        self.values.insert(
            sensor.to_string(),
            SensorValue {
                value: value.filter(|v| v.is_finite()),
                updated_at: at,
            },
        );
    }

    /// `None` when the sensor is unknown or currently unavailable.
    pub fn read_numeric(&self, sensor: &str) -> Option<f64> {
        self.values.get(sensor).and_then(|s| s.value)
    }

    pub fn get(&self, sensor: &str) -> Option<&SensorValue> {
        self.values.get(sensor)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Accept JSON numbers and numeric strings; anything else is unavailable.
pub fn parse_numeric(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

// ===========================================================================
// Tests
// ===========================================================================
