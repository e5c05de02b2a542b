use anyhow::{Context, Result};
use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::controller::ControllerHandle;
use crate::scheduler::{ScheduleUpdate, MAX_WINDOW_MIN};
use crate::sensors::parse_numeric;
use crate::state::{SensorReading, SharedState};
use crate::valve::Actuator;
use crate::weather::Forecast;

pub const TOPIC_READINGS: &str = "tele/+/reading";
pub const TOPIC_SCHEDULES: &str = "schedule/+/state";
pub const TOPIC_FORECAST: &str = "weather/forecast";
pub const TOPIC_FORECAST_REFRESH: &str = "weather/refresh";
pub const TOPIC_NOTIFY: &str = "sprinklers/notify";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct Reading {
    pub(crate) sensor_id: String,
    /// Whatever the node sent; parsed leniently by [`Reading::numeric`].
    #[serde(default, alias = "raw")]
    pub(crate) value: Value,
}

impl Reading {
    pub(crate) fn numeric(&self) -> Option<f64> {
        parse_numeric(&self.value)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    #[serde(default)]
    pub(crate) ts: i64,
    pub(crate) readings: Vec<Reading>,
}

#[derive(Debug, Deserialize)]
struct ScheduleMsg {
    on: bool,
    #[serde(default)]
    remaining_minutes: Option<f64>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

fn middle_segment<'a>(topic: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == prefix && parts[2] == suffix && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    middle_segment(topic, "tele", "reading")
}

/// Extract the schedule name from "schedule/<name>/state".
pub(crate) fn extract_schedule_name(topic: &str) -> Option<&str> {
    middle_segment(topic, "schedule", "state")
}

/// Qualified sensor ref: "<node_id>/<sensor_id>".
pub(crate) fn sensor_ref(node_id: &str, sensor_id: &str) -> String {
    format!("{node_id}/{sensor_id}")
}

/// Parse an "ON"/"OFF" payload into a bool (case-insensitive, trims whitespace).
pub(crate) fn parse_on_off(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(format!("unknown on/off payload '{s}'")),
    }
}

/// Schedule signal: plain ON/OFF, "unavailable"/"unknown", or
/// `{"on": bool, "remaining_minutes": n}`.
pub(crate) fn parse_schedule_state(payload: &[u8]) -> Result<ScheduleUpdate, String> {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        let msg: ScheduleMsg =
            serde_json::from_str(trimmed).map_err(|e| format!("bad schedule json: {e}"))?;
        return Ok(if msg.on {
            ScheduleUpdate::On {
                remaining_minutes: msg
                    .remaining_minutes
                    .filter(|m| m.is_finite() && *m >= 0.0)
                    .map(|m| m.min(MAX_WINDOW_MIN)),
            }
        } else {
            ScheduleUpdate::Off
        });
    }
    if trimmed.eq_ignore_ascii_case("unavailable") || trimmed.eq_ignore_ascii_case("unknown") {
        return Ok(ScheduleUpdate::Unavailable);
    }
    parse_on_off(trimmed.as_bytes()).map(|on| {
        if on {
            ScheduleUpdate::On {
                remaining_minutes: None,
            }
        } else {
            ScheduleUpdate::Off
        }
    })
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

/// Route one incoming publish to the controller.  Malformed payloads are
/// logged and recorded as errors; only a stopped controller is an `Err`.
pub async fn handle_publish(
    topic: &str,
    payload: &[u8],
    schedule: Option<&str>,
    controller: &ControllerHandle,
    shared: &SharedState,
) -> Result<()> {
    if let Some(node_id) = extract_node_id(topic) {
        let msg = match serde_json::from_slice::<ReadingMsg>(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(topic, "bad telemetry json: {e}");
                shared.write().await.record_error(format!("bad telemetry json: {e}"));
                return Ok(());
            }
        };
        debug!(node = %node_id, ts = msg.ts, readings = msg.readings.len(), "telemetry");

        let mut readings = Vec::with_capacity(msg.readings.len());
        for r in &msg.readings {
            let value = r.numeric();
            controller
                .reading(sensor_ref(node_id, &r.sensor_id), value)
                .await?;
            readings.push(SensorReading {
                sensor_id: r.sensor_id.clone(),
                value,
            });
        }
        shared.write().await.record_reading(node_id, readings);
    } else if let Some(name) = extract_schedule_name(topic) {
        if schedule != Some(name) {
            debug!(schedule = %name, "signal for another schedule ignored");
            return Ok(());
        }
        match parse_schedule_state(payload) {
            Ok(update) => {
                controller.schedule(update).await?;
                shared
                    .write()
                    .await
                    .record_schedule(format!("{name}: {update:?}"));
            }
            Err(msg) => {
                warn!(schedule = %name, "{msg}");
                shared.write().await.record_error(msg);
            }
        }
    } else if topic == TOPIC_FORECAST {
        match serde_json::from_slice::<Forecast>(payload) {
            Ok(forecast) => controller.forecast(forecast).await?,
            Err(e) => {
                warn!("bad forecast json: {e}");
                shared.write().await.record_error(format!("bad forecast json: {e}"));
            }
        }
    } else {
        debug!(topic, "unhandled topic");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Valves behind the broker
// ---------------------------------------------------------------------------

/// Actuator that publishes retained ON/OFF commands to `valve/<actuator>/set`.
/// Publishing never blocks; a full client queue is reported as a failure.
pub struct MqttValves {
    client: AsyncClient,
}

impl MqttValves {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl Actuator for MqttValves {
    fn set(&mut self, actuator: &str, on: bool) -> Result<()> {
        let topic = format!("valve/{actuator}/set");
        let payload = if on { "ON" } else { "OFF" };
        self.client
            .try_publish(&topic, QoS::AtLeastOnce, true, payload)
            .with_context(|| format!("publish to {topic} failed"))?;
        info!(actuator = %actuator, "mqtt valve set {payload}");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
