use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::coordinator::ControllerStatus;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// What the web API sees: the last controller snapshot plus transport
/// health and a rolling event log.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub nodes: HashMap<String, NodeState>,
    pub valves: HashMap<String, ValveState>,
    pub controller: Option<ControllerStatus>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct NodeState {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub readings: Vec<SensorReading>,
}

#[derive(Clone, Serialize)]
pub struct SensorReading {
    pub sensor_id: String,
    /// `None` when the node sent something that is not a number.
    pub value: Option<f64>,
}

#[derive(Clone, Serialize)]
pub struct ValveState {
    pub on: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Valve,
    Schedule,
    Notification,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub nodes: HashMap<String, NodeState>,
    pub valves: HashMap<String, ValveState>,
    pub controller: Option<ControllerStatus>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(zone_ids: &[String]) -> Self {
        let valves = zone_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    ValveState {
                        on: false,
                        last_changed: None,
                    },
                )
            })
            .collect();

        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            nodes: HashMap::new(),
            valves,
            controller: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(zone_ids: &[String]) -> SharedState {
        Arc::new(RwLock::new(Self::new(zone_ids)))
    }

    /// Record a telemetry message from a node.
    pub fn record_reading(&mut self, node_id: &str, readings: Vec<SensorReading>) {
        let detail = format!(
            "{node_id}: {}",
            readings
                .iter()
                .map(|r| match r.value {
                    Some(v) => format!("{}={v}", r.sensor_id),
                    None => format!("{}=?", r.sensor_id),
                })
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.nodes.insert(
            node_id.to_string(),
            NodeState {
                last_seen: OffsetDateTime::now_utc(),
                readings,
            },
        );

        self.push_event(EventKind::Reading, detail);
    }

    /// Record a valve state change.
    pub fn record_valve(&mut self, zone_id: &str, on: bool) {
        let valve = self.valves.entry(zone_id.to_string()).or_insert(ValveState {
            on: false,
            last_changed: None,
        });
        valve.on = on;
        valve.last_changed = Some(OffsetDateTime::now_utc());

        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Valve, format!("{zone_id} set {state_str}"));
    }

    pub fn record_schedule(&mut self, detail: String) {
        self.push_event(EventKind::Schedule, detail);
    }

    pub fn record_notification(&mut self, detail: String) {
        self.push_event(EventKind::Notification, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn set_controller(&mut self, status: ControllerStatus) {
        self.controller = Some(status);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            nodes: self.nodes.clone(),
            valves: self.valves.clone(),
            controller: self.controller.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
