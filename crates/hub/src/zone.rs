//! Zone table entries: configuration, runtime state and learned data for a
//! single irrigation zone.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;
use time::OffsetDateTime;

use crate::absorption::{AbsorptionLearner, LearnerStats};
use crate::config::ZoneEntry;
use crate::deficit;
use crate::timers::TimerId;

/// 30 days of readings at one per five minutes.
pub const HISTORY_CAPACITY: usize = 8640;

pub const MIN_EFFICIENCY_FACTOR: f64 = 0.5;
pub const MAX_EFFICIENCY_FACTOR: f64 = 1.0;

// ---------------------------------------------------------------------------
// State types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneState {
    Idle,
    Watering,
    Soaking,
    Measuring,
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ZoneState::Idle => "idle",
            ZoneState::Watering => "watering",
            ZoneState::Soaking => "soaking",
            ZoneState::Measuring => "measuring",
        };
        f.write_str(s)
    }
}

/// Why a zone that needed water was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OutsideSchedule,
    RainForecasted,
    FreezeForecasted,
    BelowFreezeThreshold,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::OutsideSchedule => "outside schedule",
            SkipReason::RainForecasted => "rain forecasted",
            SkipReason::FreezeForecasted => "freeze forecasted",
            SkipReason::BelowFreezeThreshold => "temperature below freeze threshold",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionResult {
    Completed,
    Aborted,
    Failed,
}

impl SessionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionResult::Completed => "completed",
            SessionResult::Aborted => "aborted",
            SessionResult::Failed => "failed",
        }
    }
}

/// Bookkeeping for the session a zone is currently running.
#[derive(Debug, Clone)]
pub struct Session {
    pub started_at: OffsetDateTime,
    pub pre_moisture: f64,
    /// Moisture at the start of the running cycle.
    pub cycle_pre_moisture: f64,
    /// Sum of `rate * cycle_time` over the cycles started so far.
    pub expected_increase: f64,
    pub cycles_started: u32,
}

/// A session that ended, ready for the journal.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedSession {
    pub zone_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: OffsetDateTime,
    pub cycles: u32,
    pub minutes: f64,
    pub pre_moisture: Option<f64>,
    pub final_moisture: Option<f64>,
    pub result: SessionResult,
}

// ---------------------------------------------------------------------------
// Moisture history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MoistureSample {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub moisture: f64,
}

/// Fixed-capacity ring buffer; the oldest sample falls off.
#[derive(Debug, Clone)]
pub struct MoistureHistory {
    samples: VecDeque<MoistureSample>,
    capacity: usize,
}

impl Default for MoistureHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl MoistureHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, at: OffsetDateTime, moisture: f64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(MoistureSample { at, moisture });
    }

    pub fn last(&self) -> Option<&MoistureSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub actuator: String,
    pub moisture_sensor: String,
    pub temperature_sensor: Option<String>,
    pub min_moisture: f64,
    /// Target moisture for a session.
    pub max_moisture: f64,
    pub max_watering_min: f64,
    pub crop_coefficient: f64,

    pub state: ZoneState,
    pub cycle_count: u32,
    pub current_cycle: u32,
    pub last_watered: Option<OffsetDateTime>,
    pub history: MoistureHistory,
    pub moisture_deficit: f64,
    /// %/hour gained during the last completed session.
    pub soaking_efficiency: Option<f64>,
    pub efficiency_factor: f64,
    pub skip_reason: Option<SkipReason>,
    pub learner: AbsorptionLearner,
    pub session: Option<Session>,
    pub pending_timer: Option<TimerId>,
}

impl Zone {
    pub fn from_entry(entry: &ZoneEntry) -> Self {
        Self {
            id: entry.zone_id.clone(),
            name: entry.name.clone(),
            actuator: entry.actuator.clone(),
            moisture_sensor: entry.moisture_sensor.clone(),
            temperature_sensor: entry.temperature_sensor.clone(),
            min_moisture: entry.min_moisture,
            max_moisture: entry.max_moisture,
            max_watering_min: entry.max_watering_total_min(),
            crop_coefficient: entry.crop_coefficient,
            state: ZoneState::Idle,
            cycle_count: 0,
            current_cycle: 0,
            last_watered: None,
            history: MoistureHistory::default(),
            moisture_deficit: 0.0,
            soaking_efficiency: None,
            efficiency_factor: MAX_EFFICIENCY_FACTOR,
            skip_reason: None,
            learner: AbsorptionLearner::new(),
            session: None,
            pending_timer: None,
        }
    }

    pub fn target_moisture(&self) -> f64 {
        self.max_moisture
    }

    pub fn is_idle(&self) -> bool {
        self.state == ZoneState::Idle
    }

    /// Learned absorption rate scaled by the zone's efficiency factor.
    pub fn effective_rate(&mut self) -> f64 {
        self.learner.get_rate() * self.efficiency_factor
    }

    pub fn last_moisture(&self) -> Option<f64> {
        self.history.last().map(|s| s.moisture)
    }

    /// Record a moisture reading; a drop since the previous one grows the
    /// deficit.
    pub fn record_moisture(&mut self, at: OffsetDateTime, moisture: f64) {
        self.moisture_deficit =
            deficit::apply_moisture_drop(self.moisture_deficit, self.last_moisture(), moisture);
        self.history.push(at, moisture);
    }

    /// Whether this reading, with the current deficit, calls for water.
    pub fn needs_water(&self, moisture: f64) -> bool {
        moisture <= self.min_moisture || self.moisture_deficit >= deficit::DEFICIT_TRIGGER_MM
    }

    /// Nudge the efficiency factor from how the last session compared to
    /// what the learned rate predicted.
    pub fn adjust_efficiency(&mut self, actual_increase: f64, expected_increase: f64) {
        if expected_increase <= 0.0 || !actual_increase.is_finite() {
            return;
        }
        const STEP: f64 = 0.05;
        let ratio = actual_increase / expected_increase;
        let delta = if ratio > 1.0 {
            STEP
        } else if ratio < 0.8 {
            -STEP
        } else {
            STEP * (ratio - 1.0) * 0.5
        };
        self.efficiency_factor =
            (self.efficiency_factor + delta).clamp(MIN_EFFICIENCY_FACTOR, MAX_EFFICIENCY_FACTOR);
    }

    /// Back to idle, dropping any session bookkeeping.
    pub fn reset_runtime(&mut self) {
        self.state = ZoneState::Idle;
        self.cycle_count = 0;
        self.current_cycle = 0;
        self.session = None;
        self.pending_timer = None;
    }

    pub fn reset_statistics(&mut self) {
        self.learner.reset();
        self.history.clear();
        self.moisture_deficit = 0.0;
        self.soaking_efficiency = None;
        self.efficiency_factor = MAX_EFFICIENCY_FACTOR;
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub zone_id: String,
    pub name: String,
    pub state: ZoneState,
    pub cycle_count: u32,
    pub current_cycle: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_watered: Option<OffsetDateTime>,
    pub moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub moisture_deficit: f64,
    pub soaking_efficiency: Option<f64>,
    pub efficiency_factor: f64,
    pub estimated_duration_min: f64,
    pub skip_reason: Option<SkipReason>,
    pub history_len: usize,
    pub absorption: LearnerStats,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn entry() -> ZoneEntry {
        ZoneEntry {
            zone_id: "z1".into(),
            name: "Front lawn".into(),
            actuator: "relay-1".into(),
            gpio_pin: None,
            moisture_sensor: "n/s1".into(),
            temperature_sensor: None,
            min_moisture: 20.0,
            max_moisture: 25.0,
            max_watering_hours: 0,
            max_watering_minutes: 20,
            crop_coefficient: 1.0,
        }
    }

    // -- history ------------------------------------------------------------

    #[test]
    fn history_drops_oldest_when_full() {
        let now = OffsetDateTime::now_utc();
        let mut h = MoistureHistory::with_capacity(3);
        for i in 0..5 {
            h.push(now + Duration::minutes(i), i as f64);
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.last().unwrap().moisture, 4.0);
    }

    #[test]
    fn default_history_capacity() {
        let now = OffsetDateTime::now_utc();
        let mut h = MoistureHistory::default();
        for i in 0..(HISTORY_CAPACITY + 10) {
            h.push(now, i as f64);
        }
        assert_eq!(h.len(), HISTORY_CAPACITY);
    }

    // -- readings and need ----------------------------------------------------

    #[test]
    fn new_zone_is_idle_with_defaults() {
        let z = Zone::from_entry(&entry());
        assert_eq!(z.state, ZoneState::Idle);
        assert_eq!(z.efficiency_factor, 1.0);
        assert_eq!(z.max_watering_min, 20.0);
        assert_eq!(z.target_moisture(), 25.0);
    }

    #[test]
    fn moisture_drop_grows_deficit() {
        let now = OffsetDateTime::now_utc();
        let mut z = Zone::from_entry(&entry());
        z.record_moisture(now, 30.0);
        z.record_moisture(now, 27.0);
        z.record_moisture(now, 29.0);
        assert_eq!(z.moisture_deficit, 3.0);
        assert_eq!(z.last_moisture(), Some(29.0));
    }

    #[test]
    fn need_by_moisture_or_deficit() {
        let mut z = Zone::from_entry(&entry());
        assert!(z.needs_water(20.0));
        assert!(!z.needs_water(22.0));
        z.moisture_deficit = 5.0;
        assert!(z.needs_water(40.0));
    }

    // -- efficiency -----------------------------------------------------------

    #[test]
    fn better_than_expected_raises_efficiency_within_bounds() {
        let mut z = Zone::from_entry(&entry());
        z.efficiency_factor = 0.9;
        z.adjust_efficiency(6.0, 5.0);
        assert!((z.efficiency_factor - 0.95).abs() < 1e-9);
        z.adjust_efficiency(6.0, 5.0);
        z.adjust_efficiency(6.0, 5.0);
        assert_eq!(z.efficiency_factor, MAX_EFFICIENCY_FACTOR);
    }

    #[test]
    fn poor_result_lowers_efficiency_to_floor() {
        let mut z = Zone::from_entry(&entry());
        for _ in 0..20 {
            z.adjust_efficiency(1.0, 5.0);
        }
        assert_eq!(z.efficiency_factor, MIN_EFFICIENCY_FACTOR);
    }

    #[test]
    fn near_expected_result_nudges_slightly() {
        let mut z = Zone::from_entry(&entry());
        z.efficiency_factor = 0.8;
        z.adjust_efficiency(4.5, 5.0);
        assert!(z.efficiency_factor < 0.8);
        assert!(z.efficiency_factor > 0.79);
    }

    #[test]
    fn no_expectation_leaves_efficiency() {
        let mut z = Zone::from_entry(&entry());
        z.efficiency_factor = 0.7;
        z.adjust_efficiency(3.0, 0.0);
        assert_eq!(z.efficiency_factor, 0.7);
    }

    // -- resets ---------------------------------------------------------------

    #[test]
    fn reset_statistics_clears_learned_data() {
        let now = OffsetDateTime::now_utc();
        let mut z = Zone::from_entry(&entry());
        z.record_moisture(now, 30.0);
        z.moisture_deficit = 8.0;
        z.efficiency_factor = 0.6;
        z.learner.add_data_point(10.0, 15.0, 30.0);
        z.reset_statistics();
        assert!(z.history.is_empty());
        assert_eq!(z.moisture_deficit, 0.0);
        assert_eq!(z.efficiency_factor, 1.0);
        assert!(z.learner.is_empty());
    }
}
