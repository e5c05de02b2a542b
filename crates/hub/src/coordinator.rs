//! The zone table and everything that acts on it.
//!
//! `Coordinator` is plain synchronous state.  It is owned by the controller
//! actor, which feeds it one command at a time, so none of its operations
//! can interleave.  Queue logic lives in `queue.rs`, the per-zone cycle state
//! machine in `processor.rs`; this file holds construction, the
//! service-style operations and the status snapshot.
//!
//! Side effects that leave the process (notifications, journal rows,
//! forecast refresh requests) are pushed to an outbox that the actor drains
//! after every command.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::{Config, SystemConfig};
use crate::deficit;
use crate::duration::calculate_watering_duration;
use crate::queue::WateringQueue;
use crate::scheduler::{ScheduleStatus, ScheduleUpdate, Scheduler, Transition};
use crate::sensors::SensorCache;
use crate::timers::{TimerEvent, TimerId, TimerService};
use crate::valve::Actuator;
use crate::weather::{Forecast, WeatherFeed};
use crate::zone::{FinishedSession, SessionResult, Zone, ZoneStatus};

#[derive(Debug, Clone)]
pub enum Outbound {
    Notify(String),
    Valve { zone: String, on: bool },
    ForecastRefresh,
    SessionFinished(FinishedSession),
}

pub struct Coordinator {
    pub(crate) settings: SystemConfig,
    pub(crate) zones: Vec<Zone>,
    pub(crate) queue: WateringQueue,
    pub(crate) scheduler: Scheduler,
    pub(crate) sensors: SensorCache,
    pub(crate) weather: WeatherFeed,
    pub(crate) actuator: Box<dyn Actuator>,
    pub(crate) timers: Box<dyn TimerService>,
    pub(crate) outbox: Vec<Outbound>,
    pub(crate) enabled: bool,
    pub(crate) shutting_down: bool,
}

// ---------------------------------------------------------------------------
// Construction & lookups
// ---------------------------------------------------------------------------

impl Coordinator {
    pub fn new(config: &Config, actuator: Box<dyn Actuator>, timers: Box<dyn TimerService>) -> Self {
        let zones: Vec<Zone> = config.zones.iter().map(Zone::from_entry).collect();
        info!(
            zones = zones.len(),
            enabled = config.system.enabled,
            schedule = config.system.schedule.as_deref().unwrap_or("-"),
            "coordinator ready"
        );

        Self {
            settings: config.system.clone(),
            zones,
            queue: WateringQueue::default(),
            scheduler: Scheduler::new(config.system.schedule.clone()),
            sensors: SensorCache::new(),
            weather: WeatherFeed::new(),
            actuator,
            timers,
            outbox: Vec::new(),
            enabled: config.system.enabled,
            shutting_down: false,
        }
    }

    pub fn zone_index(&self, zone_id: &str) -> Option<usize> {
        self.zones.iter().position(|z| z.id == zone_id)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Any zone mid-session (watering, soaking or measuring).
    pub fn is_busy(&self) -> bool {
        self.zones.iter().any(|z| !z.is_idle())
    }

    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn notify(&mut self, message: String) {
        info!(notification = %message, "notify");
        self.outbox.push(Outbound::Notify(message));
    }

    pub(crate) fn rain_gauge(&self) -> Option<f64> {
        self.settings
            .rain_sensor
            .as_deref()
            .and_then(|r| self.sensors.read_numeric(r))
    }

    pub(crate) fn temperature(&self, idx: usize) -> Option<f64> {
        self.zones[idx]
            .temperature_sensor
            .as_deref()
            .and_then(|r| self.sensors.read_numeric(r))
    }
}

// ---------------------------------------------------------------------------
// Inputs: sensors, schedule, weather, timers
// ---------------------------------------------------------------------------

impl Coordinator {
    /// A sensor reported a value (`None` when it reported something
    /// unusable).  Moisture readings feed history and deficit, and a reading
    /// at or below a zone's minimum triggers an immediate evaluation.
    pub fn handle_reading(&mut self, sensor: &str, value: Option<f64>, now: OffsetDateTime) {
        self.sensors.update(sensor, value, now);
        let Some(value) = value.filter(|v| v.is_finite()) else {
            debug!(sensor = %sensor, "sensor unavailable");
            return;
        };

        let matching: Vec<usize> = self
            .zones
            .iter()
            .enumerate()
            .filter(|(_, z)| z.moisture_sensor == sensor)
            .map(|(i, _)| i)
            .collect();

        for idx in matching {
            self.zones[idx].record_moisture(now, value);
            let zone = &self.zones[idx];
            if zone.is_idle() && value <= zone.min_moisture && !self.queue.contains(&zone.id) {
                debug!(
                    zone = %zone.id,
                    moisture = format!("{value:.1}"),
                    "reading below minimum, evaluating"
                );
                self.evaluate_zone(idx, now);
            }
        }
    }

    pub fn handle_schedule(&mut self, update: ScheduleUpdate, now: OffsetDateTime) {
        match self.scheduler.apply(update, now) {
            Transition::Opened => {
                info!("schedule window opened");
                self.notify("Watering window opened".to_string());
                self.evaluate_all(now);
            }
            Transition::Closed => {
                info!("schedule window closed");
                if self.is_busy() || !self.queue.is_empty() {
                    self.stop_all("schedule window closed", now);
                }
            }
            Transition::BecameUnavailable => {
                warn!("schedule signal unavailable, no new watering will start");
            }
            Transition::Unchanged => {}
        }
    }

    pub fn handle_forecast(&mut self, forecast: Forecast, now: OffsetDateTime) {
        debug!(?forecast, "forecast updated");
        self.weather.update(forecast, now);
    }

    /// Deliver a fired timer.  Events whose id no longer matches the zone's
    /// pending timer were superseded or cancelled and are dropped.
    pub fn handle_timer(&mut self, id: TimerId, event: TimerEvent, now: OffsetDateTime) {
        self.timers.fired(id);
        let Some(idx) = self.zone_index(event.zone()) else {
            warn!(timer = %id, zone = %event.zone(), "timer for unknown zone");
            return;
        };
        if self.zones[idx].pending_timer != Some(id) {
            debug!(timer = %id, zone = %event.zone(), "stale timer ignored");
            return;
        }
        self.zones[idx].pending_timer = None;

        match event {
            TimerEvent::CycleEnd { .. } => self.on_cycle_end(idx, now),
            TimerEvent::SoakEnd { .. } => self.on_soak_end(idx, now),
            TimerEvent::FinalMeasurement { .. } => self.on_final_measurement(idx, now),
        }
    }

    /// Periodic schedule check.
    pub fn check_schedule(&mut self, now: OffsetDateTime) {
        if self.shutting_down {
            return;
        }
        let decision = self.scheduler.check(now, self.is_busy(), self.queue.len());
        if decision.stop_all {
            self.stop_all("schedule window closed", now);
            return;
        }
        if decision.clear_queue {
            self.clear_queue("schedule window ending", now);
        }
        if decision.evaluate_all && self.enabled {
            self.evaluate_all(now);
        }
        if !self.queue.is_empty() || self.queue.soaking_count() > 0 {
            self.process_queue(now);
        }
    }
}

// ---------------------------------------------------------------------------
// Service operations
// ---------------------------------------------------------------------------

impl Coordinator {
    pub fn evaluate_all(&mut self, now: OffsetDateTime) {
        for idx in 0..self.zones.len() {
            self.evaluate_zone(idx, now);
        }
    }

    pub fn enable(&mut self, now: OffsetDateTime) {
        self.enabled = true;
        self.shutting_down = false;
        self.notify("Sprinkler system enabled".to_string());
        self.evaluate_all(now);
    }

    pub fn disable(&mut self, now: OffsetDateTime) {
        self.enabled = false;
        self.stop_all("system disabled", now);
    }

    /// Cancel every timer, close every actuator and forget all queue and
    /// soak state.  Safe to call at any point, repeatedly.
    pub fn stop_all(&mut self, reason: &str, now: OffsetDateTime) {
        info!(reason, "stopping all watering");

        self.queue.clear();
        for soak in self.queue.drain_soaking() {
            if let Some(t) = soak.timer {
                self.timers.cancel(t);
            }
        }
        self.timers.cancel_all();

        for idx in 0..self.zones.len() {
            let mid_session = !self.zones[idx].is_idle() || self.zones[idx].session.is_some();
            self.turn_off(idx);
            if mid_session {
                self.finish_session(idx, SessionResult::Aborted, None, now);
            } else {
                self.zones[idx].pending_timer = None;
            }
        }
        self.queue.set_active(None);

        self.notify(format!("All watering stopped: {reason}"));
    }

    /// Stop everything and refuse new work until re-enabled.  A second pass
    /// commands every actuator off directly, bypassing zone bookkeeping.
    pub fn emergency_shutdown(&mut self, now: OffsetDateTime) {
        warn!("emergency shutdown");
        self.shutting_down = true;
        self.stop_all("emergency shutdown", now);

        for zone in &self.zones {
            if let Err(e) = self.actuator.set(&zone.actuator, false) {
                tracing::error!(zone = %zone.id, "failsafe off failed: {e:#}");
            }
        }
    }

    pub fn reset_statistics(&mut self) {
        for zone in &mut self.zones {
            zone.reset_statistics();
        }
        self.notify("Watering statistics reset".to_string());
    }

    pub fn refresh_forecast(&mut self) {
        self.outbox.push(Outbound::ForecastRefresh);
    }

    /// Daily evapotranspiration/precipitation balance for every zone.
    pub fn apply_daily_balance(&mut self) {
        let et = self.weather.daily_et();
        let precipitation = self.weather.daily_precipitation();
        for zone in &mut self.zones {
            zone.moisture_deficit = deficit::apply_daily_balance(
                zone.moisture_deficit,
                et * zone.crop_coefficient,
                precipitation,
            );
        }
        info!(
            et_mm = format!("{et:.2}"),
            precipitation_mm = format!("{precipitation:.2}"),
            "daily deficit balance applied"
        );
    }

    /// On-demand recalculation: ask for fresh weather data and reapply the
    /// daily balance with the numbers at hand.
    pub fn update_deficit(&mut self) {
        self.refresh_forecast();
        self.apply_daily_balance();
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub enabled: bool,
    pub shutting_down: bool,
    pub schedule: ScheduleStatus,
    pub schedule_remaining_min: Option<f64>,
    pub rain_forecasted: bool,
    pub freezing_forecasted: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub forecast_received_at: Option<OffsetDateTime>,
    pub active_zone: Option<String>,
    pub queue: Vec<String>,
    pub soaking: Vec<String>,
    pub zones: Vec<ZoneStatus>,
}

impl Coordinator {
    pub fn status(&mut self, now: OffsetDateTime) -> ControllerStatus {
        let cycle = self.settings.cycle_time_min;
        let mut zones = Vec::with_capacity(self.zones.len());

        for idx in 0..self.zones.len() {
            let temperature = self.temperature(idx);
            let reading = self.sensors.read_numeric(&self.zones[idx].moisture_sensor);
            let zone = &mut self.zones[idx];
            let moisture = reading.or_else(|| zone.last_moisture());
            let rate = zone.effective_rate();
            let estimated_duration_min = moisture
                .map(|m| {
                    calculate_watering_duration(
                        m,
                        zone.target_moisture(),
                        rate,
                        cycle,
                        Some(zone.max_watering_min),
                    )
                })
                .unwrap_or(0.0);

            zones.push(ZoneStatus {
                zone_id: zone.id.clone(),
                name: zone.name.clone(),
                state: zone.state,
                cycle_count: zone.cycle_count,
                current_cycle: zone.current_cycle,
                last_watered: zone.last_watered,
                moisture,
                temperature,
                moisture_deficit: zone.moisture_deficit,
                soaking_efficiency: zone.soaking_efficiency,
                efficiency_factor: zone.efficiency_factor,
                estimated_duration_min,
                skip_reason: zone.skip_reason,
                history_len: zone.history.len(),
                absorption: zone.learner.statistics(),
            });
        }

        ControllerStatus {
            enabled: self.enabled,
            shutting_down: self.shutting_down,
            schedule: self.scheduler.status(),
            schedule_remaining_min: self.scheduler.remaining_minutes(now),
            rain_forecasted: self
                .weather
                .rain_forecasted(self.settings.rain_threshold_mm, self.rain_gauge()),
            freezing_forecasted: self.weather.freezing_forecasted(self.settings.freeze_threshold),
            forecast_received_at: self.weather.received_at(),
            active_zone: self.queue.active().map(str::to_string),
            queue: self.queue.zone_ids(),
            soaking: self.queue.soaking_ids(),
            zones,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
