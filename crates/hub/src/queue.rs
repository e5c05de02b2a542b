//! Watering queue: which zone gets the single watering slot next.
//!
//! Invariant: at most one zone is `Watering` at any instant.  Any number may
//! be soaking.  Zones coming back from a soak go to the front of the queue,
//! ahead of freshly evaluated ones, in the order their soaks finished.

use std::collections::VecDeque;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::duration::{
    calculate_watering_duration, deficit_bonus_minutes, distribute_watering_time, ZoneDemand,
};
use crate::scheduler::{ScheduleStatus, SAFETY_MARGIN_MIN};
use crate::timers::TimerId;
use crate::zone::{SessionResult, SkipReason};

/// How many queued zones still get an individual "queued" notification.
const NOTIFY_QUEUE_LIMIT: usize = 3;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Queued by need evaluation.
    Evaluated,
    /// Queued by a manual start request.
    Manual,
    /// Mid-session zone whose soak finished.
    Resume,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub zone_id: String,
    pub origin: Origin,
    /// Cycles granted by time distribution, if it ran.
    pub allocated_cycles: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoakingEntry {
    pub zone_id: String,
    pub ready_at: OffsetDateTime,
    pub pre_soak_moisture: Option<f64>,
    pub timer: Option<TimerId>,
}

#[derive(Debug, Default)]
pub struct WateringQueue {
    entries: VecDeque<QueueEntry>,
    soaking: Vec<SoakingEntry>,
    active: Option<String>,
    processing: bool,
}

/// Outcome of a need evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Inactive,
    Busy,
    AlreadyQueued,
    SensorUnavailable,
    NotNeeded,
    Skipped(SkipReason),
    Queued,
}

// ---------------------------------------------------------------------------
// Queue bookkeeping
// ---------------------------------------------------------------------------

impl WateringQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, zone_id: &str) -> bool {
        self.entries.iter().any(|e| e.zone_id == zone_id)
    }

    pub fn zone_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.zone_id.clone()).collect()
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn set_active(&mut self, zone_id: Option<String>) {
        self.active = zone_id;
    }

    /// Append a zone unless it is already queued.  Returns whether it was
    /// added.
    pub fn push_fresh(&mut self, zone_id: &str, origin: Origin) -> bool {
        if self.contains(zone_id) {
            return false;
        }
        self.entries.push_back(QueueEntry {
            zone_id: zone_id.to_string(),
            origin,
            allocated_cycles: None,
        });
        true
    }

    /// Put a zone returning from its soak behind the other returning zones
    /// and ahead of everything else.
    pub fn push_resume(&mut self, zone_id: &str) {
        self.entries.retain(|e| e.zone_id != zone_id);
        let at = self
            .entries
            .iter()
            .position(|e| e.origin != Origin::Resume)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            at,
            QueueEntry {
                zone_id: zone_id.to_string(),
                origin: Origin::Resume,
                allocated_cycles: None,
            },
        );
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    pub fn clear(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    /// Entries that have not started a session yet.
    pub fn fresh_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.origin != Origin::Resume)
            .count()
    }

    /// Drop every entry that has not started a session yet.
    pub fn retain_resumes(&mut self) -> Vec<QueueEntry> {
        let (keep, dropped): (VecDeque<_>, VecDeque<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.origin == Origin::Resume);
        self.entries = keep;
        dropped.into_iter().collect()
    }

    // -- soaking -------------------------------------------------------------

    pub fn start_soak(&mut self, entry: SoakingEntry) {
        self.soaking.retain(|s| s.zone_id != entry.zone_id);
        self.soaking.push(entry);
    }

    pub fn finish_soak(&mut self, zone_id: &str) -> Option<SoakingEntry> {
        let at = self.soaking.iter().position(|s| s.zone_id == zone_id)?;
        Some(self.soaking.remove(at))
    }

    /// Soaks whose time is up, oldest first.
    pub fn take_ready_soaks(&mut self, now: OffsetDateTime) -> Vec<SoakingEntry> {
        let (mut ready, waiting): (Vec<_>, Vec<_>) =
            self.soaking.drain(..).partition(|s| s.ready_at <= now);
        self.soaking = waiting;
        ready.sort_by_key(|s| s.ready_at);
        ready
    }

    pub fn drain_soaking(&mut self) -> Vec<SoakingEntry> {
        self.soaking.drain(..).collect()
    }

    pub fn soaking_ids(&self) -> Vec<String> {
        self.soaking.iter().map(|s| s.zone_id.clone()).collect()
    }

    pub fn soaking_count(&self) -> usize {
        self.soaking.len()
    }
}

// ---------------------------------------------------------------------------
// Need evaluation
// ---------------------------------------------------------------------------

impl Coordinator {
    /// Decide whether a zone needs water and, if so, queue it.
    pub fn evaluate_zone(&mut self, idx: usize, now: OffsetDateTime) -> Evaluation {
        if !self.enabled || self.shutting_down {
            return Evaluation::Inactive;
        }
        let zone_id = self.zones[idx].id.clone();
        if !self.zones[idx].is_idle() {
            return Evaluation::Busy;
        }
        if self.queue.contains(&zone_id) {
            return Evaluation::AlreadyQueued;
        }

        let Some(moisture) = self.sensors.read_numeric(&self.zones[idx].moisture_sensor) else {
            warn!(zone = %zone_id, "moisture sensor unavailable, skipping evaluation");
            return Evaluation::SensorUnavailable;
        };
        let temperature = self.temperature(idx);
        if self.zones[idx].temperature_sensor.is_some() && temperature.is_none() {
            warn!(zone = %zone_id, "temperature sensor unavailable, skipping evaluation");
            return Evaluation::SensorUnavailable;
        }

        if !self.zones[idx].needs_water(moisture) {
            debug!(
                zone = %zone_id,
                moisture = format!("{moisture:.1}"),
                deficit_mm = format!("{:.1}", self.zones[idx].moisture_deficit),
                "no watering needed"
            );
            self.zones[idx].skip_reason = None;
            return Evaluation::NotNeeded;
        }

        let blocked = if !self.scheduler.is_in_schedule() {
            Some(SkipReason::OutsideSchedule)
        } else {
            self.weather_block(temperature, true)
        };
        if let Some(reason) = blocked {
            info!(
                zone = %zone_id,
                moisture = format!("{moisture:.1}"),
                %reason,
                "watering needed but skipped"
            );
            self.zones[idx].skip_reason = Some(reason);
            return Evaluation::Skipped(reason);
        }

        self.zones[idx].skip_reason = None;
        if self.queue.push_fresh(&zone_id, Origin::Evaluated) {
            info!(
                zone = %zone_id,
                moisture = format!("{moisture:.1}"),
                deficit_mm = format!("{:.1}", self.zones[idx].moisture_deficit),
                queued = self.queue.len(),
                "zone queued for watering"
            );
            if self.queue.len() <= NOTIFY_QUEUE_LIMIT {
                let name = self.zones[idx].name.clone();
                self.notify(format!("{name} queued for watering"));
            }
        }
        self.process_queue(now);
        Evaluation::Queued
    }

    /// Weather/temperature reason not to water right now, if any.
    pub(crate) fn weather_block(&self, temperature: Option<f64>, include_rain: bool) -> Option<SkipReason> {
        let freeze = self.settings.freeze_threshold;
        if include_rain
            && self
                .weather
                .rain_forecasted(self.settings.rain_threshold_mm, self.rain_gauge())
        {
            return Some(SkipReason::RainForecasted);
        }
        if self.weather.freezing_forecasted(freeze) {
            return Some(SkipReason::FreezeForecasted);
        }
        if temperature.is_some_and(|t| t <= freeze) {
            return Some(SkipReason::BelowFreezeThreshold);
        }
        None
    }

    /// Queue zones on request, bypassing the need check.  `None` means every
    /// zone.  Returns the zones that were queued.
    pub fn manual_start(&mut self, zone_ids: Option<Vec<String>>, now: OffsetDateTime) -> Vec<String> {
        if !self.enabled || self.shutting_down {
            warn!("manual start refused, system is disabled");
            return Vec::new();
        }
        if !self.scheduler.is_in_schedule() {
            self.notify("Manual start refused: outside watering schedule".to_string());
            return Vec::new();
        }

        let targets: Vec<usize> = match zone_ids {
            None => (0..self.zones.len()).collect(),
            Some(ids) => ids
                .iter()
                .filter_map(|id| {
                    let idx = self.zone_index(id);
                    if idx.is_none() {
                        warn!(zone = %id, "manual start for unknown zone");
                    }
                    idx
                })
                .collect(),
        };

        let mut queued = Vec::new();
        for idx in targets {
            let zone_id = self.zones[idx].id.clone();
            if !self.zones[idx].is_idle() {
                debug!(zone = %zone_id, "manual start: zone busy");
                continue;
            }
            if let Some(reason) = self.weather_block(self.temperature(idx), false) {
                info!(zone = %zone_id, %reason, "manual start skipped");
                self.zones[idx].skip_reason = Some(reason);
                continue;
            }
            if self.queue.push_fresh(&zone_id, Origin::Manual) {
                queued.push(zone_id);
            }
        }

        if !queued.is_empty() {
            info!(zones = ?queued, "manual start");
            self.notify(format!("Manual watering queued: {}", queued.join(", ")));
            self.process_queue(now);
        }
        queued
    }
}

// ---------------------------------------------------------------------------
// Queue processing
// ---------------------------------------------------------------------------

impl Coordinator {
    /// Start the next zone if the watering slot is free.  Re-entrant calls
    /// are no-ops.
    pub fn process_queue(&mut self, now: OffsetDateTime) {
        if self.queue.processing {
            debug!("queue processing already in progress");
            return;
        }
        self.queue.processing = true;
        self.advance_queue(now);
        self.queue.processing = false;
    }

    fn advance_queue(&mut self, now: OffsetDateTime) {
        let mut allocated = false;

        loop {
            if self.shutting_down || !self.enabled {
                return;
            }

            // Soaks whose timer is late still count as finished.
            for soak in self.queue.take_ready_soaks(now) {
                if let Some(t) = soak.timer {
                    self.timers.cancel(t);
                }
                if let Some(idx) = self.zone_index(&soak.zone_id) {
                    if self.zones[idx].pending_timer == soak.timer {
                        self.zones[idx].pending_timer = None;
                    }
                }
                self.queue.push_resume(&soak.zone_id);
            }

            if let Some(active) = self.queue.active() {
                debug!(active = %active, queued = self.queue.len(), "watering slot busy");
                return;
            }
            if self.queue.is_empty() {
                return;
            }

            match self.scheduler.status() {
                ScheduleStatus::Closed => {
                    self.clear_queue("outside watering schedule", now);
                    return;
                }
                ScheduleStatus::Unavailable => {
                    for dropped in self.queue.retain_resumes() {
                        debug!(zone = %dropped.zone_id, "schedule unavailable, dropped from queue");
                    }
                    if self.queue.is_empty() {
                        return;
                    }
                }
                ScheduleStatus::Open => {
                    let remaining = self.scheduler.remaining_minutes(now);
                    if remaining.is_some_and(|r| r < SAFETY_MARGIN_MIN) {
                        self.clear_queue("watering window ending", now);
                        return;
                    }
                    if !allocated && self.queue.fresh_count() > 1 {
                        if let Some(available) = remaining {
                            self.allocate_time(available);
                            allocated = true;
                        }
                    }
                }
            }

            let Some(entry) = self.queue.pop_front() else {
                return;
            };
            let Some(idx) = self.zone_index(&entry.zone_id) else {
                warn!(zone = %entry.zone_id, "queued zone no longer exists");
                continue;
            };

            let started = match entry.origin {
                Origin::Resume => self.resume_session(idx, now),
                _ => match self.plan_cycles(idx, &entry) {
                    Some((cycles, moisture)) => self.start_session(idx, cycles, moisture, now),
                    None => false,
                },
            };
            if started {
                return;
            }
        }
    }

    /// Share the remaining window between the fresh entries.  Entries granted
    /// nothing are dropped, except manual ones which always get a cycle.
    fn allocate_time(&mut self, available_minutes: f64) {
        let cycle = self.settings.cycle_time_min;
        let fresh: Vec<QueueEntry> = self
            .queue
            .entries
            .iter()
            .filter(|e| e.origin != Origin::Resume)
            .cloned()
            .collect();

        let mut demands = Vec::with_capacity(fresh.len());
        for entry in &fresh {
            let Some(idx) = self.zone_index(&entry.zone_id) else {
                demands.push(ZoneDemand {
                    current_moisture: 0.0,
                    target_moisture: 0.0,
                    absorption_rate: 0.0,
                    deficit_mm: 0.0,
                });
                continue;
            };
            let current = self
                .sensors
                .read_numeric(&self.zones[idx].moisture_sensor)
                .or_else(|| self.zones[idx].last_moisture())
                .unwrap_or(self.zones[idx].min_moisture);
            let zone = &mut self.zones[idx];
            demands.push(ZoneDemand {
                current_moisture: current,
                target_moisture: zone.target_moisture(),
                absorption_rate: zone.effective_rate(),
                deficit_mm: zone.moisture_deficit,
            });
        }

        let grants = distribute_watering_time(&demands, available_minutes, cycle, 1);
        info!(
            available_min = format!("{available_minutes:.1}"),
            zones = fresh.len(),
            grants = ?grants,
            "distributing watering window"
        );

        let mut fresh_idx = 0;
        self.queue.entries.retain_mut(|e| {
            if e.origin == Origin::Resume {
                return true;
            }
            let grant = grants.get(fresh_idx).copied().unwrap_or(0);
            fresh_idx += 1;
            match (grant, e.origin) {
                (0, Origin::Manual) => {
                    e.allocated_cycles = Some(1);
                    true
                }
                (0, _) => {
                    info!(zone = %e.zone_id, "no window time left for zone, dropped");
                    false
                }
                (n, _) => {
                    e.allocated_cycles = Some(n);
                    true
                }
            }
        });
    }

    /// Cycle count and starting moisture for a fresh entry, or `None` to skip
    /// it.
    fn plan_cycles(&mut self, idx: usize, entry: &QueueEntry) -> Option<(u32, f64)> {
        let cycle = self.settings.cycle_time_min;
        let reading = self.sensors.read_numeric(&self.zones[idx].moisture_sensor);
        let zone = &mut self.zones[idx];
        if !zone.is_idle() {
            debug!(zone = %zone.id, state = %zone.state, "queued zone is busy, skipped");
            return None;
        }

        let moisture = match (reading, entry.origin) {
            (Some(m), _) => m,
            (None, Origin::Manual) => zone.last_moisture().unwrap_or(zone.min_moisture),
            (None, _) => {
                warn!(zone = %zone.id, "moisture sensor unavailable at start, skipped");
                return None;
            }
        };

        // The reading may have recovered since the zone was queued.
        if entry.origin == Origin::Evaluated && !zone.needs_water(moisture) {
            debug!(
                zone = %zone.id,
                moisture = format!("{moisture:.1}"),
                "moisture recovered while queued, skipped"
            );
            return None;
        }
        if zone.max_watering_min <= 0.0 {
            info!(zone = %zone.id, "watering disabled by zero maximum time");
            return None;
        }

        let rate = zone.effective_rate();
        let minutes = calculate_watering_duration(
            moisture,
            zone.target_moisture(),
            rate,
            cycle,
            Some(zone.max_watering_min),
        ) + deficit_bonus_minutes(zone.moisture_deficit);
        let max_cycles = ((zone.max_watering_min / cycle).floor() as u32).max(1);
        let mut cycles = ((minutes / cycle).ceil() as u32).clamp(1, max_cycles);
        if let Some(granted) = entry.allocated_cycles {
            cycles = cycles.min(granted.max(1));
        }

        debug!(
            zone = %zone.id,
            moisture = format!("{moisture:.1}"),
            rate = format!("{rate:.3}"),
            cycles,
            "cycles planned"
        );
        Some((cycles, moisture))
    }

    /// Drop every queued zone, aborting sessions of zones that were waiting
    /// to resume.
    pub(crate) fn clear_queue(&mut self, reason: &str, now: OffsetDateTime) {
        let dropped = self.queue.clear();
        if dropped.is_empty() {
            return;
        }
        info!(reason, zones = dropped.len(), "watering queue cleared");
        for entry in dropped {
            if entry.origin != Origin::Resume {
                continue;
            }
            if let Some(idx) = self.zone_index(&entry.zone_id) {
                self.finish_session(idx, SessionResult::Aborted, None, now);
            }
        }
        self.notify(format!("Watering queue cleared: {reason}"));
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ScheduleUpdate;
    use crate::test_support::{config, harness, moisture_ref};
    use crate::zone::ZoneState;
    use time::Duration;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn soak(zone: &str, ready_at: OffsetDateTime) -> SoakingEntry {
        SoakingEntry {
            zone_id: zone.into(),
            ready_at,
            pre_soak_moisture: None,
            timer: None,
        }
    }

    // -- WateringQueue -------------------------------------------------------

    #[test]
    fn push_fresh_is_idempotent() {
        let mut q = WateringQueue::default();
        assert!(q.push_fresh("z1", Origin::Evaluated));
        assert!(!q.push_fresh("z1", Origin::Manual));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn resumes_go_ahead_of_fresh_entries_in_arrival_order() {
        let mut q = WateringQueue::default();
        q.push_fresh("a", Origin::Evaluated);
        q.push_fresh("b", Origin::Evaluated);
        q.push_resume("r1");
        q.push_resume("r2");
        assert_eq!(q.zone_ids(), vec!["r1", "r2", "a", "b"]);
    }

    #[test]
    fn push_resume_replaces_existing_entry() {
        let mut q = WateringQueue::default();
        q.push_fresh("a", Origin::Evaluated);
        q.push_fresh("b", Origin::Evaluated);
        q.push_resume("b");
        assert_eq!(q.zone_ids(), vec!["b", "a"]);
        assert_eq!(q.fresh_count(), 1);
    }

    #[test]
    fn retain_resumes_drops_fresh_entries() {
        let mut q = WateringQueue::default();
        q.push_fresh("a", Origin::Manual);
        q.push_resume("r");
        let dropped = q.retain_resumes();
        assert_eq!(dropped.len(), 1);
        assert_eq!(q.zone_ids(), vec!["r"]);
    }

    #[test]
    fn ready_soaks_come_out_oldest_first() {
        let t = now();
        let mut q = WateringQueue::default();
        q.start_soak(soak("late", t + Duration::minutes(5)));
        q.start_soak(soak("b", t - Duration::minutes(1)));
        q.start_soak(soak("a", t - Duration::minutes(3)));
        let ready: Vec<String> = q.take_ready_soaks(t).into_iter().map(|s| s.zone_id).collect();
        assert_eq!(ready, vec!["a", "b"]);
        assert_eq!(q.soaking_ids(), vec!["late"]);
    }

    #[test]
    fn finish_soak_unknown_zone_is_none() {
        let mut q = WateringQueue::default();
        assert!(q.finish_soak("z9").is_none());
    }

    // -- evaluation ------------------------------------------------------------

    #[test]
    fn missing_moisture_reading_skips_without_state_change() {
        let mut h = harness(config(&["z1"]));
        assert_eq!(h.coord.evaluate_zone(0, now()), Evaluation::SensorUnavailable);
        assert!(h.coord.zones[0].is_idle());
        assert!(h.coord.queue.is_empty());
    }

    #[test]
    fn unparsable_reading_counts_as_unavailable() {
        let mut h = harness(config(&["z1"]));
        h.coord.handle_reading(&moisture_ref("z1"), None, now());
        assert_eq!(h.coord.evaluate_zone(0, now()), Evaluation::SensorUnavailable);
    }

    #[test]
    fn moist_zone_is_not_queued() {
        let mut h = harness(config(&["z1"]));
        h.coord.sensors.update(&moisture_ref("z1"), Some(40.0), now());
        assert_eq!(h.coord.evaluate_zone(0, now()), Evaluation::NotNeeded);
    }

    #[test]
    fn queued_zone_is_not_queued_twice() {
        let mut h = harness(config(&["z1", "z2"]));
        let t = now();
        h.coord.sensors.update(&moisture_ref("z1"), Some(5.0), t);
        h.coord.sensors.update(&moisture_ref("z2"), Some(5.0), t);
        h.coord.evaluate_zone(0, t);
        assert_eq!(h.coord.evaluate_zone(1, t), Evaluation::Queued);
        assert_eq!(h.coord.evaluate_zone(1, t), Evaluation::AlreadyQueued);
        assert_eq!(h.coord.evaluate_zone(0, t), Evaluation::Busy);
        assert_eq!(h.coord.queue.len(), 1);
    }

    // -- processing --------------------------------------------------------------

    #[test]
    fn soak_ready_zone_beats_fresh_zone() {
        let mut h = harness(config(&["z1", "z2", "z3"]));
        let t = now();
        h.coord.handle_reading(&moisture_ref("z1"), Some(5.0), t);
        h.coord.handle_reading(&moisture_ref("z2"), Some(5.0), t);

        // z1 soaks, z2 waters
        let (id, ev) = h.timers.pending_for("z1").unwrap();
        h.coord.handle_timer(id, ev, t + Duration::minutes(15));
        assert_eq!(h.coord.zones[1].state, ZoneState::Watering);

        // z3 gets queued while z2 waters, then z1's soak ends
        h.coord.handle_reading(&moisture_ref("z3"), Some(5.0), t + Duration::minutes(20));
        let (id, ev) = h.timers.pending_for("z1").unwrap();
        h.coord.handle_timer(id, ev, t + Duration::minutes(45));
        assert_eq!(h.coord.queue.zone_ids(), vec!["z1", "z3"]);

        // z2 ends its cycle: z1 resumes before z3
        let (id, ev) = h.timers.pending_for("z2").unwrap();
        h.coord.handle_timer(id, ev, t + Duration::minutes(46));
        assert_eq!(h.coord.zones[0].state, ZoneState::Watering);
        assert_eq!(h.coord.zones[0].current_cycle, 2);
        assert_eq!(h.coord.zones[2].state, ZoneState::Idle);
    }

    #[test]
    fn recovered_zone_is_skipped_silently() {
        let mut h = harness(config(&["z1", "z2"]));
        let t = now();
        h.coord.handle_reading(&moisture_ref("z1"), Some(5.0), t);
        h.coord.handle_reading(&moisture_ref("z2"), Some(5.0), t);
        // z2 recovers before its turn
        h.coord.handle_reading(&moisture_ref("z2"), Some(40.0), t);

        let (id, ev) = h.timers.pending_for("z1").unwrap();
        h.coord.handle_timer(id, ev, t + Duration::minutes(15));
        assert_eq!(h.coord.zones[1].state, ZoneState::Idle);
        assert!(h.coord.queue.is_empty());
    }

    #[test]
    fn failed_start_moves_on_to_next_zone() {
        let mut h = harness(config(&["z1", "z2"]));
        let t = now();
        h.actuator.fail_on("relay-z1");
        h.coord.sensors.update(&moisture_ref("z1"), Some(5.0), t);
        h.coord.sensors.update(&moisture_ref("z2"), Some(5.0), t);
        h.coord.queue.push_fresh("z1", Origin::Evaluated);
        h.coord.queue.push_fresh("z2", Origin::Evaluated);
        h.coord.process_queue(t);

        assert_eq!(h.coord.zones[0].state, ZoneState::Idle);
        assert_eq!(h.coord.zones[1].state, ZoneState::Watering);
        assert_eq!(h.coord.queue.active(), Some("z2"));
    }

    #[test]
    fn reentrant_processing_is_a_noop() {
        let mut h = harness(config(&["z1"]));
        let t = now();
        h.coord.sensors.update(&moisture_ref("z1"), Some(5.0), t);
        h.coord.queue.push_fresh("z1", Origin::Evaluated);
        h.coord.queue.processing = true;
        h.coord.process_queue(t);
        assert!(h.coord.zones[0].is_idle());
        h.coord.queue.processing = false;
        h.coord.process_queue(t);
        assert_eq!(h.coord.zones[0].state, ZoneState::Watering);
    }

    #[test]
    fn window_ending_clears_queue_instead_of_starting() {
        let mut cfg = config(&["z1"]);
        cfg.system.schedule = Some("night".into());
        let mut h = harness(cfg);
        let t = now();
        h.coord.handle_schedule(
            ScheduleUpdate::On {
                remaining_minutes: Some(5.0),
            },
            t,
        );
        h.coord.sensors.update(&moisture_ref("z1"), Some(5.0), t);
        h.coord.queue.push_fresh("z1", Origin::Evaluated);
        h.coord.process_queue(t);
        assert!(h.coord.zones[0].is_idle());
        assert!(h.coord.queue.is_empty());
    }

    #[test]
    fn short_window_is_shared_between_queued_zones() {
        let mut cfg = config(&["z1", "z2", "z3"]);
        cfg.system.schedule = Some("night".into());
        let mut h = harness(cfg);
        let t = now();
        h.coord.handle_schedule(
            ScheduleUpdate::On {
                remaining_minutes: Some(45.0),
            },
            t,
        );
        for id in ["z1", "z2", "z3"] {
            h.coord.sensors.update(&moisture_ref(id), Some(5.0), t);
            h.coord.queue.push_fresh(id, Origin::Evaluated);
        }
        h.coord.process_queue(t);

        // 45 minutes of 15-minute cycles: one each
        assert_eq!(h.coord.zones[0].state, ZoneState::Watering);
        assert_eq!(h.coord.zones[0].cycle_count, 1);
        assert!(h
            .coord
            .queue
            .entries
            .iter()
            .all(|e| e.allocated_cycles == Some(1)));
    }

    #[test]
    fn unavailable_schedule_keeps_resumes_only() {
        let mut cfg = config(&["z1", "z2"]);
        cfg.system.schedule = Some("night".into());
        let mut h = harness(cfg);
        let t = now();
        h.coord.handle_schedule(
            ScheduleUpdate::On {
                remaining_minutes: None,
            },
            t,
        );
        h.coord.handle_reading(&moisture_ref("z1"), Some(5.0), t);
        h.coord.handle_reading(&moisture_ref("z2"), Some(5.0), t);
        let (id, ev) = h.timers.pending_for("z1").unwrap();
        h.coord.handle_timer(id, ev, t + Duration::minutes(15));
        assert_eq!(h.coord.zones[1].state, ZoneState::Watering);

        h.coord.handle_schedule(ScheduleUpdate::Unavailable, t + Duration::minutes(16));
        // z1 finishes soaking and may continue its session
        let (id, ev) = h.timers.pending_for("z1").unwrap();
        h.coord.handle_timer(id, ev, t + Duration::minutes(45));
        let (id, ev) = h.timers.pending_for("z2").unwrap();
        h.coord.handle_timer(id, ev, t + Duration::minutes(46));
        assert_eq!(h.coord.zones[0].state, ZoneState::Watering);
    }

    // -- manual start --------------------------------------------------------------

    #[test]
    fn manual_start_ignores_need() {
        let mut h = harness(config(&["z1", "z2"]));
        let t = now();
        h.coord.sensors.update(&moisture_ref("z1"), Some(24.0), t);
        let queued = h.coord.manual_start(Some(vec!["z1".into(), "nope".into()]), t);
        assert_eq!(queued, vec!["z1".to_string()]);
        assert_eq!(h.coord.zones[0].state, ZoneState::Watering);
    }

    #[test]
    fn manual_start_without_reading_uses_minimum_moisture() {
        let mut h = harness(config(&["z1"]));
        let queued = h.coord.manual_start(None, now());
        assert_eq!(queued.len(), 1);
        assert_eq!(h.coord.zones[0].state, ZoneState::Watering);
        assert_eq!(h.coord.zones[0].session.as_ref().unwrap().pre_moisture, 20.0);
    }

    #[test]
    fn manual_start_refused_outside_schedule() {
        let mut cfg = config(&["z1"]);
        cfg.system.schedule = Some("night".into());
        let mut h = harness(cfg);
        assert!(h.coord.manual_start(None, now()).is_empty());
        assert!(h.coord.zones[0].is_idle());
    }

    #[test]
    fn manual_start_all_queues_every_idle_zone() {
        let mut h = harness(config(&["z1", "z2", "z3"]));
        let queued = h.coord.manual_start(None, now());
        assert_eq!(queued.len(), 3);
        assert_eq!(h.coord.queue.zone_ids(), vec!["z2", "z3"]);
    }
}
