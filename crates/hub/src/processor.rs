//! Per-zone cycle state machine.
//!
//! ```text
//! Idle ─▶ Watering ─▶ Soaking ─▶ (queue) ─▶ Watering ─▶ … ─▶ Measuring ─▶ Idle
//! ```
//!
//! Each wait is a [`TimerEvent`] scheduled through the coordinator's timer
//! service; the zone remembers the id of the one it is waiting for.  Every
//! resumption point checks the shutdown flag first.

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, Outbound};
use crate::deficit;
use crate::queue::SoakingEntry;
use crate::timers::{minutes, TimerEvent};
use crate::zone::{FinishedSession, Session, SessionResult, ZoneState};

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

impl Coordinator {
    /// Open the zone's valve and take the watering slot.  On failure the
    /// zone is left idle and does not hold the slot.
    pub(crate) fn turn_on(&mut self, idx: usize) -> bool {
        let zone_id = self.zones[idx].id.clone();
        if let Some(active) = self.queue.active().filter(|a| *a != zone_id) {
            error!(zone = %zone_id, active = %active, "refusing to open a second valve");
            return false;
        }
        if self
            .zones
            .iter()
            .any(|z| z.id != zone_id && z.state == ZoneState::Watering)
        {
            error!(zone = %zone_id, "another zone is already watering");
            return false;
        }

        let actuator = self.zones[idx].actuator.clone();
        match self.actuator.set(&actuator, true) {
            Ok(()) => {
                self.zones[idx].state = ZoneState::Watering;
                self.queue.set_active(Some(zone_id.clone()));
                self.outbox.push(Outbound::Valve {
                    zone: zone_id,
                    on: true,
                });
                true
            }
            Err(e) => {
                error!(zone = %zone_id, actuator = %actuator, "valve on failed: {e:#}");
                self.zones[idx].state = ZoneState::Idle;
                let name = self.zones[idx].name.clone();
                self.notify(format!("Failed to start watering {name}: {e}"));
                false
            }
        }
    }

    /// Close the zone's valve, retrying once, and release the slot if this
    /// zone held it.
    pub(crate) fn turn_off(&mut self, idx: usize) {
        let zone_id = self.zones[idx].id.clone();
        let actuator = self.zones[idx].actuator.clone();

        let result = self
            .actuator
            .set(&actuator, false)
            .or_else(|e| {
                warn!(zone = %zone_id, "valve off failed, retrying: {e:#}");
                self.actuator.set(&actuator, false)
            });

        if self.queue.active() == Some(zone_id.as_str()) {
            self.queue.set_active(None);
        }
        let was_watering = self.zones[idx].state == ZoneState::Watering;
        if was_watering {
            self.zones[idx].state = ZoneState::Idle;
        }

        match result {
            Ok(()) => {
                if was_watering {
                    self.outbox.push(Outbound::Valve {
                        zone: zone_id,
                        on: false,
                    });
                }
            }
            Err(e) => {
                error!(zone = %zone_id, actuator = %actuator, "valve off failed twice: {e:#}");
                let name = self.zones[idx].name.clone();
                self.notify(format!("Failed to stop watering {name}: {e}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions and cycles
// ---------------------------------------------------------------------------

impl Coordinator {
    /// Begin a session of `cycles` cycles.  Returns whether the first cycle
    /// is running.
    pub(crate) fn start_session(
        &mut self,
        idx: usize,
        cycles: u32,
        moisture: f64,
        now: OffsetDateTime,
    ) -> bool {
        if self.shutting_down {
            return false;
        }
        let zone = &mut self.zones[idx];
        zone.cycle_count = cycles.max(1);
        zone.current_cycle = 1;
        zone.session = Some(Session {
            started_at: now,
            pre_moisture: moisture,
            cycle_pre_moisture: moisture,
            expected_increase: 0.0,
            cycles_started: 0,
        });
        info!(
            zone = %zone.id,
            cycles = zone.cycle_count,
            moisture = format!("{moisture:.1}"),
            "watering session starting"
        );

        if self.start_cycle(idx, moisture, now) {
            let name = self.zones[idx].name.clone();
            let cycles = self.zones[idx].cycle_count;
            self.notify(format!("Started watering {name} ({cycles} cycles)"));
            true
        } else {
            self.zones[idx].reset_runtime();
            false
        }
    }

    /// Run the next cycle of a zone that finished soaking.
    pub(crate) fn resume_session(&mut self, idx: usize, now: OffsetDateTime) -> bool {
        if self.shutting_down {
            return false;
        }
        let zone = &self.zones[idx];
        if zone.session.is_none() {
            warn!(zone = %zone.id, "resume without a session, dropped");
            return false;
        }
        if zone.state != ZoneState::Soaking {
            warn!(zone = %zone.id, state = %zone.state, "resume from unexpected state, dropped");
            return false;
        }

        let moisture = self
            .sensors
            .read_numeric(&zone.moisture_sensor)
            .or_else(|| zone.last_moisture())
            .or_else(|| zone.session.as_ref().map(|s| s.cycle_pre_moisture))
            .unwrap_or(zone.min_moisture);
        debug!(
            zone = %zone.id,
            cycle = zone.current_cycle,
            of = zone.cycle_count,
            "resuming after soak"
        );

        if self.start_cycle(idx, moisture, now) {
            true
        } else {
            self.finish_session(idx, SessionResult::Failed, None, now);
            false
        }
    }

    fn start_cycle(&mut self, idx: usize, moisture: f64, now: OffsetDateTime) -> bool {
        if self.shutting_down {
            return false;
        }
        let cycle = self.settings.cycle_time_min;
        let rate = self.zones[idx].effective_rate();
        let zone = &mut self.zones[idx];
        if let Some(session) = zone.session.as_mut() {
            session.cycle_pre_moisture = moisture;
            session.expected_increase += rate * cycle;
            session.cycles_started += 1;
        }
        zone.last_watered = Some(now);

        if !self.turn_on(idx) {
            return false;
        }

        let zone_id = self.zones[idx].id.clone();
        let timer = self
            .timers
            .schedule(minutes(cycle), TimerEvent::CycleEnd { zone: zone_id.clone() });
        self.zones[idx].pending_timer = Some(timer);
        info!(
            zone = %zone_id,
            cycle = self.zones[idx].current_cycle,
            of = self.zones[idx].cycle_count,
            minutes = cycle,
            timer = %timer,
            "cycle started"
        );
        true
    }

    pub(crate) fn on_cycle_end(&mut self, idx: usize, now: OffsetDateTime) {
        self.turn_off(idx);
        if self.shutting_down {
            self.finish_session(idx, SessionResult::Aborted, None, now);
            return;
        }

        let soak = self.settings.soak_time_min;
        let zone_id = self.zones[idx].id.clone();
        let moisture = self
            .sensors
            .read_numeric(&self.zones[idx].moisture_sensor)
            .or_else(|| self.zones[idx].last_moisture());

        if self.zones[idx].current_cycle >= self.zones[idx].cycle_count {
            self.zones[idx].state = ZoneState::Measuring;
            let timer = self.timers.schedule(
                minutes(soak),
                TimerEvent::FinalMeasurement {
                    zone: zone_id.clone(),
                },
            );
            self.zones[idx].pending_timer = Some(timer);
            info!(zone = %zone_id, wait_min = soak, "cycles done, waiting to measure");
        } else {
            let zone = &mut self.zones[idx];
            zone.current_cycle += 1;
            zone.state = ZoneState::Soaking;
            let timer = self
                .timers
                .schedule(minutes(soak), TimerEvent::SoakEnd { zone: zone_id.clone() });
            zone.pending_timer = Some(timer);
            self.queue.start_soak(SoakingEntry {
                zone_id: zone_id.clone(),
                ready_at: now + time::Duration::seconds_f64(soak * 60.0),
                pre_soak_moisture: moisture,
                timer: Some(timer),
            });
            info!(
                zone = %zone_id,
                next_cycle = self.zones[idx].current_cycle,
                soak_min = soak,
                "soaking"
            );
        }

        self.process_queue(now);
    }

    pub(crate) fn on_soak_end(&mut self, idx: usize, now: OffsetDateTime) {
        let zone_id = self.zones[idx].id.clone();
        let soak = self.queue.finish_soak(&zone_id);
        if self.shutting_down {
            self.finish_session(idx, SessionResult::Aborted, None, now);
            return;
        }
        if let Some(pre) = soak.and_then(|s| s.pre_soak_moisture) {
            if let Some(current) = self.sensors.read_numeric(&self.zones[idx].moisture_sensor) {
                debug!(
                    zone = %zone_id,
                    gain = format!("{:.1}", current - pre),
                    "soak finished"
                );
            }
        }
        self.queue.push_resume(&zone_id);
        self.process_queue(now);
    }

    pub(crate) fn on_final_measurement(&mut self, idx: usize, now: OffsetDateTime) {
        if self.shutting_down {
            self.finish_session(idx, SessionResult::Aborted, None, now);
            return;
        }
        let cycle = self.settings.cycle_time_min;
        let reading = self.sensors.read_numeric(&self.zones[idx].moisture_sensor);
        let zone = &mut self.zones[idx];
        let Some(session) = zone.session.clone() else {
            warn!(zone = %zone.id, "measurement without a session");
            zone.reset_runtime();
            return;
        };

        let final_moisture = reading
            .or_else(|| zone.last_moisture())
            .unwrap_or(session.pre_moisture);
        let increase = final_moisture - session.pre_moisture;
        let minutes_watered = session.cycles_started as f64 * cycle;

        zone.adjust_efficiency(increase, session.expected_increase);
        if minutes_watered > 0.0 {
            zone.soaking_efficiency = Some(increase / (minutes_watered / 60.0));
        }
        zone.learner
            .add_data_point(session.pre_moisture, final_moisture, minutes_watered);
        zone.moisture_deficit = deficit::apply_watering_outcome(
            zone.moisture_deficit,
            session.pre_moisture,
            final_moisture,
            zone.target_moisture(),
        );

        info!(
            zone = %zone.id,
            pre = format!("{:.1}", session.pre_moisture),
            post = format!("{final_moisture:.1}"),
            expected_gain = format!("{:.1}", session.expected_increase),
            efficiency = format!("{:.2}", zone.efficiency_factor),
            "watering complete"
        );
        let message = format!(
            "Finished watering {}: moisture {:.1}% -> {:.1}%",
            zone.name, session.pre_moisture, final_moisture
        );
        self.notify(message);
        self.finish_session(idx, SessionResult::Completed, Some(final_moisture), now);
        self.process_queue(now);
    }

    /// Close out the zone's session (if any) and return it to idle.
    pub(crate) fn finish_session(
        &mut self,
        idx: usize,
        result: SessionResult,
        final_moisture: Option<f64>,
        now: OffsetDateTime,
    ) {
        if let Some(t) = self.zones[idx].pending_timer.take() {
            self.timers.cancel(t);
        }
        let zone_id = self.zones[idx].id.clone();
        if let Some(soak) = self.queue.finish_soak(&zone_id) {
            if let Some(t) = soak.timer {
                self.timers.cancel(t);
            }
        }
        if self.zones[idx].state == ZoneState::Watering {
            self.turn_off(idx);
        }

        let cycle = self.settings.cycle_time_min;
        let zone = &mut self.zones[idx];
        if let Some(session) = zone.session.take() {
            if result != SessionResult::Completed {
                info!(zone = %zone.id, result = result.as_str(), "watering session ended early");
            }
            self.outbox.push(Outbound::SessionFinished(FinishedSession {
                zone_id: zone.id.clone(),
                started_at: session.started_at,
                ended_at: now,
                cycles: session.cycles_started,
                minutes: session.cycles_started as f64 * cycle,
                pre_moisture: Some(session.pre_moisture),
                final_moisture,
                result,
            }));
        }
        zone.reset_runtime();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
