//! Schedule window gate.
//!
//! The window itself is owned by an external signal published on
//! `schedule/<name>/state`.  This module remembers the last signal and
//! answers two questions for the queue: may new watering start, and how many
//! minutes are left.
//!
//! ```text
//!            ON                      OFF
//! (none) ──────────▶ Open ◀──────▶ Closed
//!                     │  ▲
//!        unavailable  ▼  │ ON
//!                  Unavailable
//! ```
//!
//! `Unavailable` is treated like a closed window for new starts, but it is
//! not a reason to stop zones that are already mid-session.

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Queued work is dropped when the window ends sooner than this.
pub const SAFETY_MARGIN_MIN: f64 = 10.0;

/// Below this the check logs that the window is about to close.
const WARN_MARGIN_MIN: f64 = 15.0;

/// Longest remaining time taken from the signal; anything beyond is capped.
pub const MAX_WINDOW_MIN: f64 = 24.0 * 60.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Open,
    Closed,
    Unavailable,
}

/// One message from the schedule signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleUpdate {
    On { remaining_minutes: Option<f64> },
    Off,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    Closed,
    BecameUnavailable,
    Unchanged,
}

/// What the periodic check wants the controller to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleCheck {
    pub evaluate_all: bool,
    pub stop_all: bool,
    pub clear_queue: bool,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    name: Option<String>,
    status: ScheduleStatus,
    ends_at: Option<OffsetDateTime>,
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

impl Scheduler {
    /// Without a schedule name the window is permanently open.  With one,
    /// nothing may start until the first signal arrives.
    pub fn new(name: Option<String>) -> Self {
        let status = if name.is_some() {
            ScheduleStatus::Unavailable
        } else {
            ScheduleStatus::Open
        };
        Self {
            name,
            status,
            ends_at: None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.name.is_some()
    }

    pub fn status(&self) -> ScheduleStatus {
        self.status
    }

    pub fn is_in_schedule(&self) -> bool {
        self.status == ScheduleStatus::Open
    }

    pub fn apply(&mut self, update: ScheduleUpdate, now: OffsetDateTime) -> Transition {
        if !self.is_configured() {
            warn!("scheduler: schedule signal received but no schedule is configured");
            return Transition::Unchanged;
        }

        let before = self.status;
        match update {
            ScheduleUpdate::On { remaining_minutes } => {
                self.status = ScheduleStatus::Open;
                self.ends_at = window_end(now, remaining_minutes);
            }
            ScheduleUpdate::Off => {
                self.status = ScheduleStatus::Closed;
                self.ends_at = None;
            }
            ScheduleUpdate::Unavailable => {
                self.status = ScheduleStatus::Unavailable;
                self.ends_at = None;
            }
        }

        match (before, self.status) {
            (a, b) if a == b => Transition::Unchanged,
            (_, ScheduleStatus::Open) => Transition::Opened,
            (_, ScheduleStatus::Closed) => Transition::Closed,
            (_, ScheduleStatus::Unavailable) => Transition::BecameUnavailable,
        }
    }

    /// Minutes left in the window: `None` when no end is known, `Some(0.0)`
    /// outside the window.
    pub fn remaining_minutes(&self, now: OffsetDateTime) -> Option<f64> {
        if !self.is_configured() {
            return None;
        }
        if self.status != ScheduleStatus::Open {
            return Some(0.0);
        }
        self.ends_at
            .map(|end| ((end - now).as_seconds_f64() / 60.0).max(0.0))
    }

    // -----------------------------------------------------------------------
    // Periodic check
    // -----------------------------------------------------------------------

    /// `busy` is true while any zone is mid-session; `queued` counts zones
    /// waiting for a slot.
    pub fn check(&self, now: OffsetDateTime, busy: bool, queued: usize) -> ScheduleCheck {
        let mut decision = ScheduleCheck::default();

        match self.status {
            ScheduleStatus::Closed => {
                if busy || queued > 0 {
                    info!(queued, "scheduler: window closed with work pending, stopping all");
                    decision.stop_all = true;
                }
                return decision;
            }
            ScheduleStatus::Unavailable => return decision,
            ScheduleStatus::Open => {}
        }

        if let Some(remaining) = self.remaining_minutes(now) {
            if remaining < SAFETY_MARGIN_MIN {
                if queued > 0 {
                    info!(
                        remaining_min = format!("{remaining:.1}"),
                        queued,
                        "scheduler: window ending, clearing queue"
                    );
                    decision.clear_queue = true;
                }
                return decision;
            }
            if remaining < WARN_MARGIN_MIN {
                warn!(
                    remaining_min = format!("{remaining:.1}"),
                    "scheduler: window ends soon"
                );
            }
        }

        if !busy && queued == 0 {
            decision.evaluate_all = true;
        }
        decision
    }
}

/// End instant for a window with `minutes` left.  Negative or non-finite
/// values mean no known end; huge ones are capped at [`MAX_WINDOW_MIN`].
fn window_end(now: OffsetDateTime, minutes: Option<f64>) -> Option<OffsetDateTime> {
    let minutes = minutes.filter(|m| m.is_finite() && *m >= 0.0)?;
    if minutes > MAX_WINDOW_MIN {
        warn!(
            remaining_min = minutes,
            "scheduler: remaining time out of range, capping at one day"
        );
    }
    now.checked_add(Duration::seconds_f64(minutes.min(MAX_WINDOW_MIN) * 60.0))
}

// ===========================================================================
// Tests
// ===========================================================================
