//! Deferred zone events (cycle end, soak end, final measurement).
//!
//! Timers never call back into zone code directly.  Each one is a typed
//! event that is delivered to the controller actor as a [`Command::Timer`],
//! so the zone table is only ever touched by the actor itself.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::controller::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    CycleEnd { zone: String },
    SoakEnd { zone: String },
    FinalMeasurement { zone: String },
}

impl TimerEvent {
    pub fn zone(&self) -> &str {
        match self {
            TimerEvent::CycleEnd { zone }
            | TimerEvent::SoakEnd { zone }
            | TimerEvent::FinalMeasurement { zone } => zone,
        }
    }
}

pub fn minutes(min: f64) -> Duration {
    Duration::from_secs_f64((min * 60.0).max(0.0))
}

pub trait TimerService: Send {
    fn schedule(&mut self, after: Duration, event: TimerEvent) -> TimerId;
    /// Cancelling an unknown or already fired timer is a no-op.
    fn cancel(&mut self, id: TimerId);
    fn cancel_all(&mut self);
    /// Forget the bookkeeping of a timer that has been delivered.
    fn fired(&mut self, id: TimerId);
}

// ---------------------------------------------------------------------------
// Tokio implementation
// ---------------------------------------------------------------------------

/// One sleeping task per timer.  The tasks hold only a weak sender so a
/// pending timer never keeps the controller's channel open.
pub struct TokioTimers {
    tx: mpsc::WeakSender<Command>,
    next_id: u64,
    handles: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioTimers {
    pub fn new(tx: &mpsc::Sender<Command>) -> Self {
        Self {
            tx: tx.downgrade(),
            next_id: 0,
            handles: HashMap::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.handles.len()
    }
}

impl TimerService for TokioTimers {
    fn schedule(&mut self, after: Duration, event: TimerEvent) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let tx = self.tx.clone();

        debug!(timer = %id, zone = %event.zone(), after_sec = after.as_secs(), "timer scheduled");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                // Receiver gone means the controller already shut down.
                let _ = tx.send(Command::Timer { id, event }).await;
            }
        });
        self.handles.insert(id, handle);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.handles.remove(&id) {
            handle.abort();
            debug!(timer = %id, "timer cancelled");
        }
    }

    fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }

    fn fired(&mut self, id: TimerId) {
        self.handles.remove(&id);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
