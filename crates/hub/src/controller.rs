//! The controller actor.
//!
//! One task owns the [`Coordinator`] and applies [`Command`]s to it in
//! arrival order: sensor readings, schedule signals, timer expiries and
//! service calls all go through the same channel.  After every step the
//! coordinator's outbox is flushed to the shared web state, the session
//! journal and MQTT.
//!
//! When every [`ControllerHandle`] is dropped the channel closes and the
//! actor performs an emergency shutdown before returning.

use std::time::Duration;

use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, QoS};
use time::{OffsetDateTime, Time};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::coordinator::{ControllerStatus, Coordinator, Outbound};
use crate::db::Db;
use crate::mqtt::{TOPIC_FORECAST_REFRESH, TOPIC_NOTIFY};
use crate::scheduler::ScheduleUpdate;
use crate::state::SharedState;
use crate::timers::{minutes, TimerEvent, TimerId};
use crate::weather::Forecast;

pub const CHANNEL_CAPACITY: usize = 64;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub enum Command {
    Reading { sensor: String, value: Option<f64> },
    Schedule(ScheduleUpdate),
    Forecast(Forecast),
    Timer { id: TimerId, event: TimerEvent },
    EvaluateAll,
    ManualStart(Option<Vec<String>>),
    Enable,
    Disable,
    StopAll,
    EmergencyShutdown { ack: Option<oneshot::Sender<()>> },
    ResetStatistics,
    RefreshForecast,
    UpdateDeficit,
    Status { reply: oneshot::Sender<ControllerStatus> },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// A handle with a bare receiver, for driving a handle without an actor.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("controller is not running"))
    }

    pub async fn reading(&self, sensor: String, value: Option<f64>) -> Result<()> {
        self.send(Command::Reading { sensor, value }).await
    }

    pub async fn schedule(&self, update: ScheduleUpdate) -> Result<()> {
        self.send(Command::Schedule(update)).await
    }

    pub async fn forecast(&self, forecast: Forecast) -> Result<()> {
        self.send(Command::Forecast(forecast)).await
    }

    pub async fn evaluate_all(&self) -> Result<()> {
        self.send(Command::EvaluateAll).await
    }

    pub async fn manual_start(&self, zones: Option<Vec<String>>) -> Result<()> {
        self.send(Command::ManualStart(zones)).await
    }

    pub async fn enable(&self) -> Result<()> {
        self.send(Command::Enable).await
    }

    pub async fn disable(&self) -> Result<()> {
        self.send(Command::Disable).await
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.send(Command::StopAll).await
    }

    /// Returns once the shutdown has been applied and flushed.
    pub async fn emergency_shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::EmergencyShutdown { ack: Some(ack) }).await?;
        done.await
            .map_err(|_| anyhow!("controller stopped before acknowledging shutdown"))
    }

    pub async fn reset_statistics(&self) -> Result<()> {
        self.send(Command::ResetStatistics).await
    }

    pub async fn refresh_forecast(&self) -> Result<()> {
        self.send(Command::RefreshForecast).await
    }

    pub async fn update_deficit(&self) -> Result<()> {
        self.send(Command::UpdateDeficit).await
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| anyhow!("controller dropped status request"))
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub struct Controller {
    coordinator: Coordinator,
    rx: mpsc::Receiver<Command>,
    shared: SharedState,
    db: Option<Db>,
    mqtt: Option<AsyncClient>,
}

impl Controller {
    pub fn new(coordinator: Coordinator, rx: mpsc::Receiver<Command>, shared: SharedState) -> Self {
        Self {
            coordinator,
            rx,
            shared,
            db: None,
            mqtt: None,
        }
    }

    pub fn with_db(mut self, db: Db) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_mqtt(mut self, client: AsyncClient) -> Self {
        self.mqtt = Some(client);
        self
    }

    pub async fn run(mut self) {
        let settings = self.coordinator.settings.clone();
        let period = minutes(settings.check_interval_min.max(1) as f64);
        let mut check = interval_at(Instant::now() + period, period);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let first_daily = until_daily(OffsetDateTime::now_utc(), settings.daily_update_hour);
        let mut daily = interval_at(Instant::now() + first_daily, DAY);
        daily.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            check_every_min = settings.check_interval_min,
            daily_in_min = first_daily.as_secs() / 60,
            "controller running"
        );
        self.flush(None).await;

        loop {
            let ack = tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
                _ = check.tick() => {
                    self.coordinator.check_schedule(OffsetDateTime::now_utc());
                    None
                }
                _ = daily.tick() => {
                    self.coordinator.apply_daily_balance();
                    None
                }
            };
            self.flush(ack).await;
        }

        info!("command channel closed, shutting down");
        self.coordinator.emergency_shutdown(OffsetDateTime::now_utc());
        self.flush(None).await;
    }

    /// Apply one command.  Returns a shutdown acknowledgement to send once
    /// the resulting outbox has been flushed.
    fn apply(&mut self, cmd: Command) -> Option<oneshot::Sender<()>> {
        let now = OffsetDateTime::now_utc();
        let c = &mut self.coordinator;
        match cmd {
            Command::Reading { sensor, value } => c.handle_reading(&sensor, value, now),
            Command::Schedule(update) => c.handle_schedule(update, now),
            Command::Forecast(forecast) => c.handle_forecast(forecast, now),
            Command::Timer { id, event } => c.handle_timer(id, event, now),
            Command::EvaluateAll => c.evaluate_all(now),
            Command::ManualStart(zones) => {
                c.manual_start(zones, now);
            }
            Command::Enable => c.enable(now),
            Command::Disable => c.disable(now),
            Command::StopAll => c.stop_all("stop requested", now),
            Command::EmergencyShutdown { ack } => {
                c.emergency_shutdown(now);
                return ack;
            }
            Command::ResetStatistics => c.reset_statistics(),
            Command::RefreshForecast => c.refresh_forecast(),
            Command::UpdateDeficit => c.update_deficit(),
            Command::Status { reply } => {
                // Requester may have given up.
                let _ = reply.send(c.status(now));
            }
        }
        None
    }

    async fn flush(&mut self, ack: Option<oneshot::Sender<()>>) {
        let outbox = self.coordinator.take_outbox();
        let status = self.coordinator.status(OffsetDateTime::now_utc());
        let mut finished = Vec::new();

        {
            let mut st = self.shared.write().await;
            for item in outbox {
                match item {
                    Outbound::Notify(message) => {
                        self.publish(TOPIC_NOTIFY, message.clone());
                        st.record_notification(message);
                    }
                    Outbound::Valve { zone, on } => st.record_valve(&zone, on),
                    Outbound::ForecastRefresh => {
                        self.publish(TOPIC_FORECAST_REFRESH, String::new());
                        st.record_system("forecast refresh requested".to_string());
                    }
                    Outbound::SessionFinished(session) => finished.push(session),
                }
            }
            st.set_controller(status);
        }

        if let Some(db) = &self.db {
            for session in &finished {
                match db.insert_session(session).await {
                    Ok(id) => debug!(zone = %session.zone_id, id, "session journaled"),
                    Err(e) => warn!(zone = %session.zone_id, "session journal write failed: {e:#}"),
                }
            }
        }

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn publish(&self, topic: &str, payload: String) {
        let Some(client) = &self.mqtt else {
            return;
        };
        if let Err(e) = client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            warn!(topic, "mqtt publish failed: {e}");
        }
    }
}

/// Time from `now` until the next `hour:00` UTC.
pub fn until_daily(now: OffsetDateTime, hour: u8) -> Duration {
    let at = Time::from_hms(hour, 0, 0).unwrap_or(Time::MIDNIGHT);
    let mut next = now.replace_time(at);
    if next <= now {
        next += time::Duration::days(1);
    }
    (next - now).unsigned_abs()
}

// ===========================================================================
// Tests
// ===========================================================================
