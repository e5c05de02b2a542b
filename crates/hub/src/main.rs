use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sprinkler_hub::config::{self, ActuatorKind};
use sprinkler_hub::controller::{Controller, ControllerHandle, CHANNEL_CAPACITY};
use sprinkler_hub::coordinator::Coordinator;
use sprinkler_hub::db::Db;
use sprinkler_hub::mqtt::{
    handle_publish, MqttValves, TOPIC_FORECAST, TOPIC_READINGS, TOPIC_SCHEDULES,
};
use sprinkler_hub::state::SystemState;
use sprinkler_hub::timers::TokioTimers;
use sprinkler_hub::valve::{Actuator, ValveBoard};
use sprinkler_hub::web::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:sprinklers.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let actuator_override = env::var("ACTUATOR")
        .ok()
        .map(|v| ActuatorKind::from_env_value(&v))
        .transpose()?;

    // ── Config file (system settings + zone table) ──────────────────
    let cfg = config::load(&config_path, actuator_override)?;
    if cfg.zones.is_empty() {
        warn!("no zones configured");
    }
    let zone_ids: Vec<String> = cfg.zones.iter().map(|z| z.zone_id.clone()).collect();

    // ── Database (session journal) ──────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    info!(url = %db_url, "session journal ready");

    // ── MQTT client ─────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("sprinkler-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

    // ── Actuators ───────────────────────────────────────────────────
    let actuator: Box<dyn Actuator> = match cfg.system.actuator {
        ActuatorKind::Mqtt => {
            info!("valves driven over mqtt");
            Box::new(MqttValves::new(client.clone()))
        }
        ActuatorKind::Gpio => {
            // Many common relay boards are active-low. If yours is active-high, set false.
            let active_low = env::var("RELAY_ACTIVE_LOW")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true);
            let mut board = ValveBoard::new(&cfg.gpio_map(), active_low)?;
            board.all_off();
            Box::new(board)
        }
    };

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = SystemState::shared(&zone_ids);
    shared.write().await.record_system("hub started".to_string());

    // ── Controller ──────────────────────────────────────────────────
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let timers = TokioTimers::new(&tx);
    let coordinator = Coordinator::new(&cfg, actuator, Box::new(timers));
    let controller = ControllerHandle::new(tx);
    tokio::spawn(
        Controller::new(coordinator, rx, shared.clone())
            .with_db(db.clone())
            .with_mqtt(client.clone())
            .run(),
    );

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        shared: shared.clone(),
        controller: controller.clone(),
        db: Some(db),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── MQTT loop ───────────────────────────────────────────────────
    let schedule = cfg.system.schedule.clone();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => {
                info!("interrupt received");
                break;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if let Err(e) =
                    handle_publish(&p.topic, &p.payload, schedule.as_deref(), &controller, &shared)
                        .await
                {
                    error!("controller unavailable: {e:#}");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Subscriptions do not survive a clean-session reconnect.
                for topic in [TOPIC_READINGS, TOPIC_SCHEDULES, TOPIC_FORECAST] {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                        warn!(topic, "subscribe failed: {e}");
                    }
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                // Best-effort fail-safe: stop watering while blind to sensors.
                if let Err(e) = controller.stop_all().await {
                    error!("stop on mqtt error failed: {e:#}");
                }

                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }

    if let Err(e) = controller.emergency_shutdown().await {
        error!("emergency shutdown failed: {e:#}");
    }
    info!("hub stopped");
    Ok(())
}
