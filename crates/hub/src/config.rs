//! TOML config file loading and validation for the controller settings and
//! the zone table.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

/// Installation-wide settings shared by every zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_cycle_time")]
    pub cycle_time_min: f64,
    #[serde(default = "default_soak_time")]
    pub soak_time_min: f64,
    /// Degrees Fahrenheit.
    #[serde(default = "default_freeze_threshold")]
    pub freeze_threshold: f64,
    #[serde(default = "default_rain_threshold")]
    pub rain_threshold_mm: f64,
    /// Name of the schedule signal (`schedule/<name>/state`).  No schedule
    /// means watering is allowed at any time.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Qualified sensor ref of an optional rain gauge.
    #[serde(default)]
    pub rain_sensor: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval_min: u64,
    /// UTC hour at which the daily ET/precipitation balance is applied.
    #[serde(default)]
    pub daily_update_hour: u8,
    /// How valves are driven.  The `ACTUATOR` env var overrides it.
    #[serde(default)]
    pub actuator: ActuatorKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorKind {
    /// Local relay board; every zone needs a `gpio_pin`.
    #[default]
    Gpio,
    /// Retained `valve/<actuator>/set` commands over the broker.
    Mqtt,
}

impl ActuatorKind {
    pub fn from_env_value(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gpio" => Ok(Self::Gpio),
            "mqtt" => Ok(Self::Mqtt),
            other => bail!("unknown actuator kind '{other}' (expected gpio or mqtt)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub name: String,
    /// Actuator ref commanded on/off (a relay name or MQTT valve id).
    pub actuator: String,
    /// BCM pin when driven by the local relay board.
    #[serde(default)]
    pub gpio_pin: Option<i64>,
    pub moisture_sensor: String,
    #[serde(default)]
    pub temperature_sensor: Option<String>,
    #[serde(default = "default_min_moisture")]
    pub min_moisture: f64,
    #[serde(default = "default_max_moisture")]
    pub max_moisture: f64,
    #[serde(default)]
    pub max_watering_hours: u32,
    #[serde(default = "default_max_watering_minutes")]
    pub max_watering_minutes: u32,
    #[serde(default = "default_crop_coefficient")]
    pub crop_coefficient: f64,
}

impl ZoneEntry {
    /// Cap on one session's total watering time.  Zero disables watering.
    pub fn max_watering_total_min(&self) -> f64 {
        self.max_watering_hours as f64 * 60.0 + self.max_watering_minutes as f64
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            cycle_time_min: default_cycle_time(),
            soak_time_min: default_soak_time(),
            freeze_threshold: default_freeze_threshold(),
            rain_threshold_mm: default_rain_threshold(),
            schedule: None,
            rain_sensor: None,
            enabled: true,
            check_interval_min: default_check_interval(),
            daily_update_hour: 0,
            actuator: ActuatorKind::Gpio,
        }
    }
}

fn default_cycle_time() -> f64 {
    15.0
}
fn default_soak_time() -> f64 {
    30.0
}
fn default_freeze_threshold() -> f64 {
    36.0
}
fn default_rain_threshold() -> f64 {
    3.0
}
fn default_true() -> bool {
    true
}
fn default_check_interval() -> u64 {
    5
}
fn default_min_moisture() -> f64 {
    20.0
}
fn default_max_moisture() -> f64 {
    25.0
}
fn default_max_watering_minutes() -> u32 {
    20
}
fn default_crop_coefficient() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_system(&mut errors);
        self.validate_zones(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Actuator -> pin pairs for the relay board.
    pub fn gpio_map(&self) -> Vec<(String, u8)> {
        self.zones
            .iter()
            .filter_map(|z| z.gpio_pin.map(|p| (z.actuator.clone(), p as u8)))
            .collect()
    }

    fn validate_system(&self, errors: &mut Vec<String>) {
        let s = &self.system;

        if !(s.cycle_time_min.is_finite() && s.cycle_time_min > 0.0) {
            errors.push(format!(
                "system: cycle_time_min must be positive, got {}",
                s.cycle_time_min
            ));
        }
        if !(s.soak_time_min.is_finite() && s.soak_time_min > 0.0) {
            errors.push(format!(
                "system: soak_time_min must be positive, got {}",
                s.soak_time_min
            ));
        }
        if !s.freeze_threshold.is_finite() {
            errors.push("system: freeze_threshold must be a number".to_string());
        }
        if !(s.rain_threshold_mm.is_finite() && s.rain_threshold_mm >= 0.0) {
            errors.push(format!(
                "system: rain_threshold_mm must not be negative, got {}",
                s.rain_threshold_mm
            ));
        }
        if s.check_interval_min == 0 {
            errors.push("system: check_interval_min must be positive".to_string());
        }
        if s.daily_update_hour > 23 {
            errors.push(format!(
                "system: daily_update_hour {} out of range [0, 23]",
                s.daily_update_hour
            ));
        }
        if let Some(name) = &s.schedule {
            if name.trim().is_empty() || name.contains('/') {
                errors.push(format!("system: schedule name '{name}' is not a valid topic segment"));
            }
        }
        if matches!(&s.rain_sensor, Some(r) if r.trim().is_empty()) {
            errors.push("system: rain_sensor is empty".to_string());
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_actuators: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.zone_id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.zone_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if z.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{}: duplicate zone_id", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── References ──────────────────────────────────────
            if z.actuator.trim().is_empty() {
                errors.push(format!("{}: actuator is empty", ctx()));
            } else if !seen_actuators.insert(&z.actuator) {
                errors.push(format!(
                    "{}: actuator '{}' is already used by another zone",
                    ctx(),
                    z.actuator
                ));
            }
            if z.moisture_sensor.trim().is_empty() {
                errors.push(format!("{}: moisture_sensor is empty", ctx()));
            }
            if matches!(&z.temperature_sensor, Some(t) if t.trim().is_empty()) {
                errors.push(format!("{}: temperature_sensor is empty", ctx()));
            }

            // ── Moisture bounds (percent) ───────────────────────
            if !(0.0..=100.0).contains(&z.min_moisture) {
                errors.push(format!(
                    "{}: min_moisture {} out of range [0, 100]",
                    ctx(),
                    z.min_moisture
                ));
            }
            if !(0.0..=100.0).contains(&z.max_moisture) {
                errors.push(format!(
                    "{}: max_moisture {} out of range [0, 100]",
                    ctx(),
                    z.max_moisture
                ));
            }
            if z.max_moisture <= z.min_moisture {
                errors.push(format!(
                    "{}: max_moisture ({}) must be greater than min_moisture ({})",
                    ctx(),
                    z.max_moisture,
                    z.min_moisture
                ));
            }

            // ── Watering limits ─────────────────────────────────
            if z.max_watering_minutes > 59 {
                errors.push(format!(
                    "{}: max_watering_minutes must be below 60, got {}",
                    ctx(),
                    z.max_watering_minutes
                ));
            }
            if !(z.crop_coefficient.is_finite() && z.crop_coefficient > 0.0) {
                errors.push(format!(
                    "{}: crop_coefficient must be positive, got {}",
                    ctx(),
                    z.crop_coefficient
                ));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if z.gpio_pin.is_none() && self.system.actuator == ActuatorKind::Gpio {
                errors.push(format!(
                    "{}: gpio_pin is required when valves are driven by the relay board",
                    ctx()
                ));
            }
            if let Some(pin) = z.gpio_pin {
                if !VALID_GPIO_PINS.contains(&pin) {
                    errors.push(format!(
                        "{}: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                        ctx(),
                        pin
                    ));
                } else if !seen_pins.insert(pin) {
                    errors.push(format!(
                        "{}: gpio_pin {} is already used by another zone",
                        ctx(),
                        pin
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.  `actuator` overrides the
/// file's `system.actuator` before validation.
pub fn load(path: &str, actuator: Option<ActuatorKind>) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    if let Some(kind) = actuator {
        config.system.actuator = kind;
    }
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        zones = config.zones.len(),
        schedule = config.system.schedule.as_deref().unwrap_or("-"),
        enabled = config.system.enabled,
        actuator = ?config.system.actuator,
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_zone() -> ZoneEntry {
        ZoneEntry {
            zone_id: "z1".into(),
            name: "Front lawn".into(),
            actuator: "relay-1".into(),
            gpio_pin: Some(17),
            moisture_sensor: "node-a/s1".into(),
            temperature_sensor: Some("node-a/t1".into()),
            min_moisture: 20.0,
            max_moisture: 25.0,
            max_watering_hours: 0,
            max_watering_minutes: 20,
            crop_coefficient: 1.0,
        }
    }

    fn valid_config() -> Config {
        Config {
            system: SystemConfig::default(),
            zones: vec![valid_zone()],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let toml_str = r#"
[[zones]]
zone_id = "z1"
name = "Front lawn"
actuator = "relay-1"
moisture_sensor = "node-a/s1"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.system, SystemConfig::default());
        assert_eq!(config.system.cycle_time_min, 15.0);
        assert_eq!(config.system.soak_time_min, 30.0);
        assert_eq!(config.system.freeze_threshold, 36.0);
        assert_eq!(config.system.rain_threshold_mm, 3.0);
        assert!(config.system.enabled);

        let z = &config.zones[0];
        assert_eq!(z.min_moisture, 20.0);
        assert_eq!(z.max_moisture, 25.0);
        assert_eq!(z.max_watering_total_min(), 20.0);
        assert_eq!(z.crop_coefficient, 1.0);
        assert_eq!(z.gpio_pin, None);
        assert_eq!(z.temperature_sensor, None);
        assert_eq!(config.system.actuator, ActuatorKind::Gpio);
        assert_validation_err(&config, "gpio_pin is required");
    }

    #[test]
    fn parse_mqtt_actuator() {
        let toml_str = r#"
[system]
actuator = "mqtt"

[[zones]]
zone_id = "z1"
name = "Front lawn"
actuator = "relay-1"
moisture_sensor = "node-a/s1"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.system.actuator, ActuatorKind::Mqtt);
        config.validate().unwrap();
    }

    #[test]
    fn load_applies_actuator_override_before_validation() {
        let path = std::env::temp_dir().join(format!("sprinkler-cfg-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[[zones]]
zone_id = "z1"
name = "Front lawn"
actuator = "relay-1"
moisture_sensor = "node-a/s1"
"#,
        )
        .unwrap();
        let path_str = path.to_str().unwrap();

        assert!(load(path_str, None).is_err());
        let config = load(path_str, Some(ActuatorKind::Mqtt)).unwrap();
        assert_eq!(config.system.actuator, ActuatorKind::Mqtt);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn actuator_kind_from_env_value() {
        assert_eq!(ActuatorKind::from_env_value("MQTT").unwrap(), ActuatorKind::Mqtt);
        assert_eq!(ActuatorKind::from_env_value(" gpio ").unwrap(), ActuatorKind::Gpio);
        assert!(ActuatorKind::from_env_value("relay").is_err());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[system]
cycle_time_min = 10
soak_time_min = 20
freeze_threshold = 34.5
rain_threshold_mm = 5
schedule = "night"
rain_sensor = "roof/rain"
enabled = false
check_interval_min = 2
daily_update_hour = 4

[[zones]]
zone_id = "z1"
name = "Front lawn"
actuator = "relay-1"
gpio_pin = 17
moisture_sensor = "node-a/s1"
temperature_sensor = "node-a/t1"
min_moisture = 18
max_moisture = 30
max_watering_hours = 1
max_watering_minutes = 30
crop_coefficient = 0.8
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.system.schedule.as_deref(), Some("night"));
        assert_eq!(config.system.daily_update_hour, 4);
        assert!(!config.system.enabled);
        assert_eq!(config.zones[0].max_watering_total_min(), 90.0);
        assert_eq!(config.gpio_map(), vec![("relay-1".to_string(), 17)]);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.zones.is_empty());
        config.validate().unwrap();
    }

    // -- System section ---------------------------------------------------

    #[test]
    fn system_cycle_time_must_be_positive() {
        let mut cfg = valid_config();
        cfg.system.cycle_time_min = 0.0;
        assert_validation_err(&cfg, "cycle_time_min must be positive");
    }

    #[test]
    fn system_soak_time_must_be_positive() {
        let mut cfg = valid_config();
        cfg.system.soak_time_min = -1.0;
        assert_validation_err(&cfg, "soak_time_min must be positive");
    }

    #[test]
    fn system_negative_rain_threshold_rejected() {
        let mut cfg = valid_config();
        cfg.system.rain_threshold_mm = -2.0;
        assert_validation_err(&cfg, "rain_threshold_mm");
    }

    #[test]
    fn system_daily_hour_out_of_range() {
        let mut cfg = valid_config();
        cfg.system.daily_update_hour = 24;
        assert_validation_err(&cfg, "daily_update_hour 24");
    }

    #[test]
    fn system_schedule_name_with_slash_rejected() {
        let mut cfg = valid_config();
        cfg.system.schedule = Some("a/b".into());
        assert_validation_err(&cfg, "not a valid topic segment");
    }

    // -- Zone: identity ---------------------------------------------------

    #[test]
    fn zone_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].zone_id = "".into();
        assert_validation_err(&cfg, "zone_id is empty");
    }

    #[test]
    fn zone_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(ZoneEntry {
            actuator: "relay-2".into(),
            gpio_pin: Some(27),
            ..valid_zone()
        });
        assert_validation_err(&cfg, "duplicate zone_id");
    }

    #[test]
    fn zone_shared_actuator_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(ZoneEntry {
            zone_id: "z2".into(),
            gpio_pin: Some(27),
            ..valid_zone()
        });
        assert_validation_err(&cfg, "actuator 'relay-1' is already used");
    }

    #[test]
    fn zone_empty_moisture_sensor_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].moisture_sensor = " ".into();
        assert_validation_err(&cfg, "moisture_sensor is empty");
    }

    // -- Zone: moisture bounds --------------------------------------------

    #[test]
    fn zone_min_moisture_out_of_range() {
        let mut cfg = valid_config();
        cfg.zones[0].min_moisture = -1.0;
        assert_validation_err(&cfg, "min_moisture -1 out of range");
    }

    #[test]
    fn zone_max_must_exceed_min() {
        let mut cfg = valid_config();
        cfg.zones[0].min_moisture = 30.0;
        cfg.zones[0].max_moisture = 30.0;
        assert_validation_err(
            &cfg,
            "max_moisture (30) must be greater than min_moisture (30)",
        );
    }

    // -- Zone: limits -----------------------------------------------------

    #[test]
    fn zone_minutes_must_be_below_sixty() {
        let mut cfg = valid_config();
        cfg.zones[0].max_watering_minutes = 60;
        assert_validation_err(&cfg, "max_watering_minutes must be below 60");
    }

    #[test]
    fn zone_zero_watering_time_is_allowed() {
        let mut cfg = valid_config();
        cfg.zones[0].max_watering_minutes = 0;
        cfg.validate().unwrap();
        assert_eq!(cfg.zones[0].max_watering_total_min(), 0.0);
    }

    #[test]
    fn zone_crop_coefficient_must_be_positive() {
        let mut cfg = valid_config();
        cfg.zones[0].crop_coefficient = 0.0;
        assert_validation_err(&cfg, "crop_coefficient must be positive");
    }

    // -- Zone: GPIO whitelist ---------------------------------------------

    #[test]
    fn zone_gpio_pin_1_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].gpio_pin = Some(1);
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn zone_gpio_pin_28_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].gpio_pin = Some(28);
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn zone_without_gpio_pin_rejected_for_relay_board() {
        let mut cfg = valid_config();
        cfg.zones[0].gpio_pin = None;
        assert_validation_err(&cfg, "zone 'z1': gpio_pin is required");
    }

    #[test]
    fn zone_without_gpio_pin_accepted_for_mqtt_valves() {
        let mut cfg = valid_config();
        cfg.system.actuator = ActuatorKind::Mqtt;
        cfg.zones[0].gpio_pin = None;
        cfg.validate().unwrap();
        assert!(cfg.gpio_map().is_empty());
    }

    #[test]
    fn zone_duplicate_gpio_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(ZoneEntry {
            zone_id: "z2".into(),
            name: "Back lawn".into(),
            actuator: "relay-2".into(),
            ..valid_zone()
        });
        assert_validation_err(&cfg, "already used by another zone");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let cfg = Config {
            system: SystemConfig {
                cycle_time_min: 0.0,
                ..SystemConfig::default()
            },
            zones: vec![ZoneEntry {
                zone_id: "".into(),
                name: "".into(),
                min_moisture: -1.0,
                gpio_pin: Some(0),
                ..valid_zone()
            }],
        };
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("cycle_time_min"), "missing system error in: {msg}");
        assert!(msg.contains("zone_id is empty"), "missing zone_id error in: {msg}");
        assert!(msg.contains("min_moisture"), "missing moisture error in: {msg}");
        assert!(
            msg.contains("not a valid BCM GPIO pin"),
            "missing gpio error in: {msg}"
        );
    }
}
