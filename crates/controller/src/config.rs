//! TOML config file loading, validation, and database seeding for crops and
//! sensors.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use time::UtcOffset;
use tracing::warn;

use crate::calendar::parse_utc_offset;
use crate::db::{CropSeed, Db, SensorSeed};
use crate::hardware::ProbeKind;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub hardware: HardwareSettings,
    #[serde(default)]
    pub crops: Vec<CropEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ControllerSettings {
    /// Seconds between auto-mode checks.
    #[serde(default = "default_auto_interval")]
    pub auto_interval_sec: u64,
    /// Seconds between schedule checks, at most 60. Shorter intervals do not
    /// fire a schedule twice in one minute.
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval_sec: u64,
    #[serde(default)]
    pub auto_mode_on_start: bool,
    /// `+HH:MM` offset schedules are evaluated in. Unset means the host's
    /// local offset.
    #[serde(default)]
    pub utc_offset: Option<String>,
}

fn default_auto_interval() -> u64 {
    30
}

fn default_schedule_interval() -> u64 {
    60
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            auto_interval_sec: default_auto_interval(),
            schedule_interval_sec: default_schedule_interval(),
            auto_mode_on_start: false,
            utc_offset: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HardwareSettings {
    #[serde(default)]
    pub probe: ProbeKind,
    /// Fixed seed for the simulated probe's drift.
    #[serde(default)]
    pub simulation_seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CropEntry {
    pub name: String,
    pub min_moisture: i64,
    pub max_moisture: i64,
    pub water_amount: i64,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub id: i64,
    /// Crop name; a sensor may start with no crop.
    #[serde(default)]
    pub crop: Option<String>,
    pub pin: i64,
    #[serde(default)]
    pub adc_channel: i64,
    #[serde(default = "default_initial_moisture")]
    pub initial_moisture: f64,
}

fn default_initial_moisture() -> f64 {
    50.0
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// MCP3008 single-ended channels.
const ADC_CHANNELS: std::ops::RangeInclusive<i64> = 0..=7;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_crops(&mut errors);
        self.validate_sensors(&mut errors);

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

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        if c.auto_interval_sec == 0 {
            errors.push("controller: auto_interval_sec must be positive".to_string());
        }
        if !(1..=60).contains(&c.schedule_interval_sec) {
            errors.push(format!(
                "controller: schedule_interval_sec {} out of range [1, 60]",
                c.schedule_interval_sec
            ));
        }
        if let Some(offset) = &c.utc_offset {
            if let Err(e) = parse_utc_offset(offset) {
                errors.push(format!("controller: {e:#}"));
            }
        }
    }

    fn validate_crops(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();

        for (i, c) in self.crops.iter().enumerate() {
            let ctx = || {
                if c.name.trim().is_empty() {
                    format!("crops[{i}]")
                } else {
                    format!("crop '{}'", c.name)
                }
            };

            if c.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&c.name) {
                errors.push(format!("{}: duplicate crop name", ctx()));
            }

            // ── Moisture band ───────────────────────────────────
            if !(0..=100).contains(&c.min_moisture) {
                errors.push(format!(
                    "{}: min_moisture {} out of range [0, 100]",
                    ctx(),
                    c.min_moisture
                ));
            }
            if !(0..=100).contains(&c.max_moisture) {
                errors.push(format!(
                    "{}: max_moisture {} out of range [0, 100]",
                    ctx(),
                    c.max_moisture
                ));
            }
            if c.max_moisture <= c.min_moisture {
                errors.push(format!(
                    "{}: max_moisture ({}) must be greater than min_moisture ({})",
                    ctx(),
                    c.max_moisture,
                    c.min_moisture
                ));
            }

            if c.water_amount < 0 {
                errors.push(format!(
                    "{}: water_amount must not be negative, got {}",
                    ctx(),
                    c.water_amount
                ));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let crop_names: HashSet<&str> = self.crops.iter().map(|c| c.name.as_str()).collect();
        let mut seen_ids: HashSet<i64> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();
        let mut seen_channels: HashSet<i64> = HashSet::new();

        for s in &self.sensors {
            let ctx = format!("sensor {}", s.id);

            // ── Identity ────────────────────────────────────────
            if s.id <= 0 {
                errors.push(format!("{ctx}: id must be positive"));
            } else if !seen_ids.insert(s.id) {
                errors.push(format!("{ctx}: duplicate sensor id"));
            }

            if let Some(crop) = &s.crop {
                if !crop_names.contains(crop.as_str()) {
                    errors.push(format!("{ctx}: crop '{crop}' does not match any defined crop"));
                }
            }

            // ── Wiring ──────────────────────────────────────────
            if !VALID_GPIO_PINS.contains(&s.pin) {
                errors.push(format!(
                    "{ctx}: pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    s.pin
                ));
            } else if !seen_pins.insert(s.pin) {
                errors.push(format!("{ctx}: pin {} is already used by another sensor", s.pin));
            }

            if !ADC_CHANNELS.contains(&s.adc_channel) {
                errors.push(format!(
                    "{ctx}: adc_channel {} out of MCP3008 range [0, 7]",
                    s.adc_channel
                ));
            } else if !seen_channels.insert(s.adc_channel) {
                errors.push(format!(
                    "{ctx}: adc_channel {} is already used by another sensor",
                    s.adc_channel
                ));
            }

            if !(0.0..=100.0).contains(&s.initial_moisture) {
                errors.push(format!(
                    "{ctx}: initial_moisture {} out of range [0, 100]",
                    s.initial_moisture
                ));
            }
        }
    }

    pub fn auto_interval(&self) -> Duration {
        Duration::from_secs(self.controller.auto_interval_sec)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.controller.schedule_interval_sec)
    }

    /// Offset schedules are matched in: the configured one, else the host's
    /// local offset, else UTC.
    pub fn clock_offset(&self) -> Result<UtcOffset> {
        if let Some(offset) = &self.controller.utc_offset {
            return parse_utc_offset(offset);
        }
        match UtcOffset::current_local_offset() {
            Ok(offset) => Ok(offset),
            Err(e) => {
                warn!("local utc offset unavailable ({e}); schedules run on UTC");
                Ok(UtcOffset::UTC)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all crops and sensors from the config into the database. Sensors
/// already in the database keep their current moisture.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let mut crop_ids: HashMap<&str, i64> = HashMap::new();

    for c in &config.crops {
        let id = db
            .upsert_crop(&CropSeed {
                name: c.name.clone(),
                min_moisture: c.min_moisture,
                max_moisture: c.max_moisture,
                water_amount: c.water_amount,
                description: c.description.clone(),
            })
            .await
            .with_context(|| format!("failed to upsert crop '{}'", c.name))?;
        crop_ids.insert(c.name.as_str(), id);
    }

    for s in &config.sensors {
        let crop_id = match &s.crop {
            Some(name) => Some(
                *crop_ids
                    .get(name.as_str())
                    .with_context(|| format!("sensor {}: unknown crop '{name}'", s.id))?,
            ),
            None => None,
        };
        db.upsert_sensor(&SensorSeed {
            id: s.id,
            crop_id,
            pin: s.pin,
            adc_channel: s.adc_channel,
            initial_moisture: s.initial_moisture,
        })
        .await
        .with_context(|| format!("failed to upsert sensor {}", s.id))?;
    }

    tracing::info!(
        crops = config.crops.len(),
        sensors = config.sensors.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_crop() -> CropEntry {
        CropEntry {
            name: "Tomato".into(),
            min_moisture: 60,
            max_moisture: 80,
            water_amount: 500,
            description: Some("Consistent moisture".into()),
        }
    }

    fn valid_sensor() -> SensorEntry {
        SensorEntry {
            id: 1,
            crop: Some("Tomato".into()),
            pin: 17,
            adc_channel: 0,
            initial_moisture: 50.0,
        }
    }

    fn valid_config() -> Config {
        Config {
            crops: vec![valid_crop()],
            sensors: vec![valid_sensor()],
            ..Config::default()
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
    fn parse_full_config() {
        let toml_str = r#"
[controller]
auto_interval_sec = 15
schedule_interval_sec = 20
auto_mode_on_start = true
utc_offset = "+02:00"

[hardware]
probe = "gpio"
simulation_seed = 7

[[crops]]
name = "Tomato"
min_moisture = 60
max_moisture = 80
water_amount = 500

[[sensors]]
id = 1
crop = "Tomato"
pin = 17
adc_channel = 0

[[sensors]]
id = 2
pin = 27
adc_channel = 1
initial_moisture = 35.5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.controller.auto_interval_sec, 15);
        assert!(config.controller.auto_mode_on_start);
        assert_eq!(config.hardware.probe, ProbeKind::Gpio);
        assert_eq!(config.hardware.simulation_seed, Some(7));
        assert_eq!(config.crops[0].description, None);
        assert_eq!(config.sensors[0].initial_moisture, 50.0);
        assert_eq!(config.sensors[1].crop, None);
        assert_eq!(config.sensors[1].initial_moisture, 35.5);
        assert_eq!(
            config.clock_offset().unwrap(),
            UtcOffset::from_hms(2, 0, 0).unwrap()
        );
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.crops.is_empty());
        assert!(config.sensors.is_empty());
        assert_eq!(config.auto_interval(), Duration::from_secs(30));
        assert_eq!(config.schedule_interval(), Duration::from_secs(60));
        assert!(!config.controller.auto_mode_on_start);
        assert_eq!(config.hardware.probe, ProbeKind::Simulated);
        config.validate().unwrap();
    }

    #[test]
    fn shipped_config_is_valid() {
        let config: Config = toml::from_str(include_str!("../../../config.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.crops.len(), 10);
        assert_eq!(config.sensors.len(), 5);
    }

    #[test]
    fn parse_unknown_probe_fails() {
        let res: std::result::Result<Config, _> = toml::from_str("[hardware]\nprobe = \"lidar\"");
        assert!(res.is_err());
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn multi_crop_multi_sensor_passes() {
        let cfg = Config {
            crops: vec![
                valid_crop(),
                CropEntry {
                    name: "Lettuce".into(),
                    min_moisture: 70,
                    max_moisture: 90,
                    water_amount: 300,
                    description: None,
                },
            ],
            sensors: vec![
                valid_sensor(),
                SensorEntry {
                    id: 2,
                    crop: Some("Lettuce".into()),
                    pin: 27,
                    adc_channel: 1,
                    ..valid_sensor()
                },
                SensorEntry {
                    id: 3,
                    crop: None,
                    pin: 22,
                    adc_channel: 2,
                    ..valid_sensor()
                },
            ],
            ..Config::default()
        };
        cfg.validate().unwrap();
    }

    // -- Controller -------------------------------------------------------

    #[test]
    fn controller_zero_auto_interval_rejected() {
        let mut cfg = valid_config();
        cfg.controller.auto_interval_sec = 0;
        assert_validation_err(&cfg, "auto_interval_sec must be positive");
    }

    #[test]
    fn controller_schedule_interval_over_a_minute_rejected() {
        let mut cfg = valid_config();
        cfg.controller.schedule_interval_sec = 61;
        assert_validation_err(&cfg, "schedule_interval_sec 61 out of range");
    }

    #[test]
    fn controller_bad_offset_rejected() {
        let mut cfg = valid_config();
        cfg.controller.utc_offset = Some("CET".into());
        assert_validation_err(&cfg, "utc offset 'CET'");
    }

    // -- Crop: identity ---------------------------------------------------

    #[test]
    fn crop_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.crops[0].name = "  ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn crop_duplicate_name_rejected() {
        let mut cfg = valid_config();
        cfg.crops.push(valid_crop());
        assert_validation_err(&cfg, "duplicate crop name");
    }

    // -- Crop: moisture band ----------------------------------------------

    #[test]
    fn crop_min_below_zero() {
        let mut cfg = valid_config();
        cfg.crops[0].min_moisture = -1;
        assert_validation_err(&cfg, "min_moisture -1 out of range");
    }

    #[test]
    fn crop_max_above_hundred() {
        let mut cfg = valid_config();
        cfg.crops[0].max_moisture = 101;
        assert_validation_err(&cfg, "max_moisture 101 out of range");
    }

    #[test]
    fn crop_max_must_exceed_min() {
        let mut cfg = valid_config();
        cfg.crops[0].min_moisture = 70;
        cfg.crops[0].max_moisture = 70;
        assert_validation_err(
            &cfg,
            "max_moisture (70) must be greater than min_moisture (70)",
        );
    }

    #[test]
    fn crop_negative_water_rejected() {
        let mut cfg = valid_config();
        cfg.crops[0].water_amount = -5;
        assert_validation_err(&cfg, "water_amount must not be negative");
    }

    #[test]
    fn crop_zero_water_accepted() {
        let mut cfg = valid_config();
        cfg.crops[0].water_amount = 0;
        cfg.validate().unwrap();
    }

    // -- Sensor -----------------------------------------------------------

    #[test]
    fn sensor_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.push(SensorEntry {
            pin: 27,
            adc_channel: 1,
            ..valid_sensor()
        });
        assert_validation_err(&cfg, "duplicate sensor id");
    }

    #[test]
    fn sensor_zero_id_rejected() {
        let mut cfg = valid_config();
        cfg.sensors[0].id = 0;
        assert_validation_err(&cfg, "id must be positive");
    }

    #[test]
    fn sensor_unknown_crop_rejected() {
        let mut cfg = valid_config();
        cfg.sensors[0].crop = Some("Durian".into());
        assert_validation_err(&cfg, "does not match any defined crop");
    }

    #[test]
    fn sensor_gpio_pin_outside_header_rejected() {
        for pin in [-1, 0, 1, 28] {
            let mut cfg = valid_config();
            cfg.sensors[0].pin = pin;
            assert_validation_err(&cfg, "not a valid BCM GPIO pin");
        }
    }

    #[test]
    fn sensor_gpio_boundaries_accepted() {
        for pin in [2, 27] {
            let mut cfg = valid_config();
            cfg.sensors[0].pin = pin;
            cfg.validate().unwrap();
        }
    }

    #[test]
    fn sensor_duplicate_pin_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.push(SensorEntry {
            id: 2,
            adc_channel: 1,
            ..valid_sensor()
        });
        assert_validation_err(&cfg, "pin 17 is already used by another sensor");
    }

    #[test]
    fn sensor_adc_channel_out_of_range() {
        let mut cfg = valid_config();
        cfg.sensors[0].adc_channel = 8;
        assert_validation_err(&cfg, "adc_channel 8 out of MCP3008 range");
    }

    #[test]
    fn sensor_duplicate_adc_channel_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.push(SensorEntry {
            id: 2,
            pin: 27,
            ..valid_sensor()
        });
        assert_validation_err(&cfg, "adc_channel 0 is already used by another sensor");
    }

    #[test]
    fn sensor_initial_moisture_out_of_range() {
        let mut cfg = valid_config();
        cfg.sensors[0].initial_moisture = 120.0;
        assert_validation_err(&cfg, "initial_moisture 120 out of range");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let cfg = Config {
            crops: vec![CropEntry {
                name: "".into(),
                min_moisture: -1,
                max_moisture: 200,
                water_amount: -1,
                description: None,
            }],
            sensors: vec![SensorEntry {
                id: 1,
                crop: Some("Nope".into()),
                pin: 0,
                adc_channel: 9,
                initial_moisture: 50.0,
            }],
            ..Config::default()
        };
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        // Should report many errors, not bail after the first
        for needle in [
            "name is empty",
            "min_moisture",
            "water_amount",
            "does not match any defined crop",
            "not a valid BCM GPIO pin",
            "adc_channel",
        ] {
            assert!(msg.contains(needle), "missing {needle:?} in: {msg}");
        }
    }

    // -- DB integration ---------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_database() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let mut config = valid_config();
        config.sensors.push(SensorEntry {
            id: 2,
            crop: None,
            pin: 27,
            adc_channel: 1,
            initial_moisture: 30.0,
        });
        config.validate().unwrap();

        apply(&config, &db).await.unwrap();

        let crops = db.load_crops().await.unwrap();
        assert_eq!(crops.len(), 1);
        assert_eq!(crops[0].name, "Tomato");

        let sensors = db.load_sensors().await.unwrap();
        assert_eq!(sensors.len(), 2);
        assert_eq!(sensors[0].crop.as_ref().unwrap().name, "Tomato");
        assert_eq!(sensors[0].current_moisture, 50.0);
        assert!(sensors[1].crop.is_none());
        assert_eq!(sensors[1].current_moisture, 30.0);
    }

    #[tokio::test]
    async fn reapply_is_idempotent_and_keeps_moisture() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let mut config = valid_config();
        apply(&config, &db).await.unwrap();
        db.update_sensor_moisture(1, 12.0, 0).await.unwrap();

        config.crops[0].water_amount = 450;
        apply(&config, &db).await.unwrap();

        let crops = db.load_crops().await.unwrap();
        assert_eq!(crops.len(), 1);
        assert_eq!(crops[0].water_amount, 450);
        let s = db.get_sensor(1).await.unwrap().unwrap();
        assert_eq!(s.current_moisture, 12.0);
    }
}
