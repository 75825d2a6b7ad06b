//! Moisture probes. One probe is chosen at startup and injected into the
//! drivers: the simulated probe by default, or (with the `gpio` feature) an
//! MCP3008 ADC read over SPI on a Raspberry Pi.

use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::db::Sensor;
use crate::moisture::{apply_drift, clamp_moisture, drift_from_unit};

#[cfg(feature = "gpio")]
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

/// Raw MCP3008 value of a sensor in dry air.
const ADC_DRY: f64 = 1023.0;
/// Raw MCP3008 value of a sensor in water.
const ADC_WET: f64 = 300.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Simulated,
    Gpio,
}

/// Produces the next moisture observation for a sensor.
pub trait MoistureProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Next moisture value (0-100) for `sensor`.
    fn sample(&self, sensor: &Sensor) -> f64;
}

/// Pick the probe for `kind`. Falls back to simulation when the hardware
/// cannot be opened. A `seed` makes the simulated drift repeatable.
pub fn select(kind: ProbeKind, seed: Option<u64>) -> Arc<dyn MoistureProbe> {
    let probe: Arc<dyn MoistureProbe> = match (kind, seed) {
        (ProbeKind::Simulated, Some(seed)) => Arc::new(SimulatedProbe::with_seed(seed)),
        (ProbeKind::Simulated, None) => Arc::new(SimulatedProbe::new()),
        (ProbeKind::Gpio, _) => gpio_or_simulated(),
    };
    info!(probe = probe.name(), "moisture probe selected");
    probe
}

#[cfg(feature = "gpio")]
fn gpio_or_simulated() -> Arc<dyn MoistureProbe> {
    match GpioProbe::open() {
        Ok(p) => Arc::new(p),
        Err(e) => {
            warn!("spi unavailable ({e}); falling back to simulated probe");
            Arc::new(SimulatedProbe::new())
        }
    }
}

#[cfg(not(feature = "gpio"))]
fn gpio_or_simulated() -> Arc<dyn MoistureProbe> {
    warn!("built without the `gpio` feature; falling back to simulated probe");
    Arc::new(SimulatedProbe::new())
}

// ---------------------------------------------------------------------------
// Simulated probe (drains the stored value by a random step)
// ---------------------------------------------------------------------------

pub struct SimulatedProbe {
    rng: Mutex<fastrand::Rng>,
}

impl SimulatedProbe {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Reproducible draws.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }

    fn draw(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        drift_from_unit(rng.f64())
    }
}

impl Default for SimulatedProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MoistureProbe for SimulatedProbe {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn sample(&self, sensor: &Sensor) -> f64 {
        apply_drift(sensor.current_moisture, self.draw())
    }
}

// ---------------------------------------------------------------------------
// MCP3008 probe (requires rppal + Raspberry Pi SPI0)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
const SPI_CLOCK_HZ: u32 = 1_350_000;

#[cfg(feature = "gpio")]
pub struct GpioProbe {
    fallback: SimulatedProbe,
}

#[cfg(feature = "gpio")]
impl GpioProbe {
    /// Opens the bus once to check it is there. Each read reopens it, so the
    /// probe holds no device handle between samples.
    pub fn open() -> anyhow::Result<Self> {
        Self::spi()?;
        Ok(Self {
            fallback: SimulatedProbe::new(),
        })
    }

    fn spi() -> anyhow::Result<Spi> {
        Ok(Spi::new(Bus::Spi0, SlaveSelect::Ss0, SPI_CLOCK_HZ, Mode::Mode0)?)
    }

    fn read_channel(channel: i64) -> anyhow::Result<u16> {
        let write = mcp3008_request(channel)?;
        let spi = Self::spi()?;
        let mut read = [0u8; 3];
        spi.transfer(&mut read, &write)?;
        Ok((((read[1] & 0x03) as u16) << 8) | read[2] as u16)
    }
}

#[cfg(feature = "gpio")]
impl MoistureProbe for GpioProbe {
    fn name(&self) -> &'static str {
        "mcp3008"
    }

    fn sample(&self, sensor: &Sensor) -> f64 {
        match Self::read_channel(sensor.adc_channel) {
            Ok(raw) => adc_to_percent(raw),
            Err(e) => {
                warn!(sensor_id = sensor.id, "adc read failed ({e}); using simulated value");
                self.fallback.sample(sensor)
            }
        }
    }
}

/// Single-ended read request for `channel` (start bit, SGL/DIFF + channel,
/// padding).
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
pub fn mcp3008_request(channel: i64) -> anyhow::Result<[u8; 3]> {
    let ch = u8::try_from(channel)
        .ok()
        .filter(|c| *c < 8)
        .ok_or_else(|| anyhow::anyhow!("mcp3008 channel {channel} out of range"))?;
    Ok([1, (8 + ch) << 4, 0])
}

/// Convert a 10-bit capacitive sensor reading to a 0-100 moisture value.
/// Lower raw values mean wetter soil.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
pub fn adc_to_percent(raw: u16) -> f64 {
    let frac = (raw as f64 - ADC_WET) / (ADC_DRY - ADC_WET);
    clamp_moisture(100.0 - frac * 100.0)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moisture::{DRIFT_MAX, DRIFT_MIN};

    fn sensor_at(moisture: f64) -> Sensor {
        Sensor {
            id: 1,
            crop_id: None,
            current_moisture: moisture,
            pin: 17,
            adc_channel: 0,
            last_reading: None,
            crop: None,
        }
    }

    #[test]
    fn simulated_probe_drains_within_drift_bounds() {
        let probe = SimulatedProbe::with_seed(7);
        for _ in 0..500 {
            let next = probe.sample(&sensor_at(50.0));
            let step = 50.0 - next;
            assert!(
                (DRIFT_MIN - 1e-9..=DRIFT_MAX + 1e-9).contains(&step),
                "drift step out of range: {step}"
            );
        }
    }

    #[test]
    fn simulated_probe_stops_at_zero() {
        let probe = SimulatedProbe::with_seed(1);
        assert_eq!(probe.sample(&sensor_at(0.2)), 0.0);
    }

    #[test]
    fn seeded_probes_repeat() {
        let a = SimulatedProbe::with_seed(42);
        let b = SimulatedProbe::with_seed(42);
        let s = sensor_at(70.0);
        assert_eq!(a.sample(&s), b.sample(&s));
    }

    #[test]
    fn select_without_hardware_simulates() {
        assert_eq!(select(ProbeKind::Simulated, None).name(), "simulated");
        assert_eq!(select(ProbeKind::Simulated, Some(5)).name(), "simulated");
        #[cfg(not(feature = "gpio"))]
        assert_eq!(select(ProbeKind::Gpio, None).name(), "simulated");
    }

    #[test]
    fn mcp3008_request_encodes_channel() {
        assert_eq!(mcp3008_request(0).unwrap(), [0x01, 0x80, 0x00]);
        assert_eq!(mcp3008_request(7).unwrap(), [0x01, 0xF0, 0x00]);
    }

    #[test]
    fn mcp3008_request_rejects_bad_channels() {
        // 256 would wrap to channel 0 under a plain cast.
        for bad in [8, 256, -1, i64::MAX] {
            assert!(mcp3008_request(bad).is_err(), "channel {bad} should be rejected");
        }
    }

    #[test]
    fn adc_endpoints_map_to_scale() {
        assert_eq!(adc_to_percent(1023), 0.0);
        assert_eq!(adc_to_percent(300), 100.0);
        assert_eq!(adc_to_percent(0), 100.0);
        let mid = adc_to_percent(661);
        assert!((mid - 50.07).abs() < 0.01, "mid = {mid}");
    }
}
