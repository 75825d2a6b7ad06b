//! Moisture model shared by every watering driver.
//!
//! Everything here is pure: the trigger rule that decides whether a sensor
//! gets water, the dose formula that computes the before/after pair, and the
//! passive drift applied on each moisture read. The drivers in
//! `crate::watering` do the I/O around these functions.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lower bound of the moisture scale.
pub const MOISTURE_FLOOR: f64 = 0.0;
/// Upper bound of the moisture scale.
pub const MOISTURE_CEILING: f64 = 100.0;

/// Moisture points gained per 100 units of water.
const POINTS_PER_100_UNITS: f64 = 15.0;

/// Smallest drift step subtracted on a read.
pub const DRIFT_MIN: f64 = 0.5;
/// Exclusive upper bound of the drift step.
pub const DRIFT_MAX: f64 = 2.0;

// ---------------------------------------------------------------------------
// Trigger rule
// ---------------------------------------------------------------------------

/// Which driver asked for water.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Explicit request through the API.
    Manual,
    /// Auto-mode polling loop.
    Auto,
    /// Calendar schedule match.
    Schedule,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Schedule => "schedule",
        }
    }

    /// Only the auto-mode loop looks at the crop's minimum. A manual request
    /// or a matched schedule is reason enough to water.
    pub fn respects_threshold(self) -> bool {
        matches!(self, Self::Auto)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            "schedule" => Ok(Self::Schedule),
            other => bail!("unknown watering trigger '{other}'"),
        }
    }
}

/// Decide whether `trigger` should water a sensor at `current` moisture whose
/// crop wants at least `min_moisture`.
pub fn should_water(trigger: Trigger, current: f64, min_moisture: i64) -> bool {
    if !trigger.respects_threshold() {
        return true;
    }
    current < min_moisture as f64
}

// ---------------------------------------------------------------------------
// Dose computation
// ---------------------------------------------------------------------------

/// The part of a crop the model needs: its moisture band and dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoistureBand {
    pub min_moisture: i64,
    pub max_moisture: i64,
    pub water_amount: i64,
}

/// Result of one watering action. Full precision is kept; use
/// [`WateringOutcome::rounded`] for display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WateringOutcome {
    pub moisture_before: f64,
    pub moisture_after: f64,
    pub amount: i64,
}

impl WateringOutcome {
    /// Copy with both moisture values rounded to one decimal place.
    pub fn rounded(&self) -> Self {
        Self {
            moisture_before: round1(self.moisture_before),
            moisture_after: round1(self.moisture_after),
            amount: self.amount,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.moisture_after == self.moisture_before
    }
}

/// Moisture points a dose of `water_amount` adds before capping.
pub fn moisture_increase(water_amount: i64) -> f64 {
    (water_amount as f64 / 100.0) * POINTS_PER_100_UNITS
}

/// Top up `before` by the crop's dose, capped at the crop maximum (and at the
/// top of the scale).
///
/// Watering never lowers moisture: a sensor already above `max_moisture`
/// keeps its value, and a negative amount (rejected at config time anyway)
/// has no effect.
pub fn compute_dose(before: f64, water_amount: i64, max_moisture: i64) -> WateringOutcome {
    let cap = (max_moisture as f64).min(MOISTURE_CEILING);
    let topped = (before + moisture_increase(water_amount)).min(cap);
    WateringOutcome {
        moisture_before: before,
        moisture_after: topped.max(before),
        amount: water_amount,
    }
}

/// Trigger rule and dose in one step. `None` means the trigger declined.
pub fn evaluate(trigger: Trigger, current: f64, band: &MoistureBand) -> Option<WateringOutcome> {
    if !should_water(trigger, current, band.min_moisture) {
        return None;
    }
    Some(compute_dose(current, band.water_amount, band.max_moisture))
}

// ---------------------------------------------------------------------------
// Drift
// ---------------------------------------------------------------------------

/// Subtract a drift step from `current` and clamp to the moisture scale.
pub fn apply_drift(current: f64, draw: f64) -> f64 {
    clamp_moisture(current - draw)
}

/// Map a uniform sample in `[0, 1)` onto the drift interval.
pub fn drift_from_unit(unit: f64) -> f64 {
    DRIFT_MIN + unit * (DRIFT_MAX - DRIFT_MIN)
}

pub fn clamp_moisture(value: f64) -> f64 {
    value.clamp(MOISTURE_FLOOR, MOISTURE_CEILING)
}

/// Round to one decimal place for display.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
