//! Watering drivers. Each driver reads sensor and crop state from the store,
//! runs the shared moisture model, and persists the result:
//!
//! - manual: one sensor, always waters, errors when the sensor has no crop
//! - auto tick: every sensor below its crop minimum, one transaction per tick
//! - schedule tick: every active schedule matching the current minute
//!
//! The batch drivers skip sensors without a crop instead of failing the tick.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::calendar::ClockSlot;
use crate::db::{now_unix, Db, Sensor, WateringRecord};
use crate::error::{WateringError, WateringResult};
use crate::hardware::MoistureProbe;
use crate::moisture::{compute_dose, evaluate, Trigger, WateringOutcome};
use crate::state::SharedState;

/// A persisted moisture observation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MoistureReading {
    pub sensor_id: i64,
    pub moisture: f64,
    pub ts: i64,
}

/// What one batch tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub watered: usize,
    /// Sensors or schedules passed over for lack of a crop or sensor.
    pub skipped: usize,
}

/// Remembers, per schedule id, the minute it last fired in.
pub type FiredLog = HashMap<i64, String>;

// ---------------------------------------------------------------------------
// On-demand drivers
// ---------------------------------------------------------------------------

/// Take a moisture observation and store it as the sensor's current value.
pub async fn read_moisture(
    db: &Db,
    probe: &dyn MoistureProbe,
    shared: &SharedState,
    sensor_id: i64,
) -> WateringResult<MoistureReading> {
    let sensor = db
        .get_sensor(sensor_id)
        .await?
        .ok_or(WateringError::SensorNotFound(sensor_id))?;

    let moisture = probe.sample(&sensor);
    let ts = now_unix();
    db.update_sensor_moisture(sensor_id, moisture, ts).await?;

    debug!(sensor_id, moisture, probe = probe.name(), "moisture read");
    shared.write().await.record_reading(sensor_id, moisture);

    Ok(MoistureReading {
        sensor_id,
        moisture,
        ts,
    })
}

/// Water one sensor now, regardless of its moisture.
pub async fn water_now(
    db: &Db,
    shared: &SharedState,
    sensor_id: i64,
) -> WateringResult<WateringOutcome> {
    let sensor = db
        .get_sensor(sensor_id)
        .await?
        .ok_or(WateringError::SensorNotFound(sensor_id))?;
    let crop = sensor
        .crop
        .as_ref()
        .ok_or(WateringError::MissingCrop(sensor_id))?;

    // Manual watering has no threshold, so go straight to the dose.
    let outcome = compute_dose(sensor.current_moisture, crop.water_amount, crop.max_moisture);

    db.record_watering(&WateringRecord {
        sensor_id,
        outcome,
        source: Trigger::Manual,
        ts: now_unix(),
    })
    .await?;

    info!(
        sensor_id,
        crop = %crop.name,
        before = outcome.moisture_before,
        after = outcome.moisture_after,
        amount = outcome.amount,
        "manual watering"
    );
    shared
        .write()
        .await
        .record_watering(sensor_id, Trigger::Manual, &outcome);

    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Batch drivers
// ---------------------------------------------------------------------------

/// One auto-mode pass: water every sensor that is below its crop minimum.
pub async fn auto_tick(db: &Db, shared: &SharedState) -> WateringResult<TickReport> {
    let sensors = db.load_sensors().await?;
    let ts = now_unix();
    let mut report = TickReport::default();
    let mut batch = Vec::new();

    for sensor in &sensors {
        let Some(crop) = &sensor.crop else {
            debug!(sensor_id = sensor.id, "auto: no crop assigned, skipping");
            report.skipped += 1;
            continue;
        };
        if let Some(outcome) = evaluate(Trigger::Auto, sensor.current_moisture, &crop.band()) {
            batch.push(WateringRecord {
                sensor_id: sensor.id,
                outcome,
                source: Trigger::Auto,
                ts,
            });
        }
    }

    db.record_watering_batch(&batch).await?;
    report.watered = batch.len();
    publish(shared, &batch).await;
    Ok(report)
}

/// One schedule pass for the minute in `slot`. A schedule fires at most once
/// per minute; `fired` carries that memory between ticks.
pub async fn schedule_tick(
    db: &Db,
    shared: &SharedState,
    slot: &ClockSlot,
    fired: &mut FiredLog,
) -> WateringResult<TickReport> {
    let stamp = slot.stamp();
    let due: Vec<_> = db
        .active_schedules()
        .await?
        .into_iter()
        .filter(|s| slot.matches(&s.time, &s.days))
        .filter(|s| fired.get(&s.id) != Some(&stamp))
        .collect();

    let mut report = TickReport::default();
    if due.is_empty() {
        return Ok(report);
    }

    let sensors: HashMap<i64, Sensor> = db
        .load_sensors()
        .await?
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

    let ts = now_unix();
    let mut batch = Vec::new();
    // Two schedules for one sensor in the same minute stack their doses.
    let mut pending: HashMap<i64, f64> = HashMap::new();
    let mut fired_now = Vec::new();

    for schedule in &due {
        let Some(sensor) = sensors.get(&schedule.sensor_id) else {
            warn!(
                schedule_id = schedule.id,
                sensor_id = schedule.sensor_id,
                "schedule: sensor missing, skipping"
            );
            report.skipped += 1;
            continue;
        };
        let Some(crop) = &sensor.crop else {
            warn!(
                schedule_id = schedule.id,
                sensor_id = sensor.id,
                "schedule: no crop assigned, skipping"
            );
            report.skipped += 1;
            continue;
        };

        let current = pending
            .get(&sensor.id)
            .copied()
            .unwrap_or(sensor.current_moisture);
        if let Some(outcome) = evaluate(Trigger::Schedule, current, &crop.band()) {
            pending.insert(sensor.id, outcome.moisture_after);
            batch.push(WateringRecord {
                sensor_id: sensor.id,
                outcome,
                source: Trigger::Schedule,
                ts,
            });
            fired_now.push(schedule.id);
        }
    }

    db.record_watering_batch(&batch).await?;

    // Only remember a fire once it is committed, so a failed tick retries
    // within the same minute.
    for id in fired_now {
        fired.insert(id, stamp.clone());
    }
    // Forget entries from earlier minutes.
    fired.retain(|_, s| *s == stamp);

    report.watered = batch.len();
    publish(shared, &batch).await;
    Ok(report)
}

async fn publish(shared: &SharedState, batch: &[WateringRecord]) {
    if batch.is_empty() {
        return;
    }
    let mut st = shared.write().await;
    for w in batch {
        info!(
            sensor_id = w.sensor_id,
            trigger = %w.source,
            before = w.outcome.moisture_before,
            after = w.outcome.moisture_after,
            noop = w.outcome.is_noop(),
            "watering committed"
        );
        st.record_watering(w.sensor_id, w.source, &w.outcome);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
