use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

use crate::calendar;
use crate::moisture::{MoistureBand, Trigger, WateringOutcome};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Crop {
    pub id: i64,
    pub name: String,
    pub min_moisture: i64,
    pub max_moisture: i64,
    pub water_amount: i64,
    pub description: Option<String>,
}

impl Crop {
    pub fn band(&self) -> MoistureBand {
        MoistureBand {
            min_moisture: self.min_moisture,
            max_moisture: self.max_moisture,
            water_amount: self.water_amount,
        }
    }
}

/// Crop fields as they come from config, before an id is assigned.
#[derive(Debug, Clone)]
pub struct CropSeed {
    pub name: String,
    pub min_moisture: i64,
    pub max_moisture: i64,
    pub water_amount: i64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sensor {
    pub id: i64,
    pub crop_id: Option<i64>,
    pub current_moisture: f64,
    pub pin: i64,
    pub adc_channel: i64,
    pub last_reading: Option<i64>, // unix seconds
    pub crop: Option<Crop>,
}

#[derive(Debug, Clone)]
pub struct SensorSeed {
    pub id: i64,
    pub crop_id: Option<i64>,
    pub pin: i64,
    pub adc_channel: i64,
    pub initial_moisture: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WateringEvent {
    pub id: i64,
    pub sensor_id: i64,
    pub moisture_before: f64,
    pub moisture_after: f64,
    pub amount: i64,
    pub source: Trigger,
    pub ts: i64,
}

/// One watering to persist: the sensor update and its log entry.
#[derive(Debug, Clone)]
pub struct WateringRecord {
    pub sensor_id: i64,
    pub outcome: WateringOutcome,
    pub source: Trigger,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    pub id: i64,
    pub sensor_id: i64,
    pub time: String, // HH:MM
    pub days: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub avg_moisture: Option<f64>,
    pub total_sensors: i64,
    pub today_watering: i64,
}

// ---------------------------------------------------------------------------
// Row shapes
// ---------------------------------------------------------------------------

const SENSOR_SELECT: &str = r#"
    SELECT s.id, s.crop_id, s.current_moisture, s.pin, s.adc_channel, s.last_reading,
           c.name AS crop_name, c.min_moisture, c.max_moisture, c.water_amount,
           c.description
    FROM sensors s
    LEFT JOIN crops c ON c.id = s.crop_id
"#;

#[derive(FromRow)]
struct SensorRow {
    id: i64,
    crop_id: Option<i64>,
    current_moisture: f64,
    pin: i64,
    adc_channel: i64,
    last_reading: Option<i64>,
    crop_name: Option<String>,
    min_moisture: Option<i64>,
    max_moisture: Option<i64>,
    water_amount: Option<i64>,
    description: Option<String>,
}

impl From<SensorRow> for Sensor {
    fn from(r: SensorRow) -> Self {
        let crop = match (r.crop_id, r.crop_name, r.min_moisture, r.max_moisture, r.water_amount) {
            (Some(id), Some(name), Some(min_moisture), Some(max_moisture), Some(water_amount)) => {
                Some(Crop {
                    id,
                    name,
                    min_moisture,
                    max_moisture,
                    water_amount,
                    description: r.description,
                })
            }
            _ => None,
        };
        Sensor {
            id: r.id,
            crop_id: r.crop_id,
            current_moisture: r.current_moisture,
            pin: r.pin,
            adc_channel: r.adc_channel,
            last_reading: r.last_reading,
            crop,
        }
    }
}

#[derive(FromRow)]
struct WateringEventRow {
    id: i64,
    sensor_id: i64,
    moisture_before: f64,
    moisture_after: f64,
    amount: i64,
    source: String,
    ts: i64,
}

impl TryFrom<WateringEventRow> for WateringEvent {
    type Error = anyhow::Error;

    fn try_from(r: WateringEventRow) -> Result<Self> {
        Ok(WateringEvent {
            id: r.id,
            sensor_id: r.sensor_id,
            moisture_before: r.moisture_before,
            moisture_after: r.moisture_after,
            amount: r.amount,
            source: r.source.parse()?,
            ts: r.ts,
        })
    }
}

#[derive(FromRow)]
struct ScheduleRow {
    id: i64,
    sensor_id: i64,
    time: String,
    days: String,
    active: bool,
}

impl From<ScheduleRow> for Schedule {
    fn from(r: ScheduleRow) -> Self {
        Schedule {
            id: r.id,
            sensor_id: r.sensor_id,
            time: r.time,
            days: calendar::split_days(&r.days),
            active: r.active,
        }
    }
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database, so pin the pool
        // to a single connection that never gets recycled.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Crops
    // ----------------------------

    /// Insert or update a crop by name; returns its id.
    pub async fn upsert_crop(&self, c: &CropSeed) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO crops (name, min_moisture, max_moisture, water_amount, description)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              min_moisture=excluded.min_moisture,
              max_moisture=excluded.max_moisture,
              water_amount=excluded.water_amount,
              description=excluded.description
            RETURNING id
            "#,
        )
        .bind(&c.name)
        .bind(c.min_moisture)
        .bind(c.max_moisture)
        .bind(c.water_amount)
        .bind(&c.description)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert_crop failed for '{}'", c.name))?;
        Ok(id)
    }

    pub async fn load_crops(&self) -> Result<Vec<Crop>> {
        sqlx::query_as::<_, Crop>(
            r#"
            SELECT id, name, min_moisture, max_moisture, water_amount, description
            FROM crops
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_crops failed")
    }

    pub async fn get_crop(&self, crop_id: i64) -> Result<Option<Crop>> {
        sqlx::query_as::<_, Crop>(
            r#"
            SELECT id, name, min_moisture, max_moisture, water_amount, description
            FROM crops
            WHERE id = ?
            "#,
        )
        .bind(crop_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_crop failed")
    }

    // ----------------------------
    // Sensors
    // ----------------------------

    /// Insert a sensor or refresh its wiring and crop. An existing sensor
    /// keeps its current moisture.
    pub async fn upsert_sensor(&self, s: &SensorSeed) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (id, crop_id, current_moisture, pin, adc_channel, last_reading)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              crop_id=excluded.crop_id,
              pin=excluded.pin,
              adc_channel=excluded.adc_channel
            "#,
        )
        .bind(s.id)
        .bind(s.crop_id)
        .bind(s.initial_moisture)
        .bind(s.pin)
        .bind(s.adc_channel)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert_sensor failed for sensor {}", s.id))?;
        Ok(())
    }

    /// All sensors joined with their crop, ordered by id.
    pub async fn load_sensors(&self) -> Result<Vec<Sensor>> {
        let rows = sqlx::query_as::<_, SensorRow>(&format!("{SENSOR_SELECT} ORDER BY s.id"))
            .fetch_all(&self.pool)
            .await
            .context("load_sensors failed")?;
        Ok(rows.into_iter().map(Sensor::from).collect())
    }

    pub async fn get_sensor(&self, sensor_id: i64) -> Result<Option<Sensor>> {
        let row = sqlx::query_as::<_, SensorRow>(&format!("{SENSOR_SELECT} WHERE s.id = ?"))
            .bind(sensor_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_sensor failed")?;
        Ok(row.map(Sensor::from))
    }

    /// Returns false when the sensor does not exist.
    pub async fn set_sensor_crop(&self, sensor_id: i64, crop_id: Option<i64>) -> Result<bool> {
        let res = sqlx::query("UPDATE sensors SET crop_id = ? WHERE id = ?")
            .bind(crop_id)
            .bind(sensor_id)
            .execute(&self.pool)
            .await
            .context("set_sensor_crop failed")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn update_sensor_moisture(&self, sensor_id: i64, moisture: f64, ts: i64) -> Result<()> {
        sqlx::query("UPDATE sensors SET current_moisture = ?, last_reading = ? WHERE id = ?")
            .bind(moisture)
            .bind(ts)
            .bind(sensor_id)
            .execute(&self.pool)
            .await
            .context("update_sensor_moisture failed")?;
        Ok(())
    }

    // ----------------------------
    // Watering log
    // ----------------------------

    /// Update the sensor and append its log entry in one transaction.
    pub async fn record_watering(&self, w: &WateringRecord) -> Result<()> {
        self.record_watering_batch(std::slice::from_ref(w)).await
    }

    /// Apply a whole driver tick in one transaction.
    pub async fn record_watering_batch(&self, batch: &[WateringRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context("begin watering tx failed")?;
        for w in batch {
            write_watering(&mut *tx, w).await?;
        }
        tx.commit().await.context("commit watering tx failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn watering_history(&self, sensor_id: i64, limit: i64) -> Result<Vec<WateringEvent>> {
        let rows = sqlx::query_as::<_, WateringEventRow>(
            r#"
            SELECT id, sensor_id, moisture_before, moisture_after, amount, source, ts
            FROM watering_events
            WHERE sensor_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(sensor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("watering_history failed")?;
        rows.into_iter().map(WateringEvent::try_from).collect()
    }

    /// The full log for one sensor, newest first.
    pub async fn watering_log(&self, sensor_id: i64) -> Result<Vec<WateringEvent>> {
        self.watering_history(sensor_id, -1).await
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn insert_schedule(&self, sensor_id: i64, time: &str, days: &[String]) -> Result<Schedule> {
        let stored = calendar::join_days(days);
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO schedules (sensor_id, time, days, active)
            VALUES (?, ?, ?, 1)
            RETURNING id
            "#,
        )
        .bind(sensor_id)
        .bind(time)
        .bind(&stored)
        .fetch_one(&self.pool)
        .await
        .context("insert_schedule failed")?;

        Ok(Schedule {
            id,
            sensor_id,
            time: time.to_string(),
            days: days.to_vec(),
            active: true,
        })
    }

    /// Active schedules ordered by time of day.
    pub async fn active_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT id, sensor_id, time, days, active
            FROM schedules
            WHERE active = 1
            ORDER BY time, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("active_schedules failed")?;
        Ok(rows.into_iter().map(Schedule::from).collect())
    }

    /// Soft delete. Returns false when no active schedule has that id.
    pub async fn deactivate_schedule(&self, schedule_id: i64) -> Result<bool> {
        let res = sqlx::query("UPDATE schedules SET active = 0 WHERE id = ? AND active = 1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .context("deactivate_schedule failed")?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Stats
    // ----------------------------

    pub async fn stats(&self) -> Result<Stats> {
        let (avg_moisture, total_sensors): (Option<f64>, i64) =
            sqlx::query_as("SELECT AVG(current_moisture), COUNT(*) FROM sensors")
                .fetch_one(&self.pool)
                .await
                .context("stats: sensor aggregate failed")?;

        let (today_watering,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM watering_events
            WHERE date(ts, 'unixepoch') = date('now')
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("stats: today's watering count failed")?;

        Ok(Stats {
            avg_moisture,
            total_sensors,
            today_watering,
        })
    }
}

async fn write_watering(conn: &mut SqliteConnection, w: &WateringRecord) -> Result<()> {
    sqlx::query("UPDATE sensors SET current_moisture = ?, last_reading = ? WHERE id = ?")
        .bind(w.outcome.moisture_after)
        .bind(w.ts)
        .bind(w.sensor_id)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("watering update failed for sensor {}", w.sensor_id))?;

    sqlx::query(
        r#"
        INSERT INTO watering_events (sensor_id, moisture_before, moisture_after, amount, source, ts)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(w.sensor_id)
    .bind(w.outcome.moisture_before)
    .bind(w.outcome.moisture_after)
    .bind(w.outcome.amount)
    .bind(w.source.as_str())
    .bind(w.ts)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("watering log insert failed for sensor {}", w.sensor_id))?;

    Ok(())
}
