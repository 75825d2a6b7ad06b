//! Background watering tasks.
//!
//! - [`AutoMode`] supervises the auto-mode polling loop. The loop exists only
//!   while auto mode is enabled, and at most one runs at a time no matter how
//!   often it is switched on.
//! - [`spawn_schedule_loop`] polls calendar schedules for the life of the
//!   process and stops through a [`StopHandle`].
//!
//! Both loops call the plain tick functions in `crate::watering`. A failed
//! tick is logged, recorded in the status ring, and retried on the next tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::UtcOffset;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::calendar::{now_in, ClockSlot};
use crate::db::Db;
use crate::state::{AutoModeStatus, SharedState};
use crate::watering::{self, FiredLog};

// ---------------------------------------------------------------------------
// Auto mode
// ---------------------------------------------------------------------------

/// Handle to the auto-mode supervisor. Cheap to clone.
#[derive(Clone)]
pub struct AutoMode {
    inner: Arc<AutoInner>,
}

struct AutoInner {
    db: Db,
    shared: SharedState,
    interval: Duration,
    enabled: AtomicBool,
    /// Set while a loop task exists. Only the task that wins the
    /// false -> true exchange gets to run.
    running: AtomicBool,
    ticks: AtomicU64,
    wake: Notify,
}

impl AutoMode {
    pub fn new(db: Db, shared: SharedState, interval: Duration) -> Self {
        Self {
            inner: Arc::new(AutoInner {
                db,
                shared,
                interval,
                enabled: AtomicBool::new(false),
                running: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                wake: Notify::new(),
            }),
        }
    }

    /// Switch auto mode on or off. Enabling starts the loop unless one is
    /// already running; disabling wakes the loop so it exits promptly.
    pub async fn set_enabled(&self, on: bool) {
        let was = self.inner.enabled.swap(on, Ordering::SeqCst);
        if was != on {
            info!(enabled = on, "auto mode toggled");
            self.inner
                .shared
                .write()
                .await
                .record_scheduler(format!("auto mode {}", if on { "enabled" } else { "disabled" }));
        }

        if on {
            self.ensure_running();
        } else {
            // Only a loop parked in its sleep hears this; no permit is stored
            // for a later loop to trip over.
            self.inner.wake.notify_waiters();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> AutoModeStatus {
        AutoModeStatus {
            enabled: self.is_enabled(),
            running: self.inner.running.load(Ordering::SeqCst),
            ticks: self.inner.ticks.load(Ordering::SeqCst),
        }
    }

    fn ensure_running(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(run_auto(self.inner.clone()));
        }
    }
}

async fn run_auto(inner: Arc<AutoInner>) {
    info!(interval_sec = inner.interval.as_secs_f64(), "auto-mode loop started");
    inner
        .shared
        .write()
        .await
        .record_scheduler("auto-mode loop started".to_string());

    loop {
        while inner.enabled.load(Ordering::SeqCst) {
            match watering::auto_tick(&inner.db, &inner.shared).await {
                Ok(report) => {
                    debug!(watered = report.watered, skipped = report.skipped, "auto tick");
                }
                Err(e) => {
                    error!("auto tick failed: {e:#}");
                    inner
                        .shared
                        .write()
                        .await
                        .record_error(format!("auto tick failed: {e}"));
                }
            }
            inner.ticks.fetch_add(1, Ordering::SeqCst);

            let woken = inner.wake.notified();
            tokio::pin!(woken);
            // Register before re-checking so a disable in between still wakes us.
            woken.as_mut().enable();
            if !inner.enabled.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(inner.interval) => {}
                _ = woken => {}
            }
        }

        inner.running.store(false, Ordering::SeqCst);

        // Auto mode may have been re-enabled after the check above but before
        // `running` was cleared; that caller saw a live loop and spawned
        // nothing, so keep going if we can reclaim the flag.
        if !inner.enabled.load(Ordering::SeqCst)
            || inner
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            break;
        }
    }

    info!("auto-mode loop stopped");
    inner
        .shared
        .write()
        .await
        .record_scheduler("auto-mode loop stopped".to_string());
}

// ---------------------------------------------------------------------------
// Stop handle
// ---------------------------------------------------------------------------

/// One-shot stop signal shared between a loop and whoever owns it.
#[derive(Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`StopHandle::stop`] has been called.
    pub async fn stopped(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent stop is not missed.
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

// ---------------------------------------------------------------------------
// Schedule loop
// ---------------------------------------------------------------------------

/// Spawn the schedule poller. Wall-clock minutes are taken in `offset`.
pub fn spawn_schedule_loop(
    db: Db,
    shared: SharedState,
    interval: Duration,
    offset: UtcOffset,
    stop: StopHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fired = FiredLog::new();

        info!(interval_sec = interval.as_secs_f64(), %offset, "schedule loop started");
        shared
            .write()
            .await
            .record_scheduler(format!("schedule loop started (utc offset {offset})"));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.stopped() => break,
            }

            let slot = ClockSlot::at(now_in(offset));
            match watering::schedule_tick(&db, &shared, &slot, &mut fired).await {
                Ok(report) if report.watered > 0 || report.skipped > 0 => {
                    info!(
                        minute = %slot.stamp(),
                        watered = report.watered,
                        skipped = report.skipped,
                        "schedule tick"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(minute = %slot.stamp(), "schedule tick failed: {e:#}");
                    shared
                        .write()
                        .await
                        .record_error(format!("schedule tick failed: {e}"));
                }
            }
        }

        info!("schedule loop stopped");
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_unix;
    use crate::db::tests::{drop_table, seeded_db};
    use crate::state::{EventKind, SystemState};

    const FAST: Duration = Duration::from_millis(20);

    /// Poll `cond` until it holds, failing the test after two seconds.
    async fn wait_for<F: FnMut() -> bool>(mut cond: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn loop_starts(shared: &SharedState) -> usize {
        shared
            .read()
            .await
            .events
            .iter()
            .filter(|e| e.detail == "auto-mode loop started")
            .count()
    }

    #[tokio::test]
    async fn auto_mode_starts_idle() {
        let db = seeded_db().await;
        let auto = AutoMode::new(db, SystemState::shared(), FAST);
        let st = auto.status();
        assert!(!st.enabled);
        assert!(!st.running);
        assert_eq!(st.ticks, 0);
    }

    #[tokio::test]
    async fn enabling_twice_runs_one_loop() {
        let db = seeded_db().await;
        let shared = SystemState::shared();
        let auto = AutoMode::new(db, shared.clone(), FAST);

        auto.set_enabled(true).await;
        auto.set_enabled(true).await;
        wait_for(|| auto.status().ticks >= 3).await;

        assert!(auto.status().running);
        assert_eq!(loop_starts(&shared).await, 1);
        auto.set_enabled(false).await;
    }

    #[tokio::test]
    async fn auto_loop_waters_dry_sensor() {
        let db = seeded_db().await;
        db.update_sensor_moisture(1, 55.0, now_unix()).await.unwrap();
        let auto = AutoMode::new(db.clone(), SystemState::shared(), FAST);

        auto.set_enabled(true).await;
        wait_for(|| auto.status().ticks >= 2).await;
        auto.set_enabled(false).await;

        // Watered once to 80.0; later ticks see it above min.
        let log = db.watering_log(1).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].moisture_after, 80.0);
    }

    #[tokio::test]
    async fn disabling_stops_the_loop() {
        let db = seeded_db().await;
        // Long interval: the loop must wake on disable rather than sleep it out.
        let auto = AutoMode::new(db, SystemState::shared(), Duration::from_secs(60));

        auto.set_enabled(true).await;
        wait_for(|| auto.status().ticks >= 1).await;
        auto.set_enabled(false).await;
        wait_for(|| !auto.status().running).await;

        let ticks = auto.status().ticks;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(auto.status().ticks, ticks);
    }

    #[tokio::test]
    async fn redundant_disable_does_not_cut_next_interval_short() {
        let db = seeded_db().await;
        let auto = AutoMode::new(db, SystemState::shared(), Duration::from_secs(60));

        // Disabling while already off must leave nothing behind to wake the
        // next loop early.
        auto.set_enabled(false).await;
        auto.set_enabled(false).await;
        auto.set_enabled(true).await;
        wait_for(|| auto.status().ticks >= 1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(auto.status().ticks, 1);
        auto.set_enabled(false).await;
        wait_for(|| !auto.status().running).await;
    }

    #[tokio::test]
    async fn re_enable_after_stop_starts_new_loop() {
        let db = seeded_db().await;
        let shared = SystemState::shared();
        let auto = AutoMode::new(db, shared.clone(), FAST);

        auto.set_enabled(true).await;
        wait_for(|| auto.status().ticks >= 1).await;
        auto.set_enabled(false).await;
        wait_for(|| !auto.status().running).await;

        auto.set_enabled(true).await;
        wait_for(|| auto.status().running).await;
        assert_eq!(loop_starts(&shared).await, 2);
        auto.set_enabled(false).await;
    }

    async fn error_events(shared: &SharedState, prefix: &str) -> usize {
        shared
            .read()
            .await
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Error && e.detail.starts_with(prefix))
            .count()
    }

    #[tokio::test]
    async fn auto_loop_keeps_polling_after_failed_ticks() {
        let db = seeded_db().await;
        // Sensor 1 is below its minimum, so every tick tries to log a watering.
        drop_table(&db, "watering_events").await;
        let shared = SystemState::shared();
        let auto = AutoMode::new(db.clone(), shared.clone(), FAST);

        auto.set_enabled(true).await;
        wait_for(|| auto.status().ticks >= 3).await;

        assert!(auto.status().running);
        assert!(error_events(&shared, "auto tick failed").await >= 2);
        // The failed transactions left the sensor untouched.
        assert_eq!(db.get_sensor(1).await.unwrap().unwrap().current_moisture, 50.0);
        auto.set_enabled(false).await;
        wait_for(|| !auto.status().running).await;
    }

    #[tokio::test]
    async fn schedule_loop_keeps_polling_after_failed_ticks() {
        let db = seeded_db().await;
        drop_table(&db, "schedules").await;
        let shared = SystemState::shared();
        let stop = StopHandle::new();
        let handle = spawn_schedule_loop(db, shared.clone(), FAST, UtcOffset::UTC, stop.clone());

        tokio::time::timeout(Duration::from_secs(2), async {
            while error_events(&shared, "schedule tick failed").await < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("schedule loop stopped retrying");
        assert!(!handle.is_finished());

        stop.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("schedule loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn stop_handle_resolves_after_stop() {
        let stop = StopHandle::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        stop.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter did not wake")
            .unwrap();
        // Already stopped: resolves immediately.
        stop.stopped().await;
    }

    #[tokio::test]
    async fn schedule_loop_exits_on_stop() {
        let db = seeded_db().await;
        let stop = StopHandle::new();
        let handle = spawn_schedule_loop(
            db,
            SystemState::shared(),
            FAST,
            UtcOffset::UTC,
            stop.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("schedule loop did not stop")
            .unwrap();
    }
}
