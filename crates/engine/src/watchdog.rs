//! Per-job stall detection.
//!
//! A [`Watchdog`] is armed when a job is submitted and runs two tracked
//! timers: a one-shot deadline timer and a periodic liveness tick. Each
//! timer only reports a [`WatchdogTick`]; the owner calls
//! [`Watchdog::check`] from its own task, so the verdict is computed
//! against state that only the owner mutates.
//!
//! A job is force-failed when it has run past its baseline and has been
//! silent for the inactivity threshold, or when it has run past
//! `baseline + inactivity` no matter how many events it still emits.
//! The deadline timer first fires at the baseline; while the job is
//! still healthy the owner re-arms it for the moment the job would
//! next go stale, so a silent job fails on time rather than on the next
//! liveness tick.

use std::sync::Arc;
use std::time::Duration;

use booth_core::timeouts::{evaluate, WatchdogVerdict};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::WatchdogConfig;
use crate::resources::{ResourceGauge, ResourceKind, TrackedTask};

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogTick {
    Deadline,
    Liveness,
}

type TickSink = Arc<dyn Fn(WatchdogTick) + Send + Sync>;

/// Timers and activity clock for one submitted job.
pub struct Watchdog {
    baseline: Duration,
    inactivity: Duration,
    armed_at: Instant,
    last_activity: Instant,
    gauge: ResourceGauge,
    on_tick: TickSink,
    deadline_timer: Option<TrackedTask>,
    liveness_timer: Option<TrackedTask>,
}

impl Watchdog {
    /// Start both timers. `on_tick` runs on the timer tasks and should
    /// only forward the tick to the owner.
    pub fn arm<F>(
        config: &WatchdogConfig,
        baseline: Duration,
        gauge: &ResourceGauge,
        on_tick: F,
    ) -> Self
    where
        F: Fn(WatchdogTick) + Send + Sync + 'static,
    {
        let now = Instant::now();
        let on_tick: TickSink = Arc::new(on_tick);

        let liveness_tick = Arc::clone(&on_tick);
        let period = config.liveness_interval;
        let liveness_timer = gauge.spawn(ResourceKind::Timer, async move {
            let mut interval = tokio::time::interval_at(now + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                liveness_tick(WatchdogTick::Liveness);
            }
        });

        let mut watchdog = Self {
            baseline,
            inactivity: config.inactivity_threshold,
            armed_at: now,
            last_activity: now,
            gauge: gauge.clone(),
            on_tick,
            deadline_timer: None,
            liveness_timer: Some(liveness_timer),
        };
        watchdog.schedule_deadline(now + baseline);
        watchdog
    }

    /// Record a lifecycle event.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn baseline(&self) -> Duration {
        self.baseline
    }

    pub fn elapsed(&self) -> Duration {
        self.armed_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn check(&self) -> WatchdogVerdict {
        evaluate(self.elapsed(), self.idle(), self.baseline, self.inactivity)
    }

    /// Earliest instant at which [`check`](Self::check) can stop being
    /// healthy, given the activity seen so far.
    pub fn next_deadline(&self) -> Instant {
        let baseline_at = self.armed_at + self.baseline;
        let ceiling = baseline_at + self.inactivity;
        (self.last_activity + self.inactivity)
            .max(baseline_at)
            .min(ceiling)
    }

    /// Move the deadline timer to [`next_deadline`](Self::next_deadline).
    /// Call after a deadline tick found the job healthy.
    pub fn rearm(&mut self) {
        if self.liveness_timer.is_none() {
            return;
        }
        self.schedule_deadline(self.next_deadline());
    }

    /// Stop both timers. Also happens on drop.
    pub fn disarm(&mut self) {
        self.deadline_timer = None;
        self.liveness_timer = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline_timer.is_some() || self.liveness_timer.is_some()
    }

    fn schedule_deadline(&mut self, at: Instant) {
        let on_tick = Arc::clone(&self.on_tick);
        self.deadline_timer = Some(self.gauge.spawn(ResourceKind::Timer, async move {
            tokio::time::sleep_until(at).await;
            on_tick(WatchdogTick::Deadline);
        }));
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("baseline", &self.baseline)
            .field("inactivity", &self.inactivity)
            .field("armed_at", &self.armed_at)
            .field("last_activity", &self.last_activity)
            .field("armed", &self.is_armed())
            .finish()
    }
}
