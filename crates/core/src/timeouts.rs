//! Watchdog budgets and the stall verdict.
//!
//! A job gets a baseline budget scaled by how much work it asked for.
//! Past the baseline it is killed once it has been idle for the
//! inactivity threshold, or once it outlives `baseline + inactivity`
//! no matter how chatty it is.

use std::time::Duration;

use crate::job::{JobKind, JobSpec, Quality};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Baseline for still-image jobs at `Quality::Fast`.
pub const DEFAULT_IMAGE_BASELINE_SECS: u64 = 90;

/// Fixed part of the baseline for video jobs at `Quality::Fast`.
pub const DEFAULT_VIDEO_BASELINE_SECS: u64 = 120;

/// Extra baseline per second of requested video.
pub const DEFAULT_VIDEO_PER_SECOND_SECS: u64 = 12;

/// How long a job may go without any lifecycle event once past baseline.
pub const DEFAULT_INACTIVITY_THRESHOLD_SECS: u64 = 60;

/// Interval of the recurring liveness check.
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Per-kind baseline budgets before quality scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineBudget {
    pub image: Duration,
    pub video: Duration,
    pub video_per_second: Duration,
}

impl Default for BaselineBudget {
    fn default() -> Self {
        Self {
            image: Duration::from_secs(DEFAULT_IMAGE_BASELINE_SECS),
            video: Duration::from_secs(DEFAULT_VIDEO_BASELINE_SECS),
            video_per_second: Duration::from_secs(DEFAULT_VIDEO_PER_SECOND_SECS),
        }
    }
}

pub fn quality_multiplier(quality: Quality) -> f64 {
    match quality {
        Quality::Fast => 1.0,
        Quality::Standard => 1.5,
        Quality::High => 2.0,
    }
}

/// Baseline timeout for `spec`: larger for higher quality and longer video.
pub fn baseline_timeout(spec: &JobSpec, budget: &BaselineBudget) -> Duration {
    let base = match spec.kind {
        JobKind::ImageEnhance | JobKind::MultiAngle { .. } => budget.image,
        JobKind::Video | JobKind::VideoTransition => {
            let secs = spec.payload.duration_secs.unwrap_or(0);
            budget.video + budget.video_per_second * secs
        }
    };
    base.mul_f64(quality_multiplier(spec.payload.quality))
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Outcome of one watchdog evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Healthy,
    /// Past baseline and silent for at least the inactivity threshold.
    Stalled { idle: Duration },
    /// Past `baseline + inactivity` while still emitting events.
    Overdue { elapsed: Duration },
}

impl WatchdogVerdict {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WatchdogVerdict::Healthy)
    }
}

/// Decide whether a job should be force-failed.
///
/// * `elapsed` - time since the job was armed.
/// * `idle`    - time since its last lifecycle event.
pub fn evaluate(
    elapsed: Duration,
    idle: Duration,
    baseline: Duration,
    inactivity: Duration,
) -> WatchdogVerdict {
    if elapsed < baseline {
        return WatchdogVerdict::Healthy;
    }
    if idle >= inactivity {
        return WatchdogVerdict::Stalled { idle };
    }
    if elapsed >= baseline + inactivity {
        return WatchdogVerdict::Overdue { elapsed };
    }
    WatchdogVerdict::Healthy
}
