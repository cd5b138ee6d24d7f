//! Advisory refund estimate shown before a user confirms a cancel.
//!
//! The provider computes the real refund when it processes the cancel.
//! These numbers only set expectations and must not be treated as
//! authoritative.

use serde::Serialize;

/// Share of the cost retained even when a job is canceled before any
/// progress (queueing and dispatch overhead), in percent.
pub const BASE_RETENTION_PERCENT: f64 = 5.0;

/// Expected refund for canceling a job at a given progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundEstimate {
    /// Estimated refund, 0-100 percent of the job cost.
    pub percent: u8,
    pub message: String,
}

/// Estimate the refund for canceling at `progress_percent` (0-100).
///
/// Non-increasing in progress over `0..=100`: 0 % progress yields
/// a near-full refund, 100 % yields none. Out-of-range input is
/// clamped; NaN is treated as 0.
pub fn estimate_refund(progress_percent: f64) -> RefundEstimate {
    let progress = if progress_percent.is_nan() {
        0.0
    } else {
        progress_percent.clamp(0.0, 100.0)
    };

    let remaining = 100.0 - progress;
    let raw = remaining * (100.0 - BASE_RETENTION_PERCENT) / 100.0;
    let percent = raw.round().clamp(0.0, 100.0) as u8;

    let message = match percent {
        90..=100 => format!(
            "Nothing has been rendered yet. You should get back about {percent}% of the cost."
        ),
        50..=89 => format!("About {percent}% of the cost should be refunded."),
        10..=49 => format!(
            "This job is mostly done. Only about {percent}% of the cost would be refunded."
        ),
        1..=9 => format!("This job is almost finished. Expect a refund of about {percent}%."),
        _ => "This job is finished rendering. Canceling now will not refund anything.".to_string(),
    };

    RefundEstimate { percent, message }
}
