//! Cancel cooldown arithmetic.
//!
//! The provider rejects cancel requests that arrive faster than its own
//! minimum interval, so the client enforces the same spacing. The state
//! holder lives in the engine; this module only does the math.

use std::time::Duration;

use serde::Serialize;

use crate::types::Timestamp;

/// Minimum spacing between two issued cancel requests.
pub const CANCEL_COOLDOWN_SECS: u64 = 20;

/// Result of a cancel-intent check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelCheck {
    pub allowed: bool,
    /// Whole seconds until the next cancel is allowed (rounded up).
    pub cooldown_seconds_remaining: u64,
}

impl CancelCheck {
    pub const ALLOWED: CancelCheck = CancelCheck {
        allowed: true,
        cooldown_seconds_remaining: 0,
    };
}

/// Compute cancel eligibility from the last issued cancel.
///
/// A `last_cancel_at` in the future (clock skew, restored state) counts
/// as "just now", so the wait never exceeds `interval`.
pub fn check_cooldown(
    last_cancel_at: Option<Timestamp>,
    now: Timestamp,
    interval: Duration,
) -> CancelCheck {
    let Some(last) = last_cancel_at else {
        return CancelCheck::ALLOWED;
    };

    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= interval {
        return CancelCheck::ALLOWED;
    }

    let remaining = interval - elapsed;
    let mut secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs += 1;
    }
    CancelCheck {
        allowed: false,
        cooldown_seconds_remaining: secs,
    }
}
