//! Cancel rate limiting.
//!
//! One [`CancelRateLimiter`] is shared by every batch of a process: a
//! cancel that actually reached the provider starts a cooldown during
//! which further cancels are refused. The last cancel time is kept in a
//! [`CancelStateStore`] so the cooldown survives restarts, and every
//! change of the verdict is published on a watch channel.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use booth_core::cooldown::{check_cooldown, CancelCheck};
use booth_core::refund::RefundEstimate;
use booth_core::types::{JobIndex, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock source, swappable for tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(delta) = chrono::Duration::from_std(by) {
            *self.now.lock().unwrap_or_else(PoisonError::into_inner) += delta;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Cancel state I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancel state is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

/// Where the last issued cancel time lives between runs.
pub trait CancelStateStore: Send + Sync + 'static {
    fn load(&self) -> Result<Option<Timestamp>, StoreError>;
    fn save(&self, at: Timestamp) -> Result<(), StoreError>;
}

/// Keeps the timestamp in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    last: Mutex<Option<Timestamp>>,
}

impl CancelStateStore for MemoryStore {
    fn load(&self) -> Result<Option<Timestamp>, StoreError> {
        Ok(*self.last.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn save(&self, at: Timestamp) -> Result<(), StoreError> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCancelState {
    last_cancel_at: Option<Timestamp>,
}

/// Keeps the timestamp in a small JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CancelStateStore for JsonFileStore {
    fn load(&self) -> Result<Option<Timestamp>, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: PersistedCancelState = serde_json::from_str(&raw)?;
        Ok(state.last_cancel_at)
    }

    fn save(&self, at: Timestamp) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(&PersistedCancelState {
            last_cancel_at: Some(at),
        })?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Process-wide cancel cooldown.
pub struct CancelRateLimiter {
    interval: Duration,
    clock: Arc<dyn Clock>,
    store: Arc<dyn CancelStateStore>,
    state: Mutex<CooldownState>,
    changes: watch::Sender<CancelCheck>,
}

#[derive(Debug, Default)]
struct CooldownState {
    last_cancel_at: Option<Timestamp>,
    /// A reserved cancel has not reported back yet.
    in_flight: bool,
}

impl CancelRateLimiter {
    /// Build a limiter, restoring the last cancel time from `store`.
    ///
    /// An unreadable store is logged and treated as empty.
    pub fn new(
        interval: Duration,
        clock: Arc<dyn Clock>,
        store: Arc<dyn CancelStateStore>,
    ) -> Self {
        let last_cancel_at = store.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not restore cancel state, starting fresh");
            None
        });
        let initial = check_cooldown(last_cancel_at, clock.now(), interval);
        let (changes, _) = watch::channel(initial);
        Self {
            interval,
            clock,
            store,
            state: Mutex::new(CooldownState {
                last_cancel_at,
                in_flight: false,
            }),
            changes,
        }
    }

    /// In-memory limiter on the system clock.
    pub fn in_memory(interval: Duration) -> Self {
        Self::new(interval, Arc::new(SystemClock), Arc::new(MemoryStore::default()))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a cancel may be issued now.
    ///
    /// While a reserved cancel is in flight the answer is no, with the
    /// full interval as the remaining time.
    pub fn can_cancel(&self) -> CancelCheck {
        let check = self.check_locked(&self.lock());
        self.publish(check);
        check
    }

    /// Reserve the right to issue one cancel.
    ///
    /// The check and the reservation happen under one lock, so of two
    /// concurrent callers at most one gets a permit. Commit the permit
    /// once the provider accepted the cancel; dropping it uncommitted
    /// frees the slot without starting the cooldown.
    pub fn try_begin_cancel(self: &Arc<Self>) -> Result<CancelPermit, CancelCheck> {
        let check = {
            let mut state = self.lock();
            let check = self.check_locked(&state);
            if check.allowed {
                state.in_flight = true;
            }
            check
        };
        if !check.allowed {
            self.publish(check);
            return Err(check);
        }
        self.publish(self.busy());
        Ok(CancelPermit {
            limiter: Arc::clone(self),
            settled: false,
        })
    }

    /// Start the cooldown. Call only after a cancel reached the provider.
    pub fn record_cancel(&self) {
        let now = self.clock.now();
        {
            let mut state = self.lock();
            state.last_cancel_at = Some(now);
            state.in_flight = false;
        }

        if let Err(e) = self.store.save(now) {
            tracing::warn!(error = %e, "Failed to persist cancel state");
        }
        self.publish(check_cooldown(Some(now), now, self.interval));
    }

    /// Subscribe to verdict changes. A change is published whenever a
    /// cancel is reserved, recorded or abandoned, or a check observes a
    /// different verdict.
    pub fn subscribe(&self) -> watch::Receiver<CancelCheck> {
        self.changes.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, CooldownState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_locked(&self, state: &CooldownState) -> CancelCheck {
        if state.in_flight {
            return self.busy();
        }
        check_cooldown(state.last_cancel_at, self.clock.now(), self.interval)
    }

    fn busy(&self) -> CancelCheck {
        CancelCheck {
            allowed: false,
            cooldown_seconds_remaining: self.interval.as_secs(),
        }
    }

    fn release(&self) {
        let check = {
            let mut state = self.lock();
            state.in_flight = false;
            check_cooldown(state.last_cancel_at, self.clock.now(), self.interval)
        };
        self.publish(check);
    }

    fn publish(&self, check: CancelCheck) {
        self.changes.send_if_modified(|current| {
            if *current == check {
                false
            } else {
                *current = check;
                true
            }
        });
    }
}

/// A reserved cancel. See [`CancelRateLimiter::try_begin_cancel`].
#[must_use = "an unused permit releases its reservation immediately"]
pub struct CancelPermit {
    limiter: Arc<CancelRateLimiter>,
    settled: bool,
}

impl CancelPermit {
    /// The cancel reached the provider: start the cooldown.
    pub fn commit(mut self) {
        self.settled = true;
        self.limiter.record_cancel();
    }
}

impl Drop for CancelPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.limiter.release();
        }
    }
}

impl std::fmt::Debug for CancelPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelPermit")
            .field("settled", &self.settled)
            .finish()
    }
}

/// Outcome of a successful cancel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelReceipt {
    pub index: JobIndex,
    /// Advisory estimate from the job's progress at cancel time.
    pub refund: RefundEstimate,
    /// Whether the provider accepted the remote cancel. `false` when the
    /// job was canceled before it was created or the call failed.
    pub remote_cancel_issued: bool,
}
