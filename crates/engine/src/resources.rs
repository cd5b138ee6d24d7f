//! Accounting for the background tasks a job owns.
//!
//! Every timer and event listener the engine starts is a [`TrackedTask`]:
//! a spawned task that bumps a [`ResourceGauge`] counter while alive and
//! is aborted and un-counted when dropped. Tearing a job down is
//! therefore just dropping its tasks, and a gauge reading of zero after a
//! terminal transition proves nothing was left running.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

/// What a tracked task is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Baseline, liveness, retry, fallback or grace timer.
    Timer,
    /// Provider event subscription.
    Listener,
}

/// Point-in-time count of live tracked tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCounts {
    pub timers: usize,
    pub listeners: usize,
}

impl ResourceCounts {
    pub fn is_idle(&self) -> bool {
        self.timers == 0 && self.listeners == 0
    }
}

impl std::ops::Add for ResourceCounts {
    type Output = ResourceCounts;

    fn add(self, rhs: ResourceCounts) -> ResourceCounts {
        ResourceCounts {
            timers: self.timers + rhs.timers,
            listeners: self.listeners + rhs.listeners,
        }
    }
}

/// Shared counters of live tracked tasks. Cloning shares the counters.
#[derive(Debug, Clone, Default)]
pub struct ResourceGauge {
    timers: Arc<AtomicUsize>,
    listeners: Arc<AtomicUsize>,
}

impl ResourceGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` as a task counted under `kind` until it is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, kind: ResourceKind, future: F) -> TrackedTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.counter(kind).fetch_add(1, Ordering::SeqCst);
        TrackedTask {
            handle: tokio::spawn(future),
            kind,
            gauge: self.clone(),
        }
    }

    pub fn counts(&self) -> ResourceCounts {
        ResourceCounts {
            timers: self.timers.load(Ordering::SeqCst),
            listeners: self.listeners.load(Ordering::SeqCst),
        }
    }

    fn counter(&self, kind: ResourceKind) -> &AtomicUsize {
        match kind {
            ResourceKind::Timer => &self.timers,
            ResourceKind::Listener => &self.listeners,
        }
    }
}

/// A counted background task, aborted when dropped.
///
/// The count is released on drop rather than on task exit, so a timer
/// that already fired still counts until its owner lets go of it.
#[derive(Debug)]
pub struct TrackedTask {
    handle: JoinHandle<()>,
    kind: ResourceKind,
    gauge: ResourceGauge,
}

impl TrackedTask {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

impl Drop for TrackedTask {
    fn drop(&mut self) {
        self.handle.abort();
        self.gauge.counter(self.kind).fetch_sub(1, Ordering::SeqCst);
    }
}
