//! Generation job orchestration engine.
//!
//! [`JobOrchestrator`] fans a user action out into one or more provider
//! jobs and runs one actor task per batch. The actor owns every
//! [`JobRecord`](booth_core::job::JobRecord) of its batch and is the only
//! writer: provider events, watchdog ticks, retries, cancels and
//! resubmits all reach it as messages. On top of the actor:
//!
//! - [`correlator`] attributes project-wide events to individual jobs.
//! - [`completion`] decides, exactly once, when the batch is done.
//! - [`watchdog`] force-fails jobs that stop making progress.
//! - [`retry`] resubmits transient failures and never fatal ones.
//! - [`cancel`] rate-limits user cancels and persists the last one.

pub mod batch;
pub mod cancel;
pub mod completion;
pub mod config;
pub mod correlator;
pub mod observer;
pub mod orchestrator;
pub mod resources;
pub mod retry;
pub mod watchdog;

pub use batch::{BatchResult, JobOutcome};
pub use cancel::{CancelPermit, CancelRateLimiter, CancelReceipt};
pub use config::EngineConfig;
pub use observer::BatchObserver;
pub use orchestrator::{BatchHandle, JobOrchestrator, OrchestratorError};
