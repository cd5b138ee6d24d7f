//! Callbacks a batch reports through.
//!
//! All methods are called from the batch actor task, one at a time, so
//! implementations never see two callbacks of the same batch
//! concurrently. They must not block.

use booth_core::classification::JobError;
use booth_core::job::JobRecord;
use booth_core::types::JobIndex;

use crate::batch::BatchResult;

/// Receives the lifecycle of one batch. Every method defaults to a no-op.
pub trait BatchObserver: Send + Sync + 'static {
    /// A slot started a fresh submission (initial or user resubmit).
    fn on_item_start(&self, _index: JobIndex) {}

    /// Visible state of a job changed: status, progress, ETA, worker
    /// or queue position. Receives the updated record.
    fn on_item_progress(&self, _job: &JobRecord) {}

    /// The job became Ready.
    fn on_item_complete(&self, _job: &JobRecord) {}

    /// The job ended Failed or Canceled.
    fn on_item_error(&self, _job: &JobRecord, _error: &JobError) {}

    /// Every job of the batch is terminal. Called exactly once.
    fn on_all_complete(&self, _result: &BatchResult) {}

    /// The provider reported insufficient funds. At most once per batch.
    fn on_out_of_credits(&self) {}

    /// The provider rejected our credentials. At most once per batch.
    fn on_auth_required(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BatchObserver for NoopObserver {}

/// Observer that writes the lifecycle to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl BatchObserver for TracingObserver {
    fn on_item_start(&self, index: JobIndex) {
        tracing::info!(index, "Job started");
    }

    fn on_item_progress(&self, job: &JobRecord) {
        tracing::debug!(
            index = job.index,
            status = job.status.as_str(),
            progress = job.progress,
            eta_secs = ?job.eta_secs,
            worker = ?job.worker_name,
            "Job progress",
        );
    }

    fn on_item_complete(&self, job: &JobRecord) {
        tracing::info!(
            index = job.index,
            result_url = ?job.result_url,
            fallback = job.fallback,
            "Job complete",
        );
    }

    fn on_item_error(&self, job: &JobRecord, error: &JobError) {
        tracing::warn!(
            index = job.index,
            status = job.status.as_str(),
            error = %error,
            "Job ended without a result",
        );
    }

    fn on_all_complete(&self, result: &BatchResult) {
        tracing::info!(
            batch_id = %result.batch_id,
            success = result.success,
            jobs = result.entries.len(),
            "Batch complete",
        );
    }

    fn on_out_of_credits(&self) {
        tracing::warn!("Provider reports insufficient credits");
    }

    fn on_auth_required(&self) {
        tracing::warn!("Provider requires re-authentication");
    }
}
