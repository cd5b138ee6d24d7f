//! Batch submission and the handle callers keep for a running batch.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use booth_core::cooldown::CancelCheck;
use booth_core::error::CoreError;
use booth_core::job::{JobRecord, JobSpec};
use booth_core::refund::estimate_refund;
use booth_core::types::{BatchId, JobIndex};
use booth_provider::GenerationProvider;
use tokio::sync::{mpsc, oneshot, watch};

use crate::batch::{BatchActor, BatchMsg, BatchParts, BatchResult, BatchSignals};
use crate::cancel::{CancelRateLimiter, CancelReceipt};
use crate::config::EngineConfig;
use crate::observer::BatchObserver;
use crate::resources::{ResourceCounts, ResourceGauge};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("A batch needs at least one job")]
    EmptyBatch,

    #[error("Job index {0} appears more than once in the batch")]
    DuplicateIndex(JobIndex),

    #[error("Job {index} is invalid: {source}")]
    InvalidSpec { index: JobIndex, source: CoreError },

    #[error("No job with index {0} in this batch")]
    UnknownIndex(JobIndex),

    #[error("Job {0} is still running")]
    JobActive(JobIndex),

    #[error("Batch is no longer running")]
    BatchClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("Cancel is cooling down, try again in {remaining_secs}s")]
    CoolingDown { remaining_secs: u64 },

    #[error("No job with index {0} in this batch")]
    UnknownIndex(JobIndex),

    #[error("Job {index} is already {status}")]
    NotActive { index: JobIndex, status: &'static str },

    #[error("Batch is no longer running")]
    BatchClosed,
}

/// Entry point: submits batches against one provider.
///
/// Cheap to share behind an `Arc`; every batch runs on its own task.
pub struct JobOrchestrator {
    provider: Arc<dyn GenerationProvider>,
    limiter: Arc<CancelRateLimiter>,
    config: Arc<EngineConfig>,
}

impl JobOrchestrator {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        limiter: Arc<CancelRateLimiter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            limiter,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a cancel may be issued right now, for any batch.
    pub fn can_cancel(&self) -> CancelCheck {
        self.limiter.can_cancel()
    }

    pub fn cancel_limiter(&self) -> &Arc<CancelRateLimiter> {
        &self.limiter
    }

    /// Validate `specs` and start the batch.
    ///
    /// Returns as soon as the batch actor is running; creation calls are
    /// issued in the background. Use [`BatchHandle::wait_started`] to
    /// wait for them. Must be called from within a Tokio runtime.
    pub fn submit_batch(
        &self,
        specs: Vec<JobSpec>,
        observer: Arc<dyn BatchObserver>,
    ) -> Result<BatchHandle, OrchestratorError> {
        validate_batch(&specs)?;

        let batch_id = uuid::Uuid::now_v7();
        let gauges: Arc<BTreeMap<JobIndex, ResourceGauge>> = Arc::new(
            specs
                .iter()
                .map(|spec| (spec.index, ResourceGauge::new()))
                .collect(),
        );
        let batch_gauge = ResourceGauge::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = watch::channel(false);
        let (result_tx, result_rx) = watch::channel(None);

        tracing::info!(%batch_id, jobs = specs.len(), "Submitting batch");

        let actor = BatchActor::new(
            BatchParts {
                batch_id,
                specs,
                gauges: Arc::clone(&gauges),
                batch_gauge: batch_gauge.clone(),
                tx: tx.clone(),
                rx,
                signals: BatchSignals {
                    started: started_tx,
                    result: result_tx,
                },
                limiter: Arc::clone(&self.limiter),
            },
            Arc::clone(&self.provider),
            Arc::clone(&self.config),
            observer,
        );
        tokio::spawn(actor.run());

        Ok(BatchHandle {
            batch_id,
            tx,
            provider: Arc::clone(&self.provider),
            limiter: Arc::clone(&self.limiter),
            gauges,
            batch_gauge,
            started: started_rx,
            result: result_rx,
        })
    }
}

fn validate_batch(specs: &[JobSpec]) -> Result<(), OrchestratorError> {
    if specs.is_empty() {
        return Err(OrchestratorError::EmptyBatch);
    }
    let mut seen = HashSet::with_capacity(specs.len());
    for spec in specs {
        if !seen.insert(spec.index) {
            return Err(OrchestratorError::DuplicateIndex(spec.index));
        }
        spec.validate()
            .map_err(|source| OrchestratorError::InvalidSpec {
                index: spec.index,
                source,
            })?;
    }
    Ok(())
}

/// Control surface of one running batch.
///
/// Dropping the handle does not stop the batch: it runs to completion
/// and reports through its observer, then its task exits.
pub struct BatchHandle {
    batch_id: BatchId,
    tx: mpsc::UnboundedSender<BatchMsg>,
    provider: Arc<dyn GenerationProvider>,
    limiter: Arc<CancelRateLimiter>,
    gauges: Arc<BTreeMap<JobIndex, ResourceGauge>>,
    batch_gauge: ResourceGauge,
    started: watch::Receiver<bool>,
    result: watch::Receiver<Option<BatchResult>>,
}

impl std::fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandle")
            .field("batch_id", &self.batch_id)
            .finish_non_exhaustive()
    }
}

impl BatchHandle {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn indices(&self) -> impl Iterator<Item = JobIndex> + '_ {
        self.gauges.keys().copied()
    }

    /// Cancel job `index`.
    ///
    /// Refused while the cancel cooldown runs or another cancel is in
    /// flight. Otherwise the job is marked Canceled and released locally
    /// first, then the provider is asked to cancel it; the cooldown
    /// starts only if that call succeeds.
    pub async fn cancel(&self, index: JobIndex) -> Result<CancelReceipt, CancelError> {
        let permit = self
            .limiter
            .try_begin_cancel()
            .map_err(|check| CancelError::CoolingDown {
                remaining_secs: check.cooldown_seconds_remaining,
            })?;

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BatchMsg::Cancel { index, reply })
            .map_err(|_| CancelError::BatchClosed)?;
        let plan = rx.await.map_err(|_| CancelError::BatchClosed)??;

        let refund = estimate_refund(f64::from(plan.progress));
        let remote_cancel_issued = match plan.target {
            Some(target) => match self.provider.cancel_job(&target).await {
                Ok(()) => {
                    permit.commit();
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        batch_id = %self.batch_id,
                        index,
                        error = %e,
                        "Provider cancel failed; job is canceled locally only",
                    );
                    false
                }
            },
            None => false,
        };

        Ok(CancelReceipt {
            index,
            refund,
            remote_cancel_issued,
        })
    }

    /// Submit a finished job again (regenerate or manual retry).
    ///
    /// Previous results stay in the record's version history.
    pub async fn resubmit(&self, index: JobIndex) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BatchMsg::Resubmit { index, reply })
            .map_err(|_| OrchestratorError::BatchClosed)?;
        rx.await.map_err(|_| OrchestratorError::BatchClosed)?
    }

    /// Current records, ordered by index.
    pub async fn snapshot(&self) -> Result<Vec<JobRecord>, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BatchMsg::Snapshot { reply })
            .map_err(|_| OrchestratorError::BatchClosed)?;
        rx.await.map_err(|_| OrchestratorError::BatchClosed)
    }

    /// Wait until every job's creation call resolved, successfully or
    /// terminally.
    pub async fn wait_started(&self) -> Result<(), OrchestratorError> {
        let mut started = self.started.clone();
        started
            .wait_for(|started| *started)
            .await
            .map(|_| ())
            .map_err(|_| OrchestratorError::BatchClosed)
    }

    /// Wait for the batch result.
    pub async fn wait(&self) -> Result<BatchResult, OrchestratorError> {
        let mut result = self.result.clone();
        let done = result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| OrchestratorError::BatchClosed)?;
        done.clone().ok_or(OrchestratorError::BatchClosed)
    }

    /// The batch result, if the batch already completed.
    pub fn result(&self) -> Option<BatchResult> {
        self.result.borrow().clone()
    }

    /// Live timers and listeners across the whole batch.
    pub fn active_resources(&self) -> ResourceCounts {
        self.gauges
            .values()
            .fold(self.batch_gauge.counts(), |acc, g| acc + g.counts())
    }

    /// Live timers and listeners of one job.
    pub fn job_resources(&self, index: JobIndex) -> Option<ResourceCounts> {
        self.gauges.get(&index).map(ResourceGauge::counts)
    }
}

impl Drop for BatchHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(BatchMsg::Close);
    }
}
