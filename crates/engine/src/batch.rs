//! The per-batch actor.
//!
//! One task per batch owns every [`JobRecord`], the correlator and the
//! completion tracker. Creation results, provider events, watchdog
//! ticks, retry and grace timers, and user commands all arrive as
//! [`BatchMsg`]s on a single channel, so record updates and observer
//! callbacks are serialized without locks.
//!
//! Every background task a job owns is tracked on that job's
//! [`ResourceGauge`] and released on each terminal path. In aggregate
//! mode a Ready job keeps its listener until the batch completes.

use std::collections::BTreeMap;
use std::sync::Arc;

use booth_core::classification::{FatalKind, JobError, GENERIC_FAILURE_MESSAGE};
use booth_core::job::{JobRecord, JobSpec, JobStatus};
use booth_core::timeouts::{baseline_timeout, WatchdogVerdict};
use booth_core::types::{BatchId, JobIndex};
use booth_provider::messages::{EventKind, ProviderEvent};
use booth_provider::{CancelTarget, GenerationProvider, JobHandle, ProviderError};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::Instrument;

use crate::cancel::CancelRateLimiter;
use crate::completion::{CompletionMode, CompletionTracker};
use crate::config::EngineConfig;
use crate::correlator::{Attribution, EventCorrelator};
use crate::observer::BatchObserver;
use crate::orchestrator::{CancelError, OrchestratorError};
use crate::resources::{ResourceGauge, ResourceKind, TrackedTask};
use crate::retry::{RetryAttempt, RetryDecision};
use crate::watchdog::{Watchdog, WatchdogTick};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Final state of one job, as reported in a [`BatchResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub index: JobIndex,
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub error: Option<JobError>,
    /// Finished by the near-completion fallback, without a result.
    pub fallback: bool,
    pub attempts: u32,
}

impl From<&JobRecord> for JobOutcome {
    fn from(record: &JobRecord) -> Self {
        Self {
            index: record.index,
            status: record.status,
            result_url: record.result_url.clone(),
            error: record.error.clone(),
            fallback: record.fallback,
            attempts: record.attempt,
        }
    }
}

/// Outcome of a whole batch, entries ordered by index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub batch_id: BatchId,
    /// `true` when no job ended Failed. Canceled jobs do not count as
    /// failures.
    pub success: bool,
    pub entries: Vec<JobOutcome>,
}

impl BatchResult {
    fn collect<'a>(batch_id: BatchId, records: impl Iterator<Item = &'a JobRecord>) -> Self {
        let entries: Vec<JobOutcome> = records.map(JobOutcome::from).collect();
        let success = entries.iter().all(|e| e.status != JobStatus::Failed);
        Self {
            batch_id,
            success,
            entries,
        }
    }

    pub fn entry(&self, index: JobIndex) -> Option<&JobOutcome> {
        self.entries.iter().find(|e| e.index == index)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// What the actor needs to know to finish a cancel outside its task.
#[derive(Debug)]
pub(crate) struct CancelPlan {
    /// `None` while the job has not been created remotely yet.
    pub target: Option<CancelTarget>,
    pub progress: u8,
}

/// Messages handled by the batch actor. `epoch` identifies the
/// submission attempt a timer or listener belongs to; messages from an
/// older attempt are ignored.
pub(crate) enum BatchMsg {
    Created {
        index: JobIndex,
        epoch: u64,
        result: Result<JobHandle, ProviderError>,
    },
    Event {
        index: JobIndex,
        epoch: u64,
        raw: serde_json::Value,
    },
    ListenerClosed {
        index: JobIndex,
        epoch: u64,
    },
    Watchdog {
        index: JobIndex,
        epoch: u64,
        tick: WatchdogTick,
    },
    RetryDue {
        index: JobIndex,
        epoch: u64,
    },
    FallbackDue {
        index: JobIndex,
        epoch: u64,
    },
    GraceElapsed,
    Cancel {
        index: JobIndex,
        reply: oneshot::Sender<Result<CancelPlan, CancelError>>,
    },
    Resubmit {
        index: JobIndex,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<JobRecord>>,
    },
    /// The batch handle was dropped.
    Close,
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct JobSlot {
    spec: Arc<JobSpec>,
    record: JobRecord,
    retry: RetryAttempt,
    epoch: u64,
    gauge: ResourceGauge,
    target: Option<CancelTarget>,
    /// The first creation call resolved, successfully or terminally.
    creation_resolved: bool,
    listener: Option<TrackedTask>,
    watchdog: Option<Watchdog>,
    retry_timer: Option<TrackedTask>,
    fallback_timer: Option<TrackedTask>,
}

impl JobSlot {
    /// Drop every task of the current attempt.
    fn release(&mut self) {
        self.listener = None;
        self.release_timers();
    }

    fn release_timers(&mut self) {
        self.watchdog = None;
        self.fallback_timer = None;
        self.retry_timer = None;
    }
}

/// Channels the actor reports through, held by the batch handle.
pub(crate) struct BatchSignals {
    pub started: watch::Sender<bool>,
    pub result: watch::Sender<Option<BatchResult>>,
}

pub(crate) struct BatchActor {
    batch_id: BatchId,
    provider: Arc<dyn GenerationProvider>,
    limiter: Arc<CancelRateLimiter>,
    config: Arc<EngineConfig>,
    observer: Arc<dyn BatchObserver>,
    slots: BTreeMap<JobIndex, JobSlot>,
    correlator: EventCorrelator,
    tracker: CompletionTracker,
    tx: mpsc::UnboundedSender<BatchMsg>,
    rx: mpsc::UnboundedReceiver<BatchMsg>,
    batch_gauge: ResourceGauge,
    grace_timer: Option<TrackedTask>,
    pending_creations: usize,
    out_of_credits_signaled: bool,
    auth_signaled: bool,
    handle_closed: bool,
    signals: BatchSignals,
}

pub(crate) struct BatchParts {
    pub batch_id: BatchId,
    pub specs: Vec<JobSpec>,
    pub gauges: Arc<BTreeMap<JobIndex, ResourceGauge>>,
    pub batch_gauge: ResourceGauge,
    pub tx: mpsc::UnboundedSender<BatchMsg>,
    pub rx: mpsc::UnboundedReceiver<BatchMsg>,
    pub signals: BatchSignals,
    pub limiter: Arc<CancelRateLimiter>,
}

impl BatchActor {
    pub(crate) fn new(
        parts: BatchParts,
        provider: Arc<dyn GenerationProvider>,
        config: Arc<EngineConfig>,
        observer: Arc<dyn BatchObserver>,
    ) -> Self {
        let slots: BTreeMap<JobIndex, JobSlot> = parts
            .specs
            .into_iter()
            .map(|spec| {
                let index = spec.index;
                let slot = JobSlot {
                    record: JobRecord::new(index),
                    spec: Arc::new(spec),
                    retry: RetryAttempt::new(),
                    epoch: 0,
                    gauge: parts.gauges.get(&index).cloned().unwrap_or_default(),
                    target: None,
                    creation_resolved: false,
                    listener: None,
                    watchdog: None,
                    retry_timer: None,
                    fallback_timer: None,
                };
                (index, slot)
            })
            .collect();

        let tracker = CompletionTracker::new(config.completion_mode, slots.keys().copied());
        let correlator = EventCorrelator::new(config.result_url_pattern.clone());

        Self {
            batch_id: parts.batch_id,
            provider,
            limiter: parts.limiter,
            config,
            observer,
            slots,
            correlator,
            tracker,
            tx: parts.tx,
            rx: parts.rx,
            batch_gauge: parts.batch_gauge,
            grace_timer: None,
            pending_creations: 0,
            out_of_credits_signaled: false,
            auth_signaled: false,
            handle_closed: false,
            signals: parts.signals,
        }
    }

    /// Submit every job, then process messages until the handle is gone
    /// and nothing is left running.
    pub(crate) async fn run(mut self) {
        let span = tracing::info_span!("batch", batch_id = %self.batch_id);
        async move {
            tracing::info!(jobs = self.slots.len(), "Batch started");
            let indices: Vec<JobIndex> = self.slots.keys().copied().collect();
            for index in indices {
                self.begin_submission(index, true);
            }

            while let Some(msg) = self.rx.recv().await {
                self.handle(msg);
                if self.is_finished() {
                    break;
                }
            }

            for slot in self.slots.values_mut() {
                slot.release();
            }
            self.grace_timer = None;
            tracing::debug!("Batch actor exited");
        }
        .instrument(span)
        .await
    }

    fn is_finished(&self) -> bool {
        self.handle_closed
            && self.pending_creations == 0
            && self.tracker.has_fired()
            && self.slots.values().all(|s| s.record.status.is_terminal())
    }

    fn handle(&mut self, msg: BatchMsg) {
        match msg {
            BatchMsg::Created {
                index,
                epoch,
                result,
            } => self.on_created(index, epoch, result),
            BatchMsg::Event { index, epoch, raw } => {
                if self.is_current(index, epoch) {
                    self.on_event(index, raw);
                }
            }
            BatchMsg::ListenerClosed { index, epoch } => {
                if self.is_current(index, epoch) {
                    self.on_listener_closed(index);
                }
            }
            BatchMsg::Watchdog { index, epoch, tick } => {
                if self.is_current(index, epoch) {
                    self.on_watchdog(index, tick);
                }
            }
            BatchMsg::RetryDue { index, epoch } => {
                if self.is_current(index, epoch) {
                    self.on_retry_due(index);
                }
            }
            BatchMsg::FallbackDue { index, epoch } => {
                if self.is_current(index, epoch) {
                    self.on_fallback_due(index);
                }
            }
            BatchMsg::GraceElapsed => self.on_grace_elapsed(),
            BatchMsg::Cancel { index, reply } => {
                let _ = reply.send(self.cancel(index));
            }
            BatchMsg::Resubmit { index, reply } => {
                let _ = reply.send(self.resubmit(index));
            }
            BatchMsg::Snapshot { reply } => {
                let _ = reply.send(self.slots.values().map(|s| s.record.clone()).collect());
            }
            BatchMsg::Close => self.handle_closed = true,
        }
    }

    fn is_current(&self, index: JobIndex, epoch: u64) -> bool {
        self.slots.get(&index).map(|s| s.epoch) == Some(epoch)
    }

    // -- submission ---------------------------------------------------------

    fn begin_submission(&mut self, index: JobIndex, announce: bool) {
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };

        slot.epoch += 1;
        slot.record.attempt = slot.retry.begin();
        if announce {
            self.observer.on_item_start(index);
        }
        if let Err(e) = slot.record.transition(JobStatus::Submitting) {
            tracing::error!(index, error = %e, "Cannot submit job");
            return;
        }
        slot.record.status_text = Some("Submitting".into());
        self.observer.on_item_progress(&slot.record);

        let provider = Arc::clone(&self.provider);
        let spec = Arc::clone(&slot.spec);
        let tx = self.tx.clone();
        let epoch = slot.epoch;
        let timeout = self.config.submit_timeout;
        tracing::debug!(index, attempt = slot.record.attempt, "Submitting job");

        self.pending_creations += 1;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, provider.create_job(&spec)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(timeout.as_secs())),
            };
            let _ = tx.send(BatchMsg::Created {
                index,
                epoch,
                result,
            });
        });
    }

    fn on_created(&mut self, index: JobIndex, epoch: u64, result: Result<JobHandle, ProviderError>) {
        self.pending_creations = self.pending_creations.saturating_sub(1);
        let current = self.is_current(index, epoch);
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };

        let handle = match result {
            Ok(handle) => handle,
            Err(e) if current && !slot.record.status.is_terminal() => {
                tracing::warn!(index, error = %e, "Job creation failed");
                self.fail_attempt(index, JobError::creation(e.code(), e.message()));
                return;
            }
            Err(_) => return,
        };

        if !current || slot.record.status.is_terminal() {
            // Canceled (or resubmitted) while the creation call was in
            // flight: the remote job exists but nobody wants it.
            let target = handle.target();
            tracing::info!(index, project_id = %target.project_id, "Canceling orphaned job");
            tokio::spawn(cancel_orphan(
                Arc::clone(&self.provider),
                Arc::clone(&self.limiter),
                target,
            ));
            return;
        }

        let (target, events) = handle.into_parts();
        let now = chrono::Utc::now();
        slot.record.id = target.job_id.clone();
        slot.record.project_id = Some(target.project_id.clone());
        slot.record.started_at = Some(now);
        slot.record.last_activity_at = Some(now);
        self.correlator
            .bind(index, &target.project_id, target.job_id.as_deref());

        slot.listener = Some(spawn_listener(&slot.gauge, events, self.tx.clone(), index, epoch));

        let baseline = baseline_timeout(&slot.spec, &self.config.watchdog.budget);
        let tx = self.tx.clone();
        slot.watchdog = Some(Watchdog::arm(
            &self.config.watchdog,
            baseline,
            &slot.gauge,
            move |tick| {
                let _ = tx.send(BatchMsg::Watchdog { index, epoch, tick });
            },
        ));

        tracing::info!(
            index,
            project_id = %target.project_id,
            job_id = ?target.job_id,
            attempt = slot.record.attempt,
            baseline_secs = baseline.as_secs(),
            "Job created",
        );
        slot.target = Some(target);
        self.mark_creation_resolved(index);
    }

    fn on_retry_due(&mut self, index: JobIndex) {
        if let Some(slot) = self.slots.get_mut(&index) {
            slot.retry_timer = None;
            if slot.record.status == JobStatus::Pending {
                self.begin_submission(index, false);
            }
        }
    }

    // -- events -------------------------------------------------------------

    fn on_event(&mut self, source: JobIndex, raw: serde_json::Value) {
        let event = match ProviderEvent::decode(&raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(index = source, error = %e, raw_event = %raw, "Dropping undecodable provider event");
                return;
            }
        };

        let mut project_signal = false;
        if event.kind == EventKind::ProjectCompleted {
            let project = event.project_id.clone().or_else(|| {
                self.slots
                    .get(&source)
                    .and_then(|s| s.record.project_id.clone())
            });
            if let Some(project) = project {
                self.tracker.record_project_completion(&project);
                project_signal = true;
            }
        }

        let names_a_job = event.job_id.is_some()
            || event.structured_job_id.is_some()
            || event.result_url.is_some();
        if event.kind != EventKind::ProjectCompleted || names_a_job {
            match self.correlator.attribute(&event, source) {
                Attribution::Matched { index, strategy } => {
                    tracing::trace!(
                        index,
                        kind = event.kind.name(),
                        strategy = strategy.as_str(),
                        "Event attributed",
                    );
                    self.apply_event(index, event);
                }
                Attribution::Unattributed(reason) => {
                    tracing::debug!(
                        source,
                        kind = event.kind.name(),
                        ?reason,
                        "Dropping unattributed event",
                    );
                }
            }
        }

        if project_signal {
            self.maybe_complete();
        }
    }

    fn apply_event(&mut self, index: JobIndex, event: ProviderEvent) {
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };
        if matches!(slot.record.status, JobStatus::Pending) || slot.record.status.is_terminal() {
            tracing::debug!(
                index,
                kind = event.kind.name(),
                status = slot.record.status.as_str(),
                "Ignoring event for inactive job",
            );
            return;
        }

        if let Some(watchdog) = slot.watchdog.as_mut() {
            watchdog.touch();
        }
        slot.record.last_activity_at = Some(chrono::Utc::now());

        match event.kind {
            EventKind::Queued { position } => {
                let changed = slot.record.queue_position != position;
                slot.record.queue_position = position;
                // Position 1 is "up next" and not worth a status change.
                if let Some(p) = position.filter(|&p| p > 1) {
                    if changed {
                        slot.record.status_text = Some(format!("Queued (position {p})"));
                        self.observer.on_item_progress(&slot.record);
                    }
                }
            }
            EventKind::Started { worker_name } => {
                let mut changed = promote(&mut slot.record);
                if worker_name.is_some() && worker_name != slot.record.worker_name {
                    slot.record.worker_name = worker_name;
                    changed = true;
                }
                if changed {
                    self.observer.on_item_progress(&slot.record);
                }
            }
            EventKind::Progress { percent } => {
                let promoted = promote(&mut slot.record);
                let advanced = slot.record.apply_progress(percent);
                if promoted || advanced {
                    self.observer.on_item_progress(&slot.record);
                }
                if let Some(policy) = self.config.fallback {
                    if advanced && slot.record.progress >= policy.progress_threshold {
                        let tx = self.tx.clone();
                        let epoch = slot.epoch;
                        slot.fallback_timer = Some(slot.gauge.spawn(ResourceKind::Timer, async move {
                            tokio::time::sleep(policy.delay).await;
                            let _ = tx.send(BatchMsg::FallbackDue { index, epoch });
                        }));
                    }
                }
            }
            EventKind::Eta { seconds } => {
                if slot.record.eta_secs != Some(seconds) {
                    slot.record.eta_secs = Some(seconds);
                    self.observer.on_item_progress(&slot.record);
                }
            }
            EventKind::JobCompleted | EventKind::ProjectCompleted => {
                self.complete_job(index, event.result_url, false);
            }
            EventKind::Failed { code, message } => {
                let message = if message.trim().is_empty() {
                    GENERIC_FAILURE_MESSAGE.to_string()
                } else {
                    message
                };
                tracing::warn!(index, ?code, %message, "Provider reported job failure");
                self.fail_attempt(index, JobError::runtime(code, message));
            }
        }
    }

    fn on_listener_closed(&mut self, index: JobIndex) {
        if let Some(slot) = self.slots.get_mut(&index) {
            slot.listener = None;
            if !slot.record.status.is_terminal() {
                tracing::warn!(index, "Provider event stream closed before the job finished");
            }
        }
    }

    // -- timers -------------------------------------------------------------

    fn on_watchdog(&mut self, index: JobIndex, tick: WatchdogTick) {
        let Some(watchdog) = self.slots.get_mut(&index).and_then(|s| s.watchdog.as_mut()) else {
            return;
        };
        let elapsed = watchdog.elapsed();
        match watchdog.check() {
            WatchdogVerdict::Healthy => {
                tracing::trace!(index, ?tick, elapsed_secs = elapsed.as_secs(), "Watchdog check passed");
                if tick == WatchdogTick::Deadline {
                    watchdog.rearm();
                }
                return;
            }
            WatchdogVerdict::Stalled { idle } => {
                tracing::warn!(
                    index,
                    elapsed_secs = elapsed.as_secs(),
                    idle_secs = idle.as_secs(),
                    "Job stopped reporting, failing it",
                );
            }
            WatchdogVerdict::Overdue { elapsed } => {
                tracing::warn!(
                    index,
                    elapsed_secs = elapsed.as_secs(),
                    "Job exceeded its time budget, failing it",
                );
            }
        }
        self.terminate(
            index,
            JobStatus::Failed,
            JobError::Timeout {
                elapsed_secs: elapsed.as_secs(),
            },
        );
    }

    fn on_fallback_due(&mut self, index: JobIndex) {
        let Some(policy) = self.config.fallback else {
            return;
        };
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };
        slot.fallback_timer = None;
        if slot.record.status == JobStatus::Generating
            && slot.record.progress >= policy.progress_threshold
        {
            tracing::warn!(
                index,
                progress = slot.record.progress,
                "No completion after near-final progress, finishing without a result",
            );
            self.complete_job(index, None, true);
        }
    }

    fn on_grace_elapsed(&mut self) {
        self.grace_timer = None;
        if self.tracker.force_complete() {
            tracing::warn!("Aggregate completion signal missing, completing batch after grace period");
            self.finish_batch();
        }
    }

    // -- commands -----------------------------------------------------------

    fn cancel(&mut self, index: JobIndex) -> Result<CancelPlan, CancelError> {
        let slot = self
            .slots
            .get(&index)
            .ok_or(CancelError::UnknownIndex(index))?;
        if slot.record.status.is_terminal() {
            return Err(CancelError::NotActive {
                index,
                status: slot.record.status.as_str(),
            });
        }

        let plan = CancelPlan {
            target: slot.target.clone(),
            progress: slot.record.progress,
        };
        tracing::info!(index, progress = plan.progress, "Canceling job");
        self.terminate(index, JobStatus::Canceled, JobError::Cancelled);
        Ok(plan)
    }

    fn resubmit(&mut self, index: JobIndex) -> Result<(), OrchestratorError> {
        let slot = self
            .slots
            .get_mut(&index)
            .ok_or(OrchestratorError::UnknownIndex(index))?;
        if !slot.record.status.is_terminal() {
            return Err(OrchestratorError::JobActive(index));
        }

        slot.release();
        slot.record.reset_for_resubmit();
        slot.retry = RetryAttempt::new();
        slot.target = None;

        if self.tracker.reopen(index) {
            self.grace_timer = None;
        }
        tracing::info!(index, "Resubmitting job");
        self.begin_submission(index, true);
        Ok(())
    }

    // -- transitions --------------------------------------------------------

    /// An attempt failed: retry it or give up on the job.
    fn fail_attempt(&mut self, index: JobIndex, error: JobError) {
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };
        slot.release();
        slot.target = None;
        self.correlator.deactivate(index);

        match self.config.retry.decide(&mut slot.retry, &error) {
            RetryDecision::Retry { delay } => {
                tracing::warn!(
                    index,
                    attempt = slot.retry.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying",
                );
                slot.record.reset_for_resubmit();
                slot.record.status_text = Some(format!(
                    "Retrying ({}/{})",
                    slot.retry.attempt + 1,
                    self.config.retry.max_attempts
                ));
                self.observer.on_item_progress(&slot.record);

                let tx = self.tx.clone();
                let epoch = slot.epoch;
                slot.retry_timer = Some(slot.gauge.spawn(ResourceKind::Timer, async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(BatchMsg::RetryDue { index, epoch });
                }));
            }
            RetryDecision::GiveUp => self.terminate(index, JobStatus::Failed, error),
        }
    }

    /// Move a job to Failed or Canceled and release everything it holds.
    fn terminate(&mut self, index: JobIndex, status: JobStatus, error: JobError) {
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };
        slot.release();
        if let Err(e) = slot.record.transition(status) {
            tracing::error!(index, error = %e, "Dropping terminal transition");
            return;
        }
        slot.record.status_text = Some(error.user_message());
        slot.record.error = Some(error.clone());
        self.correlator.deactivate(index);

        tracing::info!(index, status = status.as_str(), error = %error, "Job ended");
        self.observer.on_item_error(&slot.record, &error);

        match error.fatal_kind() {
            Some(FatalKind::InsufficientFunds) if !self.out_of_credits_signaled => {
                self.out_of_credits_signaled = true;
                self.observer.on_out_of_credits();
            }
            Some(FatalKind::Unauthorized) if !self.auth_signaled => {
                self.auth_signaled = true;
                self.observer.on_auth_required();
            }
            _ => {}
        }

        self.settle(index);
    }

    /// Move a job to Ready. Ignored unless the job is generating.
    fn complete_job(&mut self, index: JobIndex, result_url: Option<String>, fallback: bool) {
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };
        promote(&mut slot.record);
        if !slot.record.accept_result(result_url) {
            tracing::debug!(index, status = slot.record.status.as_str(), "Ignoring duplicate completion");
            return;
        }
        slot.record.fallback = fallback;
        slot.record.status_text = None;
        slot.record.queue_position = None;
        slot.record.eta_secs = None;
        if self.tracker.mode() == CompletionMode::Aggregate && !fallback {
            // The project-level completion still arrives on this stream.
            slot.release_timers();
        } else {
            slot.release();
        }
        self.correlator.deactivate(index);

        tracing::info!(
            index,
            result_url = ?slot.record.result_url,
            attempt = slot.record.attempt,
            fallback,
            "Job ready",
        );
        self.observer.on_item_complete(&slot.record);

        if !fallback {
            if let Some(project) = slot.record.project_id.as_deref() {
                self.tracker.expect_project(project);
            }
        }
        self.settle(index);
    }

    /// Count a terminal job and complete the batch if it was the last.
    fn settle(&mut self, index: JobIndex) {
        self.mark_creation_resolved(index);
        if !self.tracker.record_terminal(index) {
            tracing::debug!(index, "Job already counted");
        }
        self.maybe_complete();
    }

    fn maybe_complete(&mut self) {
        if self.tracker.try_complete() {
            self.finish_batch();
        } else if self.tracker.awaiting_aggregate() && self.grace_timer.is_none() {
            let tx = self.tx.clone();
            let grace = self.config.aggregate_grace;
            tracing::debug!(grace_secs = grace.as_secs(), "Waiting for aggregate completion");
            self.grace_timer = Some(self.batch_gauge.spawn(ResourceKind::Timer, async move {
                tokio::time::sleep(grace).await;
                let _ = tx.send(BatchMsg::GraceElapsed);
            }));
        }
    }

    fn finish_batch(&mut self) {
        self.grace_timer = None;
        for slot in self.slots.values_mut() {
            if slot.record.status.is_terminal() {
                slot.release();
            }
        }
        let result = BatchResult::collect(self.batch_id, self.slots.values().map(|s| &s.record));
        tracing::info!(
            success = result.success,
            jobs = result.entries.len(),
            "Batch complete",
        );
        self.observer.on_all_complete(&result);
        self.signals.result.send_replace(Some(result));
    }

    fn mark_creation_resolved(&mut self, index: JobIndex) {
        if let Some(slot) = self.slots.get_mut(&index) {
            slot.creation_resolved = true;
        }
        if self.slots.values().all(|s| s.creation_resolved) {
            self.signals.started.send_if_modified(|started| {
                let changed = !*started;
                *started = true;
                changed
            });
        }
    }
}

/// Submitting -> Generating when the first sign of work arrives.
fn promote(record: &mut JobRecord) -> bool {
    if record.status != JobStatus::Submitting {
        return false;
    }
    if record.transition(JobStatus::Generating).is_err() {
        return false;
    }
    record.queue_position = None;
    record.status_text = Some("Generating".into());
    true
}

/// Cancel a remote job nobody wants any more, waiting out the cancel
/// cooldown first. Only a cancel the provider accepted starts a new one.
async fn cancel_orphan(
    provider: Arc<dyn GenerationProvider>,
    limiter: Arc<CancelRateLimiter>,
    target: CancelTarget,
) {
    let permit = loop {
        match limiter.try_begin_cancel() {
            Ok(permit) => break permit,
            Err(check) => {
                let wait = check.cooldown_seconds_remaining.max(1);
                tracing::debug!(project_id = %target.project_id, wait, "Orphan cancel waiting for cooldown");
                tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
            }
        }
    };

    match provider.cancel_job(&target).await {
        Ok(()) => permit.commit(),
        Err(e) => {
            tracing::warn!(project_id = %target.project_id, error = %e, "Orphan cancel failed");
        }
    }
}

fn spawn_listener(
    gauge: &ResourceGauge,
    mut events: broadcast::Receiver<serde_json::Value>,
    tx: mpsc::UnboundedSender<BatchMsg>,
    index: JobIndex,
    epoch: u64,
) -> TrackedTask {
    gauge.spawn(ResourceKind::Listener, async move {
        loop {
            match events.recv().await {
                Ok(raw) => {
                    if tx.send(BatchMsg::Event { index, epoch, raw }).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(index, skipped, "Event listener lagged, events dropped");
                }
                Err(RecvError::Closed) => {
                    let _ = tx.send(BatchMsg::ListenerClosed { index, epoch });
                    break;
                }
            }
        }
    })
}
