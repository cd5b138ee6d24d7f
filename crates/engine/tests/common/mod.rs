#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use booth_core::classification::JobError;
use booth_core::job::{JobKind, JobPayload, JobRecord, JobSpec, Quality, TokenType};
use booth_core::types::JobIndex;
use booth_engine::cancel::{CancelRateLimiter, ManualClock, MemoryStore};
use booth_engine::config::WatchdogConfig;
use booth_engine::observer::BatchObserver;
use booth_engine::{BatchResult, EngineConfig, JobOrchestrator};
use booth_provider::{CancelTarget, GenerationProvider, JobHandle, ProviderError};
use serde_json::{json, Value};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// What the next `create_job` call for a slot does.
#[derive(Debug, Clone)]
pub enum Create {
    Accept,
    Reject { code: Option<i64>, message: String },
    /// Accept after a delay.
    Delay(Duration),
    /// Never returns; exercises the submission timeout.
    Hang,
}

impl Create {
    pub fn reject(code: Option<i64>, message: &str) -> Self {
        Create::Reject {
            code,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub index: JobIndex,
    pub project_id: String,
    pub job_id: Option<String>,
}

#[derive(Default)]
struct State {
    projects: HashMap<String, broadcast::Sender<Value>>,
    scripts: HashMap<JobIndex, VecDeque<Create>>,
    created: Vec<CreatedJob>,
    create_calls: HashMap<JobIndex, usize>,
    cancels: Vec<CancelTarget>,
    counter: usize,
}

/// In-process provider driven by the test.
///
/// Every accepted job gets its own project (`proj-<index>-<n>`) unless a
/// shared project is configured, and a job id `job-<index>-<n>` unless
/// ids are disabled. Events are pushed with [`ScriptedProvider::emit`].
pub struct ScriptedProvider {
    state: Mutex<State>,
    shared_project: Option<String>,
    assign_job_ids: bool,
    fail_cancels: bool,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::builder())
    }

    pub fn builder() -> Self {
        Self {
            state: Mutex::new(State::default()),
            shared_project: None,
            assign_job_ids: true,
            fail_cancels: false,
        }
    }

    pub fn shared_project(mut self, project_id: &str) -> Self {
        self.shared_project = Some(project_id.to_string());
        self
    }

    pub fn without_job_ids(mut self) -> Self {
        self.assign_job_ids = false;
        self
    }

    pub fn failing_cancels(mut self) -> Self {
        self.fail_cancels = true;
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Queue creation behaviours for `index`; once used up, calls accept.
    pub fn script(&self, index: JobIndex, steps: impl IntoIterator<Item = Create>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(index)
            .or_default()
            .extend(steps);
    }

    pub fn emit(&self, project_id: &str, event: Value) {
        let sender = self.state.lock().unwrap().projects.get(project_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    /// Latest accepted attempt of `index`.
    pub fn created(&self, index: JobIndex) -> CreatedJob {
        self.state
            .lock()
            .unwrap()
            .created
            .iter()
            .rev()
            .find(|c| c.index == index)
            .cloned()
            .unwrap_or_else(|| panic!("job {index} was never created"))
    }

    pub fn project_of(&self, index: JobIndex) -> String {
        self.created(index).project_id
    }

    pub fn job_id_of(&self, index: JobIndex) -> String {
        self.created(index).job_id.expect("job id assigned")
    }

    pub fn create_calls(&self, index: JobIndex) -> usize {
        self.state
            .lock()
            .unwrap()
            .create_calls
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    pub fn cancels(&self) -> Vec<CancelTarget> {
        self.state.lock().unwrap().cancels.clone()
    }

    pub fn subscribers(&self, project_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .projects
            .get(project_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn create_job(&self, spec: &JobSpec) -> Result<JobHandle, ProviderError> {
        let step = {
            let mut state = self.state.lock().unwrap();
            *state.create_calls.entry(spec.index).or_default() += 1;
            state
                .scripts
                .get_mut(&spec.index)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Create::Accept)
        };

        match step {
            Create::Accept => {}
            Create::Reject { code, message } => {
                return Err(ProviderError::Rejected { code, message });
            }
            Create::Delay(delay) => tokio::time::sleep(delay).await,
            Create::Hang => std::future::pending::<()>().await,
        }

        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let n = state.counter;
        let project_id = self
            .shared_project
            .clone()
            .unwrap_or_else(|| format!("proj-{}-{n}", spec.index));
        let job_id = self
            .assign_job_ids
            .then(|| format!("job-{}-{n}", spec.index));
        let events = state
            .projects
            .entry(project_id.clone())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe();
        state.created.push(CreatedJob {
            index: spec.index,
            project_id: project_id.clone(),
            job_id: job_id.clone(),
        });
        Ok(JobHandle::new(project_id, job_id, events))
    }

    async fn cancel_job(&self, target: &CancelTarget) -> Result<(), ProviderError> {
        if self.fail_cancels {
            return Err(ProviderError::Transport("connection reset".into()));
        }
        self.state.lock().unwrap().cancels.push(target.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording observer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Start(JobIndex),
    Progress { index: JobIndex, progress: u8 },
    Complete { index: JobIndex, result_url: Option<String> },
    Error { index: JobIndex, error: JobError },
    AllComplete(BatchResult),
    OutOfCredits,
    AuthRequired,
}

/// Observer that records every callback in order.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|&c| pred(c)).count()
    }

    pub fn all_complete_count(&self) -> usize {
        self.count(|c| matches!(c, Call::AllComplete(_)))
    }

    pub fn completes(&self, index: JobIndex) -> usize {
        self.count(|c| matches!(c, Call::Complete { index: i, .. } if *i == index))
    }

    pub fn errors(&self, index: JobIndex) -> Vec<JobError> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Error { index: i, error } if *i == index => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn progress_values(&self, index: JobIndex) -> Vec<u8> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Progress { index: i, progress } if *i == index => Some(*progress),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BatchObserver for Recorder {
    fn on_item_start(&self, index: JobIndex) {
        self.push(Call::Start(index));
    }

    fn on_item_progress(&self, job: &JobRecord) {
        self.push(Call::Progress {
            index: job.index,
            progress: job.progress,
        });
    }

    fn on_item_complete(&self, job: &JobRecord) {
        self.push(Call::Complete {
            index: job.index,
            result_url: job.result_url.clone(),
        });
    }

    fn on_item_error(&self, job: &JobRecord, error: &JobError) {
        self.push(Call::Error {
            index: job.index,
            error: error.clone(),
        });
    }

    fn on_all_complete(&self, result: &BatchResult) {
        self.push(Call::AllComplete(result.clone()));
    }

    fn on_out_of_credits(&self) {
        self.push(Call::OutOfCredits);
    }

    fn on_auth_required(&self) {
        self.push(Call::AuthRequired);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn image_spec(index: JobIndex) -> JobSpec {
    JobSpec {
        index,
        kind: JobKind::ImageEnhance,
        payload: JobPayload {
            prompt: "studio portrait, soft light".into(),
            negative_prompt: None,
            seed: Some(7),
            width: 1024,
            height: 1024,
            reference_media: vec!["upload://selfie.jpg".into()],
            model_id: "photo-xl".into(),
            steps: 24,
            guidance: Some(6.5),
            quality: Quality::Fast,
            duration_secs: None,
        },
        token_type: TokenType::Credits,
    }
}

pub fn video_spec(index: JobIndex, duration_secs: u32) -> JobSpec {
    let mut spec = image_spec(index);
    spec.kind = JobKind::Video;
    spec.payload.duration_secs = Some(duration_secs);
    spec
}

pub fn image_specs(count: usize) -> Vec<JobSpec> {
    (0..count).map(image_spec).collect()
}

/// Engine config with the documented defaults and a 90s image baseline.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        watchdog: WatchdogConfig {
            liveness_interval: Duration::from_secs(30),
            inactivity_threshold: Duration::from_secs(60),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn test_clock() -> Arc<ManualClock> {
    use chrono::TimeZone;
    Arc::new(ManualClock::new(
        chrono::Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
    ))
}

pub fn limiter(clock: Arc<ManualClock>) -> Arc<CancelRateLimiter> {
    Arc::new(CancelRateLimiter::new(
        Duration::from_secs(20),
        clock,
        Arc::new(MemoryStore::default()),
    ))
}

pub fn orchestrator(provider: Arc<ScriptedProvider>, config: EngineConfig) -> JobOrchestrator {
    JobOrchestrator::new(provider, limiter(test_clock()), config)
}

/// Let spawned tasks drain their channels. On a paused clock this only
/// returns once every runnable task has gone idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn result_url(job: &str) -> String {
    format!("https://cdn.example/jobs/{job}/out.png")
}

// ---------------------------------------------------------------------------
// Wire events
// ---------------------------------------------------------------------------

pub fn queued(project: &str, job: Option<&str>, position: u32) -> Value {
    json!({ "type": "queued", "projectId": project, "jobId": job, "queuePosition": position })
}

pub fn started(project: &str, job: Option<&str>) -> Value {
    json!({ "type": "initiating", "projectId": project, "jobId": job, "workerName": "gpu-7" })
}

pub fn progress(project: &str, job: Option<&str>, percent: u8) -> Value {
    json!({ "type": "progress", "projectId": project, "jobId": job, "progress": percent })
}

pub fn job_completed(project: &str, job: Option<&str>, url: Option<&str>) -> Value {
    json!({ "type": "jobCompleted", "projectId": project, "jobId": job, "resultUrl": url })
}

pub fn project_completed(project: &str) -> Value {
    json!({ "type": "completed", "projectId": project })
}

pub fn job_failed(project: &str, job: Option<&str>, code: Option<i64>, message: &str) -> Value {
    json!({
        "type": "jobFailed",
        "projectId": project,
        "jobId": job,
        "error": { "code": code, "message": message },
    })
}
