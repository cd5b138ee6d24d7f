//! Generation job specification and tracked job state.
//!
//! A [`JobSpec`] is the immutable request built once per submission. A
//! [`JobRecord`] is the mutable state the engine keeps for it, from
//! `Pending` through exactly one terminal status.

use serde::{Deserialize, Serialize};

use crate::classification::JobError;
use crate::error::CoreError;
use crate::types::{JobIndex, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Largest edge accepted for generated media, in pixels.
pub const MAX_DIMENSION: u32 = 4096;

/// Upper bound on sampler steps for a single job.
pub const MAX_STEPS: u32 = 200;

/// Longest video clip a single job may request.
pub const MAX_VIDEO_DURATION_SECS: u32 = 30;

// ---------------------------------------------------------------------------
// JobSpec
// ---------------------------------------------------------------------------

/// What kind of generation a job performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Enhance a single captured photo.
    ImageEnhance,
    /// One slot of a multi-angle batch.
    MultiAngle {
        /// Camera angle label for this slot (e.g. `"left-45"`).
        angle: String,
    },
    /// Image-to-video synthesis.
    Video,
    /// A transition clip between two stills.
    VideoTransition,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ImageEnhance => "image_enhance",
            JobKind::MultiAngle { .. } => "multi_angle",
            JobKind::Video => "video",
            JobKind::VideoTransition => "video_transition",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, JobKind::Video | JobKind::VideoTransition)
    }
}

/// Requested quality tier. Higher tiers get longer watchdog budgets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Fast,
    #[default]
    Standard,
    High,
}

/// Which balance pays for the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    #[default]
    Credits,
    Premium,
}

/// Model inputs for one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    pub width: u32,
    pub height: u32,
    /// Input media (captured photo, start/end frames).
    #[serde(default)]
    pub reference_media: Vec<String>,
    pub model_id: String,
    pub steps: u32,
    #[serde(default)]
    pub guidance: Option<f32>,
    #[serde(default)]
    pub quality: Quality,
    /// Output length for video kinds.
    #[serde(default)]
    pub duration_secs: Option<u32>,
}

/// Immutable description of one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Caller-chosen slot index, unique within a batch.
    pub index: JobIndex,
    #[serde(flatten)]
    pub kind: JobKind,
    pub payload: JobPayload,
    #[serde(default)]
    pub token_type: TokenType,
}

impl JobSpec {
    /// Check that the payload is internally consistent before submission.
    pub fn validate(&self) -> Result<(), CoreError> {
        let p = &self.payload;
        if p.width == 0 || p.height == 0 {
            return Err(CoreError::Validation(format!(
                "Job {} has zero width or height",
                self.index
            )));
        }
        if p.width > MAX_DIMENSION || p.height > MAX_DIMENSION {
            return Err(CoreError::Validation(format!(
                "Job {} exceeds the maximum dimension of {MAX_DIMENSION}px",
                self.index
            )));
        }
        if p.steps == 0 || p.steps > MAX_STEPS {
            return Err(CoreError::Validation(format!(
                "Job {} must request between 1 and {MAX_STEPS} steps",
                self.index
            )));
        }
        if p.model_id.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Job {} has no model id",
                self.index
            )));
        }
        if self.kind.is_video() {
            match p.duration_secs {
                Some(d) if d > 0 && d <= MAX_VIDEO_DURATION_SECS => {}
                _ => {
                    return Err(CoreError::Validation(format!(
                        "Video job {} needs a duration between 1 and {MAX_VIDEO_DURATION_SECS}s",
                        self.index
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Submitting,
    Generating,
    Ready,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Submitting => "submitting",
            JobStatus::Generating => "generating",
            JobStatus::Ready => "ready",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed | JobStatus::Canceled)
    }

    /// Statuses reachable from `self` through normal event processing.
    ///
    /// Terminal statuses return an empty slice; leaving them is only
    /// possible through [`JobRecord::reset_for_resubmit`].
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Pending => &[Submitting, Failed, Canceled],
            Submitting => &[Generating, Pending, Failed, Canceled],
            Generating => &[Ready, Failed, Canceled, Pending],
            Ready | Failed | Canceled => &[],
        }
    }

    pub fn can_transition(&self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// Mutable tracked state for one submitted [`JobSpec`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub index: JobIndex,
    /// Provider-assigned job id, learned at creation or from events.
    pub id: Option<String>,
    pub project_id: Option<String>,
    pub status: JobStatus,
    /// Percent complete, 0-100.
    pub progress: u8,
    pub eta_secs: Option<u32>,
    pub worker_name: Option<String>,
    pub queue_position: Option<u32>,
    pub status_text: Option<String>,
    pub result_url: Option<String>,
    pub error: Option<JobError>,
    /// 1-based submission attempt currently tracked.
    pub attempt: u32,
    /// Set when the job was completed by the fallback heuristic.
    pub fallback: bool,
    /// Previously accepted results, oldest first.
    pub version_history: Vec<String>,
    pub started_at: Option<Timestamp>,
    pub last_activity_at: Option<Timestamp>,
}

impl JobRecord {
    pub fn new(index: JobIndex) -> Self {
        Self {
            index,
            id: None,
            project_id: None,
            status: JobStatus::Pending,
            progress: 0,
            eta_secs: None,
            worker_name: None,
            queue_position: None,
            status_text: None,
            result_url: None,
            error: None,
            attempt: 0,
            fallback: false,
            version_history: Vec::new(),
            started_at: None,
            last_activity_at: None,
        }
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition(to) {
            return Err(CoreError::InvalidTransition {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Record a progress value. Returns `true` only when the stored value
    /// advanced; stale or repeated values are ignored.
    pub fn apply_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if percent > self.progress {
            self.progress = percent;
            true
        } else {
            false
        }
    }

    /// Mark the job Ready with `result_url`, appending it to the history.
    ///
    /// Returns `false` if the job is not currently Generating.
    pub fn accept_result(&mut self, result_url: Option<String>) -> bool {
        if self.status != JobStatus::Generating {
            return false;
        }
        self.status = JobStatus::Ready;
        self.progress = 100;
        if let Some(url) = &result_url {
            self.version_history.push(url.clone());
        }
        self.result_url = result_url;
        self.error = None;
        true
    }

    /// Begin a fresh attempt for the same slot (retry or regenerate).
    ///
    /// Per-attempt fields are cleared; `version_history` survives.
    pub fn reset_for_resubmit(&mut self) {
        self.id = None;
        self.project_id = None;
        self.status = JobStatus::Pending;
        self.progress = 0;
        self.eta_secs = None;
        self.worker_name = None;
        self.queue_position = None;
        self.status_text = None;
        self.result_url = None;
        self.error = None;
        self.fallback = false;
        self.started_at = None;
        self.last_activity_at = None;
    }
}
