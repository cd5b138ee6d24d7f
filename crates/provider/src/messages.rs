//! Provider event types and strict decoder.
//!
//! The provider sends flat JSON objects tagged by a `"type"` field, e.g.
//! `{"type": "progress", "jobId": "...", "projectId": "...", "progress": 42}`.
//! Payload shapes vary between event kinds and provider versions, so
//! [`ProviderEvent::decode`] maps them onto a closed [`EventKind`] enum.
//! Anything that does not decode is rejected whole; callers log and drop it.

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Public event model
// ---------------------------------------------------------------------------

/// What happened, independent of which job it happened to.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Waiting in the provider queue.
    Queued { position: Option<u32> },
    /// A worker picked the job up (wire `initiating` or `started`).
    Started { worker_name: Option<String> },
    /// Percent complete, 0-100.
    Progress { percent: u8 },
    /// Estimated seconds remaining.
    Eta { seconds: u32 },
    /// A single job finished (wire `jobCompleted`).
    JobCompleted,
    /// Aggregate project completion (wire `completed`). May or may not
    /// carry a single job's result.
    ProjectCompleted,
    /// The job failed (wire `jobFailed`, `failed` or `error`).
    Failed { code: Option<i64>, message: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Queued { .. } => "queued",
            EventKind::Started { .. } => "started",
            EventKind::Progress { .. } => "progress",
            EventKind::Eta { .. } => "eta",
            EventKind::JobCompleted => "jobCompleted",
            EventKind::ProjectCompleted => "completed",
            EventKind::Failed { .. } => "failed",
        }
    }
}

/// A decoded provider event plus every identifier it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub kind: EventKind,
    /// Top-level `jobId`.
    pub job_id: Option<String>,
    /// Job id found in a nested structure (`job.id`, `data.jobId`).
    pub structured_job_id: Option<String>,
    pub project_id: Option<String>,
    /// Result or media URL (`resultUrl`, `imageUrl`, `videoUrl`).
    pub result_url: Option<String>,
}

/// Why a raw event was rejected.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Unknown `type`, wrong field types, or not an object at all.
    #[error("Malformed provider event: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The event decoded but lacks a field its kind requires.
    #[error("Provider event `{kind}` is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

impl ProviderEvent {
    /// Decode a raw provider event.
    pub fn decode(raw: &serde_json::Value) -> Result<Self, DecodeError> {
        let wire = WireEvent::deserialize(raw)?;
        wire.into_event()
    }

    /// Decode from a text frame.
    pub fn decode_str(text: &str) -> Result<Self, DecodeError> {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        Self::decode(&raw)
    }

    /// True for terminal event kinds.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::JobCompleted | EventKind::ProjectCompleted | EventKind::Failed { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMeta {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default, alias = "imageUrl", alias = "videoUrl")]
    result_url: Option<String>,
    #[serde(default)]
    job: Option<NestedJob>,
    #[serde(default)]
    data: Option<NestedData>,
}

#[derive(Debug, Deserialize)]
struct NestedJob {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedData {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default, alias = "imageUrl", alias = "videoUrl")]
    result_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireError {
    Detailed {
        #[serde(default)]
        code: Option<i64>,
        #[serde(default)]
        message: Option<String>,
    },
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    #[serde(rename = "queued")]
    Queued {
        #[serde(flatten)]
        meta: WireMeta,
        #[serde(default, rename = "queuePosition")]
        queue_position: Option<u32>,
    },

    #[serde(rename = "initiating", alias = "started")]
    Started {
        #[serde(flatten)]
        meta: WireMeta,
        #[serde(default, rename = "workerName")]
        worker_name: Option<String>,
    },

    #[serde(rename = "progress")]
    Progress {
        #[serde(flatten)]
        meta: WireMeta,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        step: Option<u32>,
        #[serde(default, rename = "stepCount")]
        step_count: Option<u32>,
    },

    #[serde(rename = "eta")]
    Eta {
        #[serde(flatten)]
        meta: WireMeta,
        #[serde(default, alias = "etaSeconds")]
        eta: Option<f64>,
    },

    #[serde(rename = "jobCompleted")]
    JobCompleted {
        #[serde(flatten)]
        meta: WireMeta,
    },

    #[serde(rename = "completed")]
    Completed {
        #[serde(flatten)]
        meta: WireMeta,
    },

    #[serde(rename = "jobFailed", alias = "failed", alias = "error")]
    Failed {
        #[serde(flatten)]
        meta: WireMeta,
        #[serde(default)]
        error: Option<WireError>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default, rename = "errorCode")]
        error_code: Option<i64>,
    },
}

impl WireEvent {
    fn into_event(self) -> Result<ProviderEvent, DecodeError> {
        let (kind, meta) = match self {
            WireEvent::Queued {
                meta,
                queue_position,
            } => (
                EventKind::Queued {
                    position: queue_position,
                },
                meta,
            ),
            WireEvent::Started { meta, worker_name } => (EventKind::Started { worker_name }, meta),
            WireEvent::Progress {
                meta,
                progress,
                step,
                step_count,
            } => {
                let percent = match (progress, step, step_count) {
                    (Some(p), _, _) if p.is_finite() => p,
                    (_, Some(step), Some(count)) if count > 0 => {
                        step as f64 / count as f64 * 100.0
                    }
                    _ => {
                        return Err(DecodeError::MissingField {
                            kind: "progress",
                            field: "progress",
                        })
                    }
                };
                let percent = percent.clamp(0.0, 100.0).round() as u8;
                (EventKind::Progress { percent }, meta)
            }
            WireEvent::Eta { meta, eta } => match eta {
                Some(secs) if secs.is_finite() => {
                    let seconds = secs.max(0.0).round() as u32;
                    (EventKind::Eta { seconds }, meta)
                }
                _ => {
                    return Err(DecodeError::MissingField {
                        kind: "eta",
                        field: "eta",
                    })
                }
            },
            WireEvent::JobCompleted { meta } => (EventKind::JobCompleted, meta),
            WireEvent::Completed { meta } => (EventKind::ProjectCompleted, meta),
            WireEvent::Failed {
                meta,
                error,
                message,
                error_code,
            } => {
                let (nested_code, nested_message) = match error {
                    Some(WireError::Detailed { code, message }) => (code, message),
                    Some(WireError::Text(text)) => (None, Some(text)),
                    None => (None, None),
                };
                let message = nested_message.or(message).unwrap_or_default();
                (
                    EventKind::Failed {
                        code: nested_code.or(error_code),
                        message,
                    },
                    meta,
                )
            }
        };

        let (structured_job_id, nested_url) = match (meta.job, meta.data) {
            (Some(NestedJob { id: Some(id) }), data) => {
                (Some(id), data.and_then(|d| d.result_url))
            }
            (_, Some(data)) => (data.job_id, data.result_url),
            _ => (None, None),
        };

        Ok(ProviderEvent {
            kind,
            job_id: meta.job_id.filter(|id| !id.is_empty()),
            structured_job_id: structured_job_id.filter(|id| !id.is_empty()),
            project_id: meta.project_id.filter(|id| !id.is_empty()),
            result_url: meta.result_url.or(nested_url).filter(|u| !u.is_empty()),
        })
    }
}
