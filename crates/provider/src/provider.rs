//! The engine's only external boundary: a remote generation provider.
//!
//! A provider accepts a [`JobSpec`], returns a [`JobHandle`] for the
//! project it created, and then emits raw lifecycle events on a channel
//! shared by every job of that project. Events are left as raw JSON here;
//! the engine decodes them strictly at its correlation boundary.

use async_trait::async_trait;
use booth_core::job::JobSpec;
use tokio::sync::broadcast;

/// Identifies a remote job for a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelTarget {
    pub project_id: String,
    /// Known job id, if the provider ever told us one.
    pub job_id: Option<String>,
}

/// Handle to a job the provider accepted.
///
/// Holds a subscription to the project-wide event channel. Several
/// handles may share the same project and therefore see each other's
/// events.
#[derive(Debug)]
pub struct JobHandle {
    pub project_id: String,
    /// Job id assigned at creation time, when the provider returns one.
    pub job_id: Option<String>,
    events: broadcast::Receiver<serde_json::Value>,
}

impl JobHandle {
    pub fn new(
        project_id: impl Into<String>,
        job_id: Option<String>,
        events: broadcast::Receiver<serde_json::Value>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            job_id,
            events,
        }
    }

    pub fn target(&self) -> CancelTarget {
        CancelTarget {
            project_id: self.project_id.clone(),
            job_id: self.job_id.clone(),
        }
    }

    /// Split the handle into its cancel target and event subscription.
    pub fn into_parts(self) -> (CancelTarget, broadcast::Receiver<serde_json::Value>) {
        let target = CancelTarget {
            project_id: self.project_id,
            job_id: self.job_id,
        };
        (target, self.events)
    }
}

/// Errors returned by provider calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The provider refused the request (validation, auth, funds).
    #[error("Provider rejected the request: {message}")]
    Rejected { code: Option<i64>, message: String },

    /// The request never got a usable answer (network, TLS, bad body).
    #[error("Provider transport error: {0}")]
    Transport(String),

    /// The request did not complete within the allotted time.
    #[error("Provider call timed out after {0}s")]
    Timeout(u64),
}

impl ProviderError {
    pub fn code(&self) -> Option<i64> {
        match self {
            ProviderError::Rejected { code, .. } => *code,
            ProviderError::Transport(_) | ProviderError::Timeout(_) => None,
        }
    }

    /// The provider's own message where it sent one.
    pub fn message(&self) -> String {
        match self {
            ProviderError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// A remote service that runs generation jobs.
#[async_trait]
pub trait GenerationProvider: Send + Sync + 'static {
    /// Submit a job. May fail synchronously (validation, auth, funds).
    async fn create_job(&self, spec: &JobSpec) -> Result<JobHandle, ProviderError>;

    /// Best-effort cancel. Success means the request was accepted, not
    /// that the remote computation has stopped.
    async fn cancel_job(&self, target: &CancelTarget) -> Result<(), ProviderError>;
}
