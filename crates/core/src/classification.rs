//! Error taxonomy and fatal/transient classification for generation jobs.
//!
//! Fatal errors (insufficient funds, authentication or permission
//! failures) are never retried and surface a dedicated signal so the UI
//! can route to the payment or sign-in flow. Everything else is
//! transient and eligible for automatic retry.

use serde::Serialize;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Provider error codes that mean the account cannot pay for the job.
pub const INSUFFICIENT_FUNDS_CODES: &[i64] = &[4024, 402];

/// Provider error codes for authentication or authorization failures.
pub const AUTH_FAILURE_CODES: &[i64] = &[401, 403, 4001, 4003];

/// Message fragments (lowercase) that indicate an out-of-credits condition.
const FUNDS_PATTERNS: &[&str] = &[
    "insufficient funds",
    "insufficient balance",
    "insufficient credits",
    "not enough credits",
    "not enough balance",
    "out of credits",
    "balance too low",
];

/// Message fragments (lowercase) that indicate an auth or permission failure.
const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "not authenticated",
    "authentication failed",
    "invalid token",
    "token expired",
    "forbidden",
    "permission denied",
    "not permitted",
];

/// Fallback text when the provider supplied no usable message.
pub const GENERIC_FAILURE_MESSAGE: &str = "Generation failed. Please try again.";

pub const TIMEOUT_MESSAGE: &str = "Generation timed out. Please try again.";

pub const OUT_OF_CREDITS_MESSAGE: &str =
    "You are out of credits. Replenish your balance to keep generating.";

pub const AUTH_REQUIRED_MESSAGE: &str = "Your session has expired. Sign in again to continue.";

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// Why a fatal error can never succeed on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    InsufficientFunds,
    Unauthorized,
}

/// Retry eligibility of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Fatal(FatalKind),
    Transient,
}

impl ErrorClass {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorClass::Fatal(_))
    }
}

/// Classify a provider error from its optional numeric code and message.
///
/// Codes are checked first; message matching is case-insensitive and
/// looks for known fragments anywhere in the text.
pub fn classify(code: Option<i64>, message: &str) -> ErrorClass {
    if let Some(code) = code {
        if INSUFFICIENT_FUNDS_CODES.contains(&code) {
            return ErrorClass::Fatal(FatalKind::InsufficientFunds);
        }
        if AUTH_FAILURE_CODES.contains(&code) {
            return ErrorClass::Fatal(FatalKind::Unauthorized);
        }
    }

    let lower = message.to_lowercase();
    if FUNDS_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Fatal(FatalKind::InsufficientFunds);
    }
    if AUTH_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Fatal(FatalKind::Unauthorized);
    }
    ErrorClass::Transient
}

// ---------------------------------------------------------------------------
// JobError
// ---------------------------------------------------------------------------

/// A per-job failure, recorded on the job and reported to observers.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    /// The provider rejected or failed the job-creation call.
    #[error("Job creation failed: {message}")]
    Creation { message: String, class: ErrorClass },

    /// The provider reported failure on the event stream.
    #[error("Generation failed: {message}")]
    Runtime { message: String, class: ErrorClass },

    /// The watchdog gave up on a job that stopped making progress.
    #[error("Generation timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    /// The user canceled the job.
    #[error("Generation canceled")]
    Cancelled,
}

impl JobError {
    pub fn creation(code: Option<i64>, message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify(code, &message);
        JobError::Creation { message, class }
    }

    pub fn runtime(code: Option<i64>, message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify(code, &message);
        JobError::Runtime { message, class }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            JobError::Creation { class, .. } | JobError::Runtime { class, .. } => *class,
            JobError::Timeout { .. } | JobError::Cancelled => ErrorClass::Transient,
        }
    }

    pub fn fatal_kind(&self) -> Option<FatalKind> {
        match self.class() {
            ErrorClass::Fatal(kind) => Some(kind),
            ErrorClass::Transient => None,
        }
    }

    /// Whether the engine may resubmit automatically after this error.
    ///
    /// Timeouts and cancellations are left to the user.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Creation { class, .. } | JobError::Runtime { class, .. } => {
                !class.is_fatal()
            }
            JobError::Timeout { .. } | JobError::Cancelled => false,
        }
    }

    /// Text suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            JobError::Timeout { .. } => TIMEOUT_MESSAGE.to_string(),
            JobError::Cancelled => "Generation canceled.".to_string(),
            JobError::Creation { message, class } | JobError::Runtime { message, class } => {
                match class {
                    ErrorClass::Fatal(FatalKind::InsufficientFunds) => {
                        OUT_OF_CREDITS_MESSAGE.to_string()
                    }
                    ErrorClass::Fatal(FatalKind::Unauthorized) => {
                        AUTH_REQUIRED_MESSAGE.to_string()
                    }
                    ErrorClass::Transient if message.trim().is_empty() => {
                        GENERIC_FAILURE_MESSAGE.to_string()
                    }
                    ErrorClass::Transient => message.clone(),
                }
            }
        }
    }
}
