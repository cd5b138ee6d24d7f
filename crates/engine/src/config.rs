use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use booth_core::cooldown::CANCEL_COOLDOWN_SECS;
use booth_core::error::{env_or, ConfigError};
use booth_core::timeouts::{
    BaselineBudget, DEFAULT_IMAGE_BASELINE_SECS, DEFAULT_INACTIVITY_THRESHOLD_SECS,
    DEFAULT_LIVENESS_INTERVAL_SECS, DEFAULT_VIDEO_BASELINE_SECS, DEFAULT_VIDEO_PER_SECOND_SECS,
};
use booth_provider::reconnect::Backoff;
use regex::Regex;

use crate::completion::CompletionMode;
use crate::retry::RetryPolicy;

/// Result URLs whose path or query names a job id. The id is captured in
/// the `job_id` group.
pub const DEFAULT_RESULT_URL_PATTERN: &str =
    r"(?:/jobs?/|[?&]jobId=)(?P<job_id>[A-Za-z0-9][A-Za-z0-9_-]{5,})";

static DEFAULT_RESULT_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_RESULT_URL_PATTERN).expect("valid regex"));

/// Default wait for an aggregate completion signal after every job of
/// the batch reached a terminal state.
pub const DEFAULT_AGGREGATE_GRACE_SECS: u64 = 15;

/// Default upper bound on a single job-creation call.
pub const DEFAULT_SUBMIT_TIMEOUT_SECS: u64 = 60;

/// Watchdog timing.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    /// Period of the liveness check that runs after submission.
    pub liveness_interval: Duration,
    /// Silence, past the baseline, after which a job is force-failed.
    pub inactivity_threshold: Duration,
    pub budget: BaselineBudget,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(DEFAULT_LIVENESS_INTERVAL_SECS),
            inactivity_threshold: Duration::from_secs(DEFAULT_INACTIVITY_THRESHOLD_SECS),
            budget: BaselineBudget::default(),
        }
    }
}

/// Treat a job stuck near the end as finished without a result.
///
/// Off unless configured: a job that reaches `progress_threshold` and
/// then stays silent for `delay` becomes Ready with `fallback` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackPolicy {
    pub progress_threshold: u8,
    pub delay: Duration,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            progress_threshold: 85,
            delay: Duration::from_secs(20),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub watchdog: WatchdogConfig,
    pub retry: RetryPolicy,
    /// Upper bound on one `create_job` call.
    pub submit_timeout: Duration,
    /// Minimum spacing between issued cancels.
    pub cancel_cooldown: Duration,
    /// Where the last cancel time is persisted. In memory when unset.
    pub cancel_state_path: Option<PathBuf>,
    pub completion_mode: CompletionMode,
    pub aggregate_grace: Duration,
    pub fallback: Option<FallbackPolicy>,
    pub result_url_pattern: Regex,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watchdog: WatchdogConfig::default(),
            retry: RetryPolicy::default(),
            submit_timeout: Duration::from_secs(DEFAULT_SUBMIT_TIMEOUT_SECS),
            cancel_cooldown: Duration::from_secs(CANCEL_COOLDOWN_SECS),
            cancel_state_path: None,
            completion_mode: CompletionMode::PerJob,
            aggregate_grace: Duration::from_secs(DEFAULT_AGGREGATE_GRACE_SECS),
            fallback: None,
            result_url_pattern: default_result_url_pattern(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// sensible defaults.
    ///
    /// | Env Var                            | Default                      |
    /// |------------------------------------|------------------------------|
    /// | `WATCHDOG_LIVENESS_SECS`           | `30`                         |
    /// | `WATCHDOG_INACTIVITY_SECS`         | `60`                         |
    /// | `WATCHDOG_IMAGE_BASELINE_SECS`     | `90`                         |
    /// | `WATCHDOG_VIDEO_BASELINE_SECS`     | `120`                        |
    /// | `WATCHDOG_VIDEO_PER_SECOND_SECS`   | `12`                         |
    /// | `RETRY_MAX_ATTEMPTS`               | `3`                          |
    /// | `RETRY_INITIAL_DELAY_MS`           | `1000`                       |
    /// | `RETRY_MAX_DELAY_MS`               | `8000`                       |
    /// | `RETRY_MULTIPLIER`                 | `2.0`                        |
    /// | `SUBMIT_TIMEOUT_SECS`              | `60`                         |
    /// | `CANCEL_COOLDOWN_SECS`             | `20`                         |
    /// | `CANCEL_STATE_PATH`                | none (in memory)             |
    /// | `COMPLETION_MODE`                  | `per_job` (or `aggregate`)   |
    /// | `AGGREGATE_GRACE_SECS`             | `15`                         |
    /// | `FALLBACK_ENABLED`                 | `false`                      |
    /// | `FALLBACK_PROGRESS_THRESHOLD`      | `85`                         |
    /// | `FALLBACK_DELAY_SECS`              | `20`                         |
    /// | `RESULT_URL_JOB_PATTERN`           | see [`DEFAULT_RESULT_URL_PATTERN`] |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let watchdog = WatchdogConfig {
            liveness_interval: secs("WATCHDOG_LIVENESS_SECS", DEFAULT_LIVENESS_INTERVAL_SECS)?,
            inactivity_threshold: secs(
                "WATCHDOG_INACTIVITY_SECS",
                DEFAULT_INACTIVITY_THRESHOLD_SECS,
            )?,
            budget: BaselineBudget {
                image: secs("WATCHDOG_IMAGE_BASELINE_SECS", DEFAULT_IMAGE_BASELINE_SECS)?,
                video: secs("WATCHDOG_VIDEO_BASELINE_SECS", DEFAULT_VIDEO_BASELINE_SECS)?,
                video_per_second: secs(
                    "WATCHDOG_VIDEO_PER_SECOND_SECS",
                    DEFAULT_VIDEO_PER_SECOND_SECS,
                )?,
            },
        };
        if watchdog.liveness_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "WATCHDOG_LIVENESS_SECS",
                value: "0".into(),
                reason: "must be greater than zero".into(),
            });
        }

        let retry = RetryPolicy {
            max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?.max(1),
            backoff: Backoff {
                initial_delay: Duration::from_millis(env_or("RETRY_INITIAL_DELAY_MS", 1000u64)?),
                max_delay: Duration::from_millis(env_or("RETRY_MAX_DELAY_MS", 8000u64)?),
                multiplier: env_or("RETRY_MULTIPLIER", defaults.retry.backoff.multiplier)?,
            },
        };

        let completion_mode = match std::env::var("COMPLETION_MODE") {
            Ok(raw) => raw.trim().parse().map_err(|reason| ConfigError::Invalid {
                var: "COMPLETION_MODE",
                value: raw.clone(),
                reason,
            })?,
            Err(_) => defaults.completion_mode,
        };

        let fallback = if env_or("FALLBACK_ENABLED", false)? {
            let base = FallbackPolicy::default();
            Some(FallbackPolicy {
                progress_threshold: env_or("FALLBACK_PROGRESS_THRESHOLD", base.progress_threshold)?
                    .min(100),
                delay: secs("FALLBACK_DELAY_SECS", base.delay.as_secs())?,
            })
        } else {
            None
        };

        let result_url_pattern = match std::env::var("RESULT_URL_JOB_PATTERN") {
            Ok(raw) => compile_result_url_pattern(&raw)?,
            Err(_) => defaults.result_url_pattern,
        };

        Ok(Self {
            watchdog,
            retry,
            submit_timeout: secs("SUBMIT_TIMEOUT_SECS", DEFAULT_SUBMIT_TIMEOUT_SECS)?,
            cancel_cooldown: secs("CANCEL_COOLDOWN_SECS", CANCEL_COOLDOWN_SECS)?,
            cancel_state_path: std::env::var("CANCEL_STATE_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            completion_mode,
            aggregate_grace: secs("AGGREGATE_GRACE_SECS", DEFAULT_AGGREGATE_GRACE_SECS)?,
            fallback,
            result_url_pattern,
        })
    }
}

fn secs(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    env_or(var, default).map(Duration::from_secs)
}

fn default_result_url_pattern() -> Regex {
    DEFAULT_RESULT_URL_RE.clone()
}

/// Compile a custom result URL pattern. It must define a `job_id` group.
pub fn compile_result_url_pattern(raw: &str) -> Result<Regex, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var: "RESULT_URL_JOB_PATTERN",
        value: raw.to_string(),
        reason,
    };
    let pattern = Regex::new(raw).map_err(|e| invalid(e.to_string()))?;
    if !pattern.capture_names().any(|name| name == Some("job_id")) {
        return Err(invalid("pattern has no `job_id` capture group".into()));
    }
    Ok(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.watchdog.liveness_interval, Duration::from_secs(30));
        assert_eq!(config.watchdog.inactivity_threshold, Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cancel_cooldown, Duration::from_secs(20));
        assert_eq!(config.completion_mode, CompletionMode::PerJob);
        assert!(config.fallback.is_none());
    }

    #[test]
    fn default_pattern_extracts_job_ids() {
        let pattern = default_result_url_pattern();
        let caps = pattern
            .captures("https://cdn.example/renders/jobs/abc123def/result.png")
            .unwrap();
        assert_eq!(&caps["job_id"], "abc123def");

        let caps = pattern
            .captures("https://cdn.example/out.mp4?jobId=ZX81_spectrum&sig=1")
            .unwrap();
        assert_eq!(&caps["job_id"], "ZX81_spectrum");

        assert!(pattern.captures("https://cdn.example/out.png").is_none());
    }

    #[test]
    fn custom_pattern_requires_job_id_group() {
        assert!(compile_result_url_pattern(r"/r/(?P<job_id>\w+)").is_ok());
        assert!(compile_result_url_pattern(r"/r/(\w+)").is_err());
        assert!(compile_result_url_pattern(r"(").is_err());
    }
}
