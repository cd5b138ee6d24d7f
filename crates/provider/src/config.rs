use std::time::Duration;

use booth_core::error::{env_or, ConfigError};

/// Connection settings for [`RemoteProvider`](crate::remote::RemoteProvider).
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// REST base URL.
    pub api_url: String,
    /// WebSocket event endpoint.
    pub ws_url: String,
    /// Bearer token for both REST and WebSocket, if the provider needs one.
    pub api_key: Option<String>,
    /// Timeout for a single REST request.
    pub request_timeout: Duration,
}

impl ProviderConfig {
    /// Load provider settings from the environment.
    ///
    /// | Env Var                          | Default     |
    /// |----------------------------------|-------------|
    /// | `PROVIDER_API_URL`               | (required)  |
    /// | `PROVIDER_WS_URL`                | (required)  |
    /// | `PROVIDER_API_KEY`               | none        |
    /// | `PROVIDER_REQUEST_TIMEOUT_SECS`  | `30`        |
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = required("PROVIDER_API_URL")?;
        let ws_url = required("PROVIDER_WS_URL")?;
        let api_key = std::env::var("PROVIDER_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        let request_timeout_secs: u64 = env_or("PROVIDER_REQUEST_TIMEOUT_SECS", 30)?;

        Ok(Self {
            api_url,
            ws_url,
            api_key,
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(var))
}
