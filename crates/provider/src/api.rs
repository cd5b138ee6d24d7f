//! REST API client for the provider's HTTP endpoints.
//!
//! Wraps project creation and cancellation using [`reqwest`].

use booth_core::job::JobSpec;
use serde::Deserialize;

use crate::provider::ProviderError;

/// HTTP client for one provider deployment.
pub struct ProviderApi {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

/// Response returned by `POST /v1/projects` after the provider accepted
/// a job.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectResponse {
    pub project_id: String,
    /// Job ids the provider assigned up front. Often empty; ids then
    /// arrive on the event stream.
    #[serde(default)]
    pub job_ids: Vec<String>,
}

/// Error body the provider sends with non-2xx responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default, alias = "code")]
    error_code: Option<i64>,
    #[serde(default, alias = "error")]
    message: Option<String>,
}

/// Errors from the provider REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ProviderApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The provider returned a non-2xx status code.
    #[error("Provider API error ({status}): {message}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Provider error code from the body, if any.
        code: Option<i64>,
        message: String,
    },
}

impl From<ProviderApiError> for ProviderError {
    fn from(err: ProviderApiError) -> Self {
        match err {
            ProviderApiError::ApiError {
                status,
                code,
                message,
            } => ProviderError::Rejected {
                code: code.or(Some(status as i64)),
                message,
            },
            ProviderApiError::Request(e) => ProviderError::Transport(e.to_string()),
        }
    }
}

impl ProviderApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `https://api.provider.example`.
    /// * `api_key` - Optional bearer token.
    pub fn new(api_url: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Submit one job as a new project.
    ///
    /// Sends `POST /v1/projects` with the job spec and the WebSocket
    /// `client_id` events should be addressed to.
    pub async fn create_project(
        &self,
        spec: &JobSpec,
        client_id: &str,
    ) -> Result<CreateProjectResponse, ProviderApiError> {
        let body = serde_json::json!({
            "clientId": client_id,
            "job": spec,
        });

        let response = self
            .authorized(self.client.post(self.url("/v1/projects")))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Request cancellation of a project, or of one job inside it.
    ///
    /// Sends `POST /v1/projects/{project_id}/cancel`.
    pub async fn cancel_project(
        &self,
        project_id: &str,
        job_id: Option<&str>,
    ) -> Result<(), ProviderApiError> {
        let body = serde_json::json!({ "jobId": job_id });

        let response = self
            .authorized(
                self.client
                    .post(self.url(&format!("/v1/projects/{project_id}/cancel"))),
            )
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Ensure the response has a success status code. On failure the
    /// body is parsed for a provider error code and message.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            let (code, message) = parse_error_body(&body);
            return Err(ProviderApiError::ApiError {
                status: status.as_u16(),
                code,
                message,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ProviderApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// Extract `(code, message)` from an error body, falling back to the raw
/// text when it is not the provider's JSON error shape.
fn parse_error_body(body: &str) -> (Option<i64>, String) {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => (
            parsed.error_code,
            parsed.message.unwrap_or_else(|| body.to_string()),
        ),
        Err(_) => (None, body.to_string()),
    }
}
