//! Provider implementation backed by REST submission and a WebSocket
//! event stream.
//!
//! [`RemoteProvider`] owns one persistent socket for the whole process
//! (connect -> process -> reconnect loop) and routes its frames into
//! per-project channels. Each [`GenerationProvider::create_job`] call
//! creates a project over REST and subscribes to that project's channel.

use std::sync::Arc;

use async_trait::async_trait;
use booth_core::job::JobSpec;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api::ProviderApi;
use crate::channels::ProjectChannels;
use crate::client::ProviderClient;
use crate::config::ProviderConfig;
use crate::processor::process_frames;
use crate::provider::{CancelTarget, GenerationProvider, JobHandle, ProviderError};
use crate::reconnect::{reconnect_loop, Backoff};

/// Generation provider reached over the network.
///
/// Created once at startup via [`RemoteProvider::start`]; the returned
/// `Arc` is shared with the orchestrator.
pub struct RemoteProvider {
    api: ProviderApi,
    channels: Arc<ProjectChannels>,
    client_id: String,
    /// Master cancellation token, cancelled during shutdown.
    cancel: CancellationToken,
    task_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RemoteProvider {
    /// Build the REST client and spawn the socket task.
    pub fn start(config: ProviderConfig) -> Result<Arc<Self>, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Transport(format!("Failed to build HTTP client: {e}")))?;

        let client_id = uuid::Uuid::new_v4().to_string();
        let api = ProviderApi::with_client(http, config.api_url.clone(), config.api_key.clone());
        let channels = Arc::new(ProjectChannels::new());
        let cancel = CancellationToken::new();

        let client = ProviderClient::new(config.ws_url.clone(), client_id.clone(), config.api_key);
        let task_channels = Arc::clone(&channels);
        let task_cancel = cancel.clone();
        let task_handle = tokio::spawn(async move {
            tracing::info!(ws_url = client.ws_url(), "Starting provider socket task");
            run_connection_loop(&client, &task_channels, &task_cancel).await;
            tracing::info!("Provider socket task exited");
        });

        Ok(Arc::new(Self {
            api,
            channels,
            client_id,
            cancel,
            task_handle: Mutex::new(Some(task_handle)),
        }))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Stop the socket task, waiting up to 5 seconds for a clean exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down provider connection");
        self.cancel.cancel();
        if let Some(handle) = self.task_handle.lock().await.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        }
    }
}

#[async_trait]
impl GenerationProvider for RemoteProvider {
    async fn create_job(&self, spec: &JobSpec) -> Result<JobHandle, ProviderError> {
        self.channels.prune().await;

        let response = self.api.create_project(spec, &self.client_id).await?;
        let events = self.channels.subscribe(&response.project_id).await;

        tracing::info!(
            index = spec.index,
            kind = spec.kind.as_str(),
            project_id = %response.project_id,
            "Job submitted to provider",
        );

        Ok(JobHandle::new(
            response.project_id,
            response.job_ids.into_iter().next(),
            events,
        ))
    }

    async fn cancel_job(&self, target: &CancelTarget) -> Result<(), ProviderError> {
        self.api
            .cancel_project(&target.project_id, target.job_id.as_deref())
            .await?;
        tracing::info!(
            project_id = %target.project_id,
            job_id = ?target.job_id,
            "Cancel request accepted by provider",
        );
        Ok(())
    }
}

/// Socket loop: connect -> process frames -> reconnect, until cancelled.
async fn run_connection_loop(
    client: &ProviderClient,
    channels: &ProjectChannels,
    cancel: &CancellationToken,
) {
    let backoff = Backoff::default();

    loop {
        let conn = match client.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Connection failed, entering reconnect loop");
                match reconnect_loop(client, &backoff, cancel).await {
                    Some(conn) => conn,
                    None => return,
                }
            }
        };

        let mut ws_stream = conn.ws_stream;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = process_frames(&mut ws_stream, channels) => {}
        }

        let pruned = channels.prune().await;
        tracing::info!(pruned, "Provider socket lost");

        if cancel.is_cancelled() {
            return;
        }
    }
}
