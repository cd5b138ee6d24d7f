mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use booth_core::classification::{ErrorClass, FatalKind, JobError};
use booth_core::job::JobStatus;
use booth_engine::completion::CompletionMode;
use booth_engine::config::FallbackPolicy;
use booth_engine::observer::NoopObserver;
use booth_engine::OrchestratorError;
use tokio::time::Instant;

use common::*;

/// Drive job `index` through started -> completed on its own project.
fn finish(provider: &ScriptedProvider, index: usize) -> String {
    let project = provider.project_of(index);
    let job = provider.job_id_of(index);
    let url = result_url(&job);
    provider.emit(&project, started(&project, Some(&job)));
    provider.emit(&project, job_completed(&project, Some(&job), Some(&url)));
    url
}

#[tokio::test(start_paused = true)]
async fn all_complete_fires_once_with_entries_in_index_order() {
    let provider = ScriptedProvider::new();
    let recorder = Recorder::new();
    let orchestrator = orchestrator(provider.clone(), test_config());

    let batch = orchestrator
        .submit_batch(image_specs(3), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();

    for index in [2, 0, 1] {
        finish(&provider, index);
    }

    let result = batch.wait().await.unwrap();
    assert!(result.success);
    assert_eq!(
        result.entries.iter().map(|e| e.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(result
        .entries
        .iter()
        .all(|e| e.status == JobStatus::Ready && e.result_url.is_some()));

    settle().await;
    assert_eq!(recorder.all_complete_count(), 1);
    assert!(batch.active_resources().is_idle());
}

#[tokio::test(start_paused = true)]
async fn duplicate_completion_is_counted_once() {
    let provider = ScriptedProvider::new();
    let recorder = Recorder::new();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(2), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();

    let project = provider.project_of(0);
    let job = provider.job_id_of(0);
    let url = finish(&provider, 0);
    provider.emit(&project, job_completed(&project, Some(&job), Some(&url)));
    settle().await;

    assert_eq!(recorder.completes(0), 1);
    assert!(batch.result().is_none(), "job 1 is still running");

    finish(&provider, 1);
    batch.wait().await.unwrap();

    // A straggler after the batch finished changes nothing.
    provider.emit(&project, job_completed(&project, Some(&job), Some(&url)));
    settle().await;

    assert_eq!(recorder.completes(0), 1);
    assert_eq!(recorder.all_complete_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_job_fails_alone_and_signals_out_of_credits() {
    let provider = ScriptedProvider::new();
    provider.script(3, [Create::reject(Some(4024), "Insufficient funds")]);
    let recorder = Recorder::new();
    let orchestrator = orchestrator(provider.clone(), test_config());

    let batch = orchestrator
        .submit_batch(image_specs(5), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();

    for index in [0, 1, 2, 4] {
        finish(&provider, index);
    }
    let result = batch.wait().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.entries.len(), 5);
    assert_eq!(
        result
            .entries
            .iter()
            .filter(|e| e.status == JobStatus::Ready)
            .count(),
        4
    );
    let failed = result.entry(3).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_matches!(
        failed.error,
        Some(JobError::Creation {
            class: ErrorClass::Fatal(FatalKind::InsufficientFunds),
            ..
        })
    );

    assert_eq!(provider.create_calls(3), 1, "fatal errors are not retried");
    assert_eq!(recorder.count(|c| *c == Call::OutOfCredits), 1);
    assert_eq!(recorder.all_complete_count(), 1);
    settle().await;
    assert!(batch.active_resources().is_idle());
}

#[tokio::test(start_paused = true)]
async fn out_of_credits_is_signaled_once_per_batch() {
    let provider = ScriptedProvider::new();
    provider.script(1, [Create::reject(Some(4024), "Insufficient funds")]);
    provider.script(2, [Create::reject(None, "insufficient balance")]);
    let recorder = Recorder::new();
    let orchestrator = orchestrator(provider.clone(), test_config());

    let batch = orchestrator
        .submit_batch(image_specs(3), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();

    let project = provider.project_of(0);
    let job = provider.job_id_of(0);
    provider.emit(&project, started(&project, Some(&job)));
    provider.emit(
        &project,
        job_failed(&project, Some(&job), Some(4024), "Insufficient funds"),
    );

    let result = batch.wait().await.unwrap();
    assert!(result.entries.iter().all(|e| e.status == JobStatus::Failed));
    assert_eq!(recorder.count(|c| *c == Call::OutOfCredits), 1);
    assert_eq!(recorder.count(|c| *c == Call::AuthRequired), 0);

    // The runtime failure released the listener and the watchdog too.
    settle().await;
    assert!(batch.active_resources().is_idle());
    assert_eq!(provider.subscribers(&project), 0);
}

#[tokio::test(start_paused = true)]
async fn progress_never_moves_backwards() {
    let provider = ScriptedProvider::new();
    let recorder = Recorder::new();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(1), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();

    let project = provider.project_of(0);
    let job = provider.job_id_of(0);
    provider.emit(&project, started(&project, Some(&job)));
    for percent in [10, 40, 30, 40, 70] {
        provider.emit(&project, progress(&project, Some(&job), percent));
    }
    settle().await;

    let values = recorder.progress_values(0);
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "{values:?}");
    assert!(values.ends_with(&[10, 40, 70]), "{values:?}");
    assert!(!values.contains(&30));

    let records = batch.snapshot().await.unwrap();
    assert_eq!(records[0].status, JobStatus::Generating);
    assert_eq!(records[0].progress, 70);
    assert_eq!(records[0].worker_name.as_deref(), Some("gpu-7"));
}

#[tokio::test(start_paused = true)]
async fn queue_position_updates_status_only_while_waiting() {
    let provider = ScriptedProvider::new();
    let recorder = Recorder::new();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(1), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();

    let project = provider.project_of(0);
    let job = provider.job_id_of(0);
    let before = recorder.progress_values(0).len();
    provider.emit(&project, queued(&project, Some(&job), 3));
    provider.emit(&project, queued(&project, Some(&job), 3));
    settle().await;

    let record = batch.snapshot().await.unwrap().remove(0);
    assert_eq!(record.queue_position, Some(3));
    assert_eq!(record.status_text.as_deref(), Some("Queued (position 3)"));
    assert_eq!(recorder.progress_values(0).len(), before + 1);

    provider.emit(&project, queued(&project, Some(&job), 1));
    settle().await;
    assert_eq!(recorder.progress_values(0).len(), before + 1);
}

#[tokio::test(start_paused = true)]
async fn shared_project_events_reach_only_their_job() {
    let provider = ScriptedProvider::builder().shared_project("shared").build();
    let recorder = Recorder::new();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(2), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();

    let first = provider.job_id_of(0);
    let second = provider.job_id_of(1);
    provider.emit("shared", started("shared", Some(&first)));
    provider.emit("shared", started("shared", Some(&second)));
    provider.emit("shared", progress("shared", Some(&second), 50));
    // No id and two candidates: dropped rather than guessed.
    provider.emit("shared", progress("shared", None, 90));
    settle().await;

    let records = batch.snapshot().await.unwrap();
    assert_eq!(records[0].progress, 0);
    assert_eq!(records[1].progress, 50);

    provider.emit(
        "shared",
        job_completed("shared", Some(&second), Some(&result_url(&second))),
    );
    provider.emit(
        "shared",
        job_completed("shared", Some(&first), Some(&result_url(&first))),
    );
    let result = batch.wait().await.unwrap();

    assert_eq!(
        result.entry(0).unwrap().result_url.as_deref(),
        Some(result_url(&first).as_str())
    );
    assert_eq!(
        result.entry(1).unwrap().result_url.as_deref(),
        Some(result_url(&second).as_str())
    );
    // Every event reached both listeners; each job still completed once.
    assert_eq!(recorder.completes(0), 1);
    assert_eq!(recorder.completes(1), 1);
}

#[tokio::test(start_paused = true)]
async fn job_id_learned_by_elimination_guards_later_events() {
    let provider = ScriptedProvider::builder().without_job_ids().build();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(1), Recorder::new())
        .unwrap();
    batch.wait_started().await.unwrap();

    let project = provider.project_of(0);
    provider.emit(&project, started(&project, Some("remote-abc123")));
    provider.emit(&project, job_completed(&project, Some("remote-zzz999"), None));
    settle().await;

    let records = batch.snapshot().await.unwrap();
    assert_eq!(records[0].status, JobStatus::Generating);

    let url = result_url("remote-abc123");
    provider.emit(&project, job_completed(&project, None, Some(&url)));
    let result = batch.wait().await.unwrap();
    assert_eq!(result.entry(0).unwrap().result_url.as_deref(), Some(url.as_str()));
}

#[tokio::test(start_paused = true)]
async fn aggregate_mode_waits_for_project_completion() {
    let provider = ScriptedProvider::new();
    let recorder = Recorder::new();
    let config = booth_engine::EngineConfig {
        completion_mode: CompletionMode::Aggregate,
        ..test_config()
    };
    let orchestrator = orchestrator(provider.clone(), config);
    let batch = orchestrator
        .submit_batch(image_specs(1), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();

    finish(&provider, 0);
    settle().await;
    assert_eq!(recorder.completes(0), 1);
    assert!(batch.result().is_none());

    let project = provider.project_of(0);
    provider.emit(&project, project_completed(&project));
    let result = batch.wait().await.unwrap();
    assert!(result.success);
    assert_eq!(recorder.all_complete_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn aggregate_mode_gives_up_waiting_after_grace() {
    let provider = ScriptedProvider::new();
    let config = booth_engine::EngineConfig {
        completion_mode: CompletionMode::Aggregate,
        aggregate_grace: Duration::from_secs(15),
        ..test_config()
    };
    let orchestrator = orchestrator(provider.clone(), config);
    let batch = orchestrator
        .submit_batch(image_specs(1), Recorder::new())
        .unwrap();
    batch.wait_started().await.unwrap();

    finish(&provider, 0);
    let start = Instant::now();
    let result = batch.wait().await.unwrap();

    assert!(result.success);
    assert!(start.elapsed() >= Duration::from_secs(15));
    assert!(start.elapsed() < Duration::from_secs(16));
    assert!(batch.active_resources().is_idle());
}

#[tokio::test(start_paused = true)]
async fn near_final_progress_falls_back_to_ready() {
    let provider = ScriptedProvider::new();
    let config = booth_engine::EngineConfig {
        fallback: Some(FallbackPolicy {
            progress_threshold: 85,
            delay: Duration::from_secs(20),
        }),
        ..test_config()
    };
    let orchestrator = orchestrator(provider.clone(), config);
    let batch = orchestrator
        .submit_batch(image_specs(1), Recorder::new())
        .unwrap();
    batch.wait_started().await.unwrap();

    let project = provider.project_of(0);
    let job = provider.job_id_of(0);
    provider.emit(&project, started(&project, Some(&job)));
    provider.emit(&project, progress(&project, Some(&job), 90));

    let start = Instant::now();
    let result = batch.wait().await.unwrap();
    let entry = result.entry(0).unwrap();

    assert_eq!(entry.status, JobStatus::Ready);
    assert!(entry.fallback);
    assert_eq!(entry.result_url, None);
    assert!(start.elapsed() >= Duration::from_secs(20));
    assert!(start.elapsed() < Duration::from_secs(21));
}

#[tokio::test(start_paused = true)]
async fn resubmit_keeps_history_and_reports_per_item() {
    let provider = ScriptedProvider::new();
    let recorder = Recorder::new();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(1), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();

    let first_url = finish(&provider, 0);
    batch.wait().await.unwrap();

    batch.resubmit(0).await.unwrap();
    assert_matches!(
        batch.resubmit(0).await,
        Err(OrchestratorError::JobActive(0))
    );
    settle().await;

    let second_url = finish(&provider, 0);
    settle().await;

    let record = batch.snapshot().await.unwrap().remove(0);
    assert_eq!(record.status, JobStatus::Ready);
    assert_eq!(record.result_url.as_deref(), Some(second_url.as_str()));
    assert_eq!(record.version_history, vec![first_url, second_url]);

    assert_eq!(recorder.count(|c| *c == Call::Start(0)), 2);
    assert_eq!(recorder.completes(0), 2);
    assert_eq!(recorder.all_complete_count(), 1);
    assert!(batch.active_resources().is_idle());
}

#[tokio::test(start_paused = true)]
async fn dropped_handle_still_reports_completion() {
    let provider = ScriptedProvider::new();
    let recorder = Recorder::new();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(2), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();
    drop(batch);

    finish(&provider, 0);
    finish(&provider, 1);
    settle().await;

    assert_eq!(recorder.all_complete_count(), 1);
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let orchestrator = orchestrator(ScriptedProvider::new(), test_config());
    assert_matches!(
        orchestrator.submit_batch(vec![], Arc::new(NoopObserver)),
        Err(OrchestratorError::EmptyBatch)
    );
    assert_matches!(
        orchestrator.submit_batch(vec![image_spec(0), image_spec(0)], Arc::new(NoopObserver)),
        Err(OrchestratorError::DuplicateIndex(0))
    );
}
