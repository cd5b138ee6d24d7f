mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use booth_core::classification::JobError;
use booth_core::job::JobStatus;
use booth_engine::orchestrator::CancelError;
use booth_engine::JobOrchestrator;
use booth_provider::CancelTarget;
use tokio::time::sleep;

use common::*;

#[tokio::test(start_paused = true)]
async fn cooldown_counts_down_from_the_last_issued_cancel() {
    let provider = ScriptedProvider::new();
    let clock = test_clock();
    let orchestrator = JobOrchestrator::new(provider.clone(), limiter(clock.clone()), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(3), Recorder::new())
        .unwrap();
    batch.wait_started().await.unwrap();

    assert!(orchestrator.can_cancel().allowed);
    assert_eq!(orchestrator.cancel_limiter().interval(), Duration::from_secs(20));
    let mut cooldown = orchestrator.cancel_limiter().subscribe();
    batch.cancel(0).await.unwrap();

    assert!(cooldown.has_changed().unwrap());
    assert!(!cooldown.borrow_and_update().allowed);

    let check = orchestrator.can_cancel();
    assert!(!check.allowed);
    assert_eq!(check.cooldown_seconds_remaining, 20);
    assert_matches!(
        batch.cancel(1).await,
        Err(CancelError::CoolingDown { remaining_secs: 20 })
    );

    clock.advance(Duration::from_millis(12_500));
    assert_eq!(orchestrator.can_cancel().cooldown_seconds_remaining, 8);

    clock.advance(Duration::from_millis(7_500));
    assert!(orchestrator.can_cancel().allowed);
    batch.cancel(1).await.unwrap();
    assert_eq!(provider.cancels().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_releases_only_the_targeted_job() {
    let provider = ScriptedProvider::new();
    let recorder = Recorder::new();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(3), recorder.clone())
        .unwrap();
    batch.wait_started().await.unwrap();

    let project = provider.project_of(1);
    let job = provider.job_id_of(1);
    provider.emit(&project, started(&project, Some(&job)));
    provider.emit(&project, progress(&project, Some(&job), 40));
    settle().await;

    let receipt = batch.cancel(1).await.unwrap();
    assert_eq!(receipt.index, 1);
    assert_eq!(receipt.refund.percent, 57);
    assert!(receipt.remote_cancel_issued);
    assert_eq!(
        provider.cancels(),
        vec![CancelTarget {
            project_id: project.clone(),
            job_id: Some(job.clone()),
        }]
    );
    settle().await;

    assert!(batch.job_resources(1).unwrap().is_idle());
    assert!(!batch.job_resources(0).unwrap().is_idle());
    assert!(!batch.job_resources(2).unwrap().is_idle());
    assert_matches!(recorder.errors(1).as_slice(), [JobError::Cancelled]);

    // Late events for the canceled job are ignored.
    provider.emit(&project, job_completed(&project, Some(&job), Some(&result_url(&job))));
    for index in [0, 2] {
        let project = provider.project_of(index);
        let job = provider.job_id_of(index);
        provider.emit(&project, started(&project, Some(&job)));
        provider.emit(&project, job_completed(&project, Some(&job), Some(&result_url(&job))));
    }

    let result = batch.wait().await.unwrap();
    assert!(result.success, "canceled jobs are not failures");
    assert_eq!(result.entry(1).unwrap().status, JobStatus::Canceled);
    assert_eq!(recorder.completes(1), 0);
    settle().await;
    assert!(batch.active_resources().is_idle());
}

#[tokio::test(start_paused = true)]
async fn cancel_before_progress_refunds_almost_everything() {
    let provider = ScriptedProvider::new();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(1), Recorder::new())
        .unwrap();
    batch.wait_started().await.unwrap();

    let receipt = batch.cancel(0).await.unwrap();
    assert_eq!(receipt.refund.percent, 95);
}

#[tokio::test(start_paused = true)]
async fn failed_remote_cancel_does_not_start_cooldown() {
    let provider = ScriptedProvider::builder().failing_cancels().build();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(2), Recorder::new())
        .unwrap();
    batch.wait_started().await.unwrap();

    let receipt = batch.cancel(0).await.unwrap();
    assert!(!receipt.remote_cancel_issued);
    assert!(orchestrator.can_cancel().allowed);

    let records = batch.snapshot().await.unwrap();
    assert_eq!(records[0].status, JobStatus::Canceled);
}

#[tokio::test(start_paused = true)]
async fn finished_job_cannot_be_canceled() {
    let provider = ScriptedProvider::new();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(1), Recorder::new())
        .unwrap();
    batch.wait_started().await.unwrap();

    let project = provider.project_of(0);
    let job = provider.job_id_of(0);
    provider.emit(&project, started(&project, Some(&job)));
    provider.emit(&project, job_completed(&project, Some(&job), Some(&result_url(&job))));
    batch.wait().await.unwrap();

    assert_matches!(
        batch.cancel(0).await,
        Err(CancelError::NotActive { index: 0, status: "ready" })
    );
    assert_matches!(batch.cancel(9).await, Err(CancelError::UnknownIndex(9)));
    assert!(provider.cancels().is_empty());
}

#[tokio::test(start_paused = true)]
async fn job_created_after_cancel_is_canceled_remotely() {
    let provider = ScriptedProvider::new();
    provider.script(0, [Create::Delay(Duration::from_secs(5))]);
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(1), Recorder::new())
        .unwrap();
    settle().await;

    let receipt = batch.cancel(0).await.unwrap();
    assert!(!receipt.remote_cancel_issued, "nothing to cancel remotely yet");
    assert!(provider.cancels().is_empty());
    assert!(orchestrator.can_cancel().allowed);

    let result = batch.wait().await.unwrap();
    assert_eq!(result.entry(0).unwrap().status, JobStatus::Canceled);

    sleep(Duration::from_secs(6)).await;
    let cancels = provider.cancels();
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].project_id, provider.project_of(0));
    assert!(batch.active_resources().is_idle());

    let check = orchestrator.can_cancel();
    assert!(!check.allowed, "the remote cancel starts the cooldown");
    assert_eq!(check.cooldown_seconds_remaining, 20);
}

#[tokio::test(start_paused = true)]
async fn orphaned_job_waits_out_the_cooldown_before_canceling() {
    let provider = ScriptedProvider::new();
    provider.script(0, [Create::Delay(Duration::from_secs(5))]);
    let clock = test_clock();
    let orchestrator = JobOrchestrator::new(provider.clone(), limiter(clock.clone()), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(2), Recorder::new())
        .unwrap();
    settle().await;

    batch.cancel(0).await.unwrap();
    let receipt = batch.cancel(1).await.unwrap();
    assert!(receipt.remote_cancel_issued);
    assert_eq!(provider.cancels().len(), 1);

    // Job 0's creation returns while the cooldown from job 1 runs.
    sleep(Duration::from_secs(6)).await;
    assert_eq!(provider.cancels().len(), 1, "orphan cancel sent inside the cooldown");

    clock.advance(Duration::from_secs(20));
    sleep(Duration::from_secs(20)).await;
    let cancels = provider.cancels();
    assert_eq!(cancels.len(), 2);
    assert_eq!(cancels[1].project_id, provider.project_of(0));
    assert!(!orchestrator.can_cancel().allowed);
}

#[tokio::test(start_paused = true)]
async fn concurrent_cancels_issue_a_single_remote_cancel() {
    let provider = ScriptedProvider::new();
    let orchestrator = orchestrator(provider.clone(), test_config());
    let batch = orchestrator
        .submit_batch(image_specs(2), Recorder::new())
        .unwrap();
    batch.wait_started().await.unwrap();

    let (first, second) = tokio::join!(batch.cancel(0), batch.cancel(1));
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert_matches!(
        outcomes.iter().find(|o| o.is_err()),
        Some(Err(CancelError::CoolingDown { remaining_secs: 20 }))
    );
    assert_eq!(provider.cancels().len(), 1);
    assert!(!orchestrator.can_cancel().allowed);
}
