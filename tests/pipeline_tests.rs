//! End-to-end grading runs through an in-memory pipeline with scripted
//! stage handlers.


use std::time::Duration;

use autograder_pipeline::error::PipelineError;
use autograder_pipeline::grading::{GradingOutcome, CANCELLED_MESSAGE};
use autograder_pipeline::queue::{JobOutcome, QueueEventKind, QueueName};
use autograder_pipeline::stages::Stage;
use test_harness::{
    fake_handlers, request, CallLog, FakeClone, FakeEvaluator, FakeTests, Script, TestPipeline,
};

async fn grading_outcome(handle: autograder_pipeline::queue::JobHandle) -> JobOutcome {
    tokio::time::timeout(Duration::from_secs(600), handle.outcome())
        .await
        .expect("grading job never finished")
}

#[tokio::test]
async fn happy_path_reports_completion_with_report_reference() {
    let log = CallLog::new();
    let pipeline = TestPipeline::start(fake_handlers(&log)).await;

    let handle = pipeline.submit(&request("s1")).await;
    let outcomes = pipeline.outcomes(1).await;

    let GradingOutcome::Completed(report) = &outcomes[0] else {
        panic!("expected completion, got {:?}", outcomes[0]);
    };
    assert_eq!(report.submission_id, "s1");
    assert_eq!(report.report_reference, "memory://reports/s1/attempt-1");
    assert!(report.build_success);
    // tests 3/4 of 10 = 7.5, design 8, quality (7.5 + 8) / 2 = 7.75
    assert_eq!(report.total_score, 23.25);
    assert_eq!(report.max_score, 30.0);
    assert_eq!(report.percentage, 77.5);
    assert_eq!(report.letter_grade, "C");

    let JobOutcome::Completed(value) = grading_outcome(handle).await else {
        panic!("grading job should complete");
    };
    assert_eq!(value["status"], "completed");
    assert_eq!(value["submissionId"], "s1");

    // Exactly one terminal report, even after things settle
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.sink.outcomes().await.len(), 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn stages_run_strictly_in_pipeline_order() {
    let log = CallLog::new();
    let pipeline = TestPipeline::start(fake_handlers(&log)).await;

    pipeline.submit(&request("s1")).await;
    pipeline.outcomes(1).await;

    assert_eq!(
        log.stage_sequence(),
        vec![
            Stage::Clone,
            Stage::TestExecution,
            Stage::CodeAnalysis,
            Stage::GptEvaluation,
            Stage::ReportGeneration,
        ]
    );

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn clone_exhausting_retries_fails_at_clone_stage() {
    let log = CallLog::new();
    let handlers =
        fake_handlers(&log).with_clone(FakeClone::new(log.clone(), Script::AlwaysFail));
    let pipeline = TestPipeline::start(handlers).await;

    let handle = pipeline.submit(&request("s1")).await;
    let outcomes = pipeline.outcomes(1).await;

    let GradingOutcome::Failed(failure) = &outcomes[0] else {
        panic!("expected failure, got {:?}", outcomes[0]);
    };
    assert_eq!(failure.submission_id, "s1");
    assert_eq!(failure.failed_stage, Stage::Clone);
    assert_eq!(failure.error_message, "clone unavailable");

    assert_eq!(log.count(Stage::Clone), 3);
    assert_eq!(log.count(Stage::TestExecution), 0);
    let test_jobs = pipeline
        .registry()
        .queue(QueueName::TestExecution)
        .jobs(None)
        .await
        .unwrap();
    assert!(test_jobs.is_empty(), "no test execution job may be enqueued");

    // The grading job fails without spending its own retries
    let JobOutcome::Failed { attempts_made, .. } = grading_outcome(handle).await else {
        panic!("grading job should fail");
    };
    assert_eq!(attempts_made, 1);
    assert!(pipeline.leftover_work_dirs().is_empty());

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn one_failed_evaluation_fails_the_run_before_reporting() {
    let log = CallLog::new();
    let handlers = fake_handlers(&log)
        .with_gpt_evaluation(FakeEvaluator::new(log.clone()).failing("quality"));
    let pipeline = TestPipeline::start(handlers).await;

    pipeline.submit(&request("s1")).await;
    let outcomes = pipeline.outcomes(1).await;

    let GradingOutcome::Failed(failure) = &outcomes[0] else {
        panic!("expected failure, got {:?}", outcomes[0]);
    };
    assert_eq!(failure.failed_stage, Stage::GptEvaluation);
    assert!(failure.error_message.contains("quality"));

    // Both criteria were dispatched; only the failing one was retried
    let evaluations = pipeline
        .registry()
        .queue(QueueName::GptEvaluation)
        .jobs(None)
        .await
        .unwrap();
    assert_eq!(evaluations.len(), 2);
    assert_eq!(log.count(Stage::GptEvaluation), 1 + 3);

    assert_eq!(log.count(Stage::ReportGeneration), 0);
    let reports = pipeline
        .registry()
        .queue(QueueName::ReportGeneration)
        .jobs(None)
        .await
        .unwrap();
    assert!(reports.is_empty());
    assert!(pipeline.leftover_work_dirs().is_empty());

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reporting_waits_for_every_evaluation() {
    let log = CallLog::new();
    let handlers = fake_handlers(&log).with_gpt_evaluation(
        FakeEvaluator::new(log.clone()).with_delay(Duration::from_secs(3)),
    );
    let pipeline = TestPipeline::start(handlers).await;

    pipeline.submit(&request("s1")).await;
    let outcomes = pipeline.outcomes(1).await;
    assert!(matches!(outcomes[0], GradingOutcome::Completed(_)));

    let calls = log.calls();
    let evaluations: Vec<_> = calls
        .iter()
        .filter(|c| c.stage == Stage::GptEvaluation)
        .collect();
    assert_eq!(evaluations.len(), 2);
    let report = calls
        .iter()
        .find(|c| c.stage == Stage::ReportGeneration)
        .expect("report generated");
    for evaluation in evaluations {
        assert!(report.at >= evaluation.at + Duration::from_secs(3));
    }

    pipeline.stop().await;
}

#[tokio::test]
async fn progress_only_rises_and_hits_100_on_completion() {
    let log = CallLog::new();
    let pipeline = TestPipeline::start(fake_handlers(&log)).await;
    let mut events = pipeline.registry().subscribe();

    let handle = pipeline.submit(&request("s1")).await;
    let grading_id = handle.id();
    assert!(grading_outcome(handle).await.is_completed());

    let mut progress = Vec::new();
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        if event.job_id != Some(grading_id) {
            continue;
        }
        match event.kind {
            QueueEventKind::Progress { progress: p } => {
                assert!(!completed, "progress after completion");
                progress.push(p);
            }
            QueueEventKind::Completed { .. } => completed = true,
            _ => {}
        }
    }

    assert!(completed);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert_eq!(progress.last(), Some(&100));
    for milestone in [5, 10, 30, 50, 70, 90] {
        assert!(progress.contains(&milestone), "missing {} in {:?}", milestone, progress);
    }

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_run_never_reports_full_progress() {
    let log = CallLog::new();
    let handlers =
        fake_handlers(&log).with_test_execution(FakeTests::new(log.clone(), Script::FailPermanently));
    let pipeline = TestPipeline::start(handlers).await;
    let mut events = pipeline.registry().subscribe();

    let handle = pipeline.submit(&request("s1")).await;
    let grading_id = handle.id();
    assert!(!grading_outcome(handle).await.is_completed());

    let mut max_progress = 0;
    while let Ok(event) = events.try_recv() {
        if let (Some(id), QueueEventKind::Progress { progress }) = (event.job_id, &event.kind) {
            if id == grading_id {
                assert!(*progress >= max_progress);
                max_progress = *progress;
            }
        }
    }
    assert_eq!(max_progress, 30);

    let outcomes = pipeline.sink.outcomes().await;
    let GradingOutcome::Failed(failure) = &outcomes[0] else {
        panic!("expected failure");
    };
    assert_eq!(failure.failed_stage, Stage::TestExecution);
    // Permanent errors are not retried
    assert_eq!(log.count(Stage::TestExecution), 1);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn transient_stage_failures_are_retried_to_success() {
    let log = CallLog::new();
    let handlers =
        fake_handlers(&log).with_clone(FakeClone::new(log.clone(), Script::FailTimes(2)));
    let pipeline = TestPipeline::start(handlers).await;

    pipeline.submit(&request("s1")).await;
    let outcomes = pipeline.outcomes(1).await;

    assert!(matches!(outcomes[0], GradingOutcome::Completed(_)));
    assert_eq!(log.count(Stage::Clone), 3);
    assert_eq!(log.count(Stage::ReportGeneration), 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn resubmitting_the_same_attempt_runs_twice() {
    let log = CallLog::new();
    let pipeline = TestPipeline::start(fake_handlers(&log)).await;

    let first = pipeline.submit(&request("s1")).await;
    let second = pipeline.submit(&request("s1")).await;
    assert_ne!(first.id(), second.id());

    let outcomes = pipeline.outcomes(2).await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, GradingOutcome::Completed(_)) && o.submission_id() == "s1"));
    assert_eq!(log.count(Stage::Clone), 2);
    assert_eq!(log.count(Stage::ReportGeneration), 2);

    pipeline.stop().await;
}

#[tokio::test]
async fn work_directories_are_removed_after_completion() {
    let log = CallLog::new();
    let pipeline = TestPipeline::start(fake_handlers(&log)).await;

    let a = pipeline.submit(&request("s1")).await;
    let b = pipeline.submit(&request("s2")).await;
    assert!(grading_outcome(a).await.is_completed());
    assert!(grading_outcome(b).await.is_completed());

    assert!(
        pipeline.leftover_work_dirs().is_empty(),
        "left behind: {:?}",
        pipeline.leftover_work_dirs()
    );

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_fails_with_cancellation_message() {
    let log = CallLog::new();
    let handlers =
        fake_handlers(&log).with_clone(FakeClone::new(log.clone(), Script::FailTimes(1)));
    let pipeline = TestPipeline::start(handlers).await;

    let handle = pipeline.submit(&request("s1")).await;
    assert!(pipeline.pipeline.cancel(handle.id()).await.unwrap());

    let outcomes = pipeline.outcomes(1).await;
    let GradingOutcome::Failed(failure) = &outcomes[0] else {
        panic!("expected failure, got {:?}", outcomes[0]);
    };
    assert_eq!(failure.error_message, CANCELLED_MESSAGE);
    assert_eq!(log.count(Stage::TestExecution), 0);
    assert_eq!(log.count(Stage::ReportGeneration), 0);
    assert!(!grading_outcome(handle).await.is_completed());
    assert!(pipeline.leftover_work_dirs().is_empty());

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unavailable_rubric_is_retried_then_reported_as_accepted() {
    let log = CallLog::new();
    let pipeline = TestPipeline::start(fake_handlers(&log)).await;

    let mut req = request("s1");
    req.rubric_id = "r404".to_string();
    let handle = pipeline.submit(&req).await;

    let outcomes = pipeline.outcomes(1).await;
    let GradingOutcome::Failed(failure) = &outcomes[0] else {
        panic!("expected failure, got {:?}", outcomes[0]);
    };
    assert_eq!(failure.failed_stage, Stage::Accepted);
    assert!(failure.error_message.contains("rubric not found"));
    assert_eq!(log.count(Stage::Clone), 0);

    let JobOutcome::Failed { attempts_made, .. } = grading_outcome(handle).await else {
        panic!("grading job should fail");
    };
    assert_eq!(attempts_made, 3);
    // Only the final attempt reports
    assert_eq!(pipeline.sink.outcomes().await.len(), 1);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_evaluation_drains_the_run() {
    let log = CallLog::new();
    let handlers = fake_handlers(&log).with_gpt_evaluation(
        FakeEvaluator::new(log.clone()).with_delay(Duration::from_secs(3)),
    );
    let pipeline = TestPipeline::start(handlers).await;
    let mut events = pipeline.registry().subscribe();

    pipeline.submit(&request("s1")).await;
    loop {
        let event = events.recv().await.unwrap();
        if event.queue == QueueName::GptEvaluation
            && matches!(event.kind, QueueEventKind::Active { .. })
        {
            break;
        }
    }

    let sink = pipeline.sink.clone();
    tokio::time::timeout(Duration::from_secs(3600), pipeline.stop())
        .await
        .expect("shutdown hung with stage jobs outstanding");

    // The in-flight run finished on the stage queues before they stopped
    let outcomes = sink.outcomes().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], GradingOutcome::Completed(_)));
    assert_eq!(log.count(Stage::GptEvaluation), 2);
    assert_eq!(log.count(Stage::ReportGeneration), 1);
}

#[tokio::test]
async fn cancelling_a_finished_run_is_ignored() {
    let log = CallLog::new();
    let pipeline = TestPipeline::start(fake_handlers(&log)).await;

    let handle = pipeline.submit(&request("s1")).await;
    let id = handle.id();
    assert!(grading_outcome(handle).await.is_completed());

    assert!(!pipeline.pipeline.cancel(id).await.unwrap());
    assert!(!pipeline.pipeline.cancel(uuid::Uuid::new_v4()).await.unwrap());

    pipeline.stop().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_at_submit() {
    let log = CallLog::new();
    let pipeline = TestPipeline::start(fake_handlers(&log)).await;

    let mut req = request("s1");
    req.github_repo_url = String::new();
    let err = pipeline.pipeline.submit(&req).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));

    let grading_jobs = pipeline
        .registry()
        .queue(QueueName::Grading)
        .jobs(None)
        .await
        .unwrap();
    assert!(grading_jobs.is_empty());

    pipeline.stop().await;
}
