mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{spawn_consumer, wait_consuming, Harness};
use orchestrator_domain::{
    Action, ExecutionLog, MessageType, NotificationLevel, PipelineError, ResourceRepository,
    ResourceState, ResourceStatus, TaskLedger, TaskRecordStatus,
};
use orchestrator_infrastructure::AckOutcome;
use orchestrator_testing_utils::{ResourceBuilder, ScriptedPipeline, TestEnv};
use orchestrator_worker::{HandlerTable, MessageHandler, TaskFailure};

fn queued(id: i64) -> orchestrator_domain::Resource {
    ResourceBuilder::new(id)
        .with_lifecycle(ResourceState::Provision, ResourceStatus::Queued)
        .build()
}

#[tokio::test]
async fn test_successful_execution_provisions_resource() {
    let harness = Harness::new(ScriptedPipeline::new().then_ok(&["plan ok", "apply ok"])).await;
    let envelope = harness.dispatch(&queued(1), Action::Execute, 3).await;

    harness.task_handler().handle(&envelope).await.unwrap();

    let resource = harness.stores.resources.get(1).await.unwrap().unwrap();
    assert_eq!(resource.state, ResourceState::Provisioned);
    assert_eq!(resource.status, ResourceStatus::Done);
    assert_eq!(
        harness.stores.execution_log.flushed_lines(1).await,
        vec!["plan ok".to_string(), "apply ok".to_string()]
    );

    let records = harness.stores.ledger.records_for(1).await;
    assert_eq!(records[0].status, TaskRecordStatus::Succeeded);

    let notifications = harness.notifier.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].level, NotificationLevel::Info);
    assert!(notifications[0].msg.starts_with("Task execute for network 1"));

    // started 与 succeeded 两次状态变化
    assert_eq!(harness.events.actions_for(1).len(), 2);
}

#[tokio::test]
async fn test_dry_run_leaves_lifecycle_untouched() {
    let resource = ResourceBuilder::new(2).build();
    let harness = Harness::new(ScriptedPipeline::new().then_ok(&["no changes"])).await;
    let envelope = harness.dispatch(&resource, Action::Dryrun, 3).await;

    harness.task_handler().handle(&envelope).await.unwrap();

    let stored = harness.stores.resources.get(2).await.unwrap().unwrap();
    assert_eq!((stored.state, stored.status), (ResourceState::Provisioned, ResourceStatus::Done));
    assert!(harness.events.events().is_empty());
}

#[tokio::test]
async fn test_cannot_proceed_is_fatal_without_retry() {
    let harness = Harness::new(
        ScriptedPipeline::new().then_fail(PipelineError::CannotProceed("quota exceeded".into())),
    )
    .await;
    let envelope = harness.dispatch(&queued(3), Action::Execute, 3).await;

    let failure = harness.task_handler().handle(&envelope).await.unwrap_err();
    assert!(matches!(failure, TaskFailure::Fatal { timed_out: false, .. }));

    let resource = harness.stores.resources.get(3).await.unwrap().unwrap();
    assert_eq!(resource.status, ResourceStatus::Error);

    let messages = harness.notifier.messages_for("alice");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("quota exceeded"));

    let audit = harness.stores.audit.entries_for(3).await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "execute_failed");

    // 只有最初的派发，没有重投
    assert!(harness.broker.published().is_empty());
    assert_eq!(harness.stores.execution_log.flushed_lines(3).await.len(), 1);
}

#[tokio::test]
async fn test_unexpected_failure_reports_type_name() {
    let harness = Harness::new(
        ScriptedPipeline::new().then_fail(PipelineError::unexpected("KeyError", "'vpc_id'")),
    )
    .await;
    let envelope = harness.dispatch(&queued(4), Action::Execute, 3).await;

    let failure = harness.task_handler().handle(&envelope).await.unwrap_err();
    match failure {
        TaskFailure::Fatal { message, .. } => assert!(message.ends_with("failed with KeyError")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    let records = harness.stores.ledger.records_for(4).await;
    assert_eq!(records[0].status, TaskRecordStatus::Failed);
}

#[tokio::test]
async fn test_not_ready_retries_then_times_out() {
    let pipeline = ScriptedPipeline::new().then_fail_times(PipelineError::ParentIsNotReady(vec![10]), 3);
    let harness = Harness::new(pipeline.clone()).await;

    let handlers = HandlerTable::new().with(Arc::new(harness.task_handler()));
    let consumer = Arc::new(harness.task_consumer(handlers));
    let (shutdown, handle) = spawn_consumer(consumer.clone());
    wait_consuming(&consumer).await;

    let envelope = harness.dispatch(&queued(5), Action::Execute, 3).await;
    harness.publish(&envelope).await;

    let notifier = harness.notifier.clone();
    let finished = TestEnv::wait_for(
        || {
            let notifier = notifier.clone();
            async move { !notifier.notifications().is_empty() }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(finished, "no terminal notification");

    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(pipeline.call_count(), 3);

    let task_publishes: Vec<_> = harness
        .broker
        .published()
        .into_iter()
        .filter(|e| e.message_type == MessageType::Task)
        .collect();
    // 初次派发 + 两次重投，不会有第四次
    assert_eq!(task_publishes.len(), 3);
    let retries: Vec<i64> = task_publishes.iter().map(|e| e.metadata.retries).collect();
    assert_eq!(retries, vec![0, 1, 2]);
    assert!(task_publishes
        .iter()
        .all(|e| e.routing_key == "task.network.execute"));

    let messages = harness.notifier.messages_for("alice");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("timed out"));

    let resource = harness.stores.resources.get(5).await.unwrap().unwrap();
    assert_eq!(resource.status, ResourceStatus::Error);
    assert_eq!(harness.stores.audit.entries_for(5).await.len(), 1);

    let outcomes: Vec<AckOutcome> = harness
        .broker
        .acknowledgements()
        .into_iter()
        .map(|a| a.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![
            AckOutcome::Acked,
            AckOutcome::Acked,
            AckOutcome::Nacked { requeue: false }
        ]
    );
}

#[tokio::test]
async fn test_retry_requeues_resource_status() {
    let harness = Harness::new(
        ScriptedPipeline::new().then_fail(PipelineError::ChildrenIsNotReady(vec![8])),
    )
    .await;
    let envelope = harness.dispatch(&queued(6), Action::Execute, 3).await;

    let failure = harness.task_handler().handle(&envelope).await.unwrap_err();
    assert!(failure.is_retried());

    let resource = harness.stores.resources.get(6).await.unwrap().unwrap();
    assert_eq!(resource.status, ResourceStatus::Queued);
    let republished = harness.broker.published();
    assert_eq!(republished.len(), 1);
    assert_eq!(republished[0].metadata.retries, 1);
    assert!(republished[0].metadata.delay_ms > 0);
    assert!(harness.notifier.notifications().is_empty());
}

#[tokio::test]
async fn test_deleted_resource_is_dropped() {
    let harness = Harness::new(ScriptedPipeline::new()).await;
    let envelope = harness.dispatch(&queued(7), Action::Execute, 3).await;
    harness.stores.resources.delete(7).await.unwrap();

    harness.task_handler().handle(&envelope).await.unwrap();
    assert_eq!(harness.pipeline.call_count(), 0);
}

#[tokio::test]
async fn test_failure_flushes_buffered_log() {
    let harness = Harness::new(
        ScriptedPipeline::new().then_fail(PipelineError::ExitWithoutSave("nothing to do".into())),
    )
    .await;
    harness.stores.execution_log.append(9, "starting").await.unwrap();
    let envelope = harness.dispatch(&queued(9), Action::Execute, 3).await;

    let _ = harness.task_handler().handle(&envelope).await;
    let lines = harness.stores.execution_log.flushed_lines(9).await;
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "starting");
}

#[tokio::test]
async fn test_task_for_reset_resource_is_skipped() {
    let harness = Harness::new(ScriptedPipeline::new().then_ok(&["apply ok"])).await;
    let envelope = harness.dispatch(&queued(11), Action::Execute, 3).await;

    // reset 之后资源停在 ERROR，迟到的消息不能再执行
    let mut reset = harness.stores.resources.get(11).await.unwrap().unwrap();
    reset.status = ResourceStatus::Error;
    harness.stores.resources.save(&reset).await.unwrap();

    harness.task_handler().handle(&envelope).await.unwrap();

    assert_eq!(harness.pipeline.call_count(), 0);
    let stored = harness.stores.resources.get(11).await.unwrap().unwrap();
    assert_eq!((stored.state, stored.status), (ResourceState::Provision, ResourceStatus::Error));
    let records = harness.stores.ledger.records_for(11).await;
    assert_eq!(records[0].status, TaskRecordStatus::Superseded);
    assert!(harness.events.events().is_empty());
}

#[tokio::test]
async fn test_reemitted_task_runs_once() {
    let harness = Harness::new(ScriptedPipeline::new().then_ok(&["apply ok"])).await;
    let original = harness.dispatch(&queued(12), Action::Execute, 3).await;
    let reemitted = harness.dispatch(&queued(12), Action::Execute, 3).await;

    harness.task_handler().handle(&original).await.unwrap();
    assert_eq!(harness.pipeline.call_count(), 0);

    harness.task_handler().handle(&reemitted).await.unwrap();
    assert_eq!(harness.pipeline.call_count(), 1);

    let stored = harness.stores.resources.get(12).await.unwrap().unwrap();
    assert_eq!((stored.state, stored.status), (ResourceState::Provisioned, ResourceStatus::Done));

    let statuses: Vec<TaskRecordStatus> = harness
        .stores
        .ledger
        .records_for(12)
        .await
        .into_iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(statuses, vec![TaskRecordStatus::Superseded, TaskRecordStatus::Succeeded]);
    let latest = harness.stores.ledger.latest_for(12).await.unwrap().unwrap();
    assert_eq!(latest.status, TaskRecordStatus::Succeeded);
}
