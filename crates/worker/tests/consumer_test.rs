mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{spawn_consumer, wait_consuming, Harness};
use orchestrator_domain::{
    Action, ApprovalFlowSwitch, ExchangeKind, MessageBroker, MessageType, OrchestratorError,
    OrchestratorResult, ResourceState, ResourceStatus, TaskEnvelope, TaskLedger,
    TaskRecordStatus, WorkerRegistration, WorkerRegistry,
};
use orchestrator_config::MessageQueueConfig;
use orchestrator_infrastructure::{AckOutcome, InMemoryWorkerRegistry, MessageQueueFactory};
use orchestrator_testing_utils::{ResourceBuilder, ScriptedPipeline, TestEnv};
use orchestrator_worker::{
    ConsumerBinding, ConsumerState, HandlerTable, HealthCheckManager, ReconciliationHandler,
    SchedulerJob, SystemEventHandler, TaskConsumer, WorkerService,
};
use serde_json::json;
use tokio::sync::broadcast;

#[test]
fn test_task_binding_matches_declared_topology() {
    let config = MessageQueueConfig::default();
    let binding = ConsumerBinding::tasks(&config);
    assert!(binding.exchange.delayed);
    assert_eq!(
        MessageQueueFactory::durable_exchanges(&config).first(),
        Some(&binding.exchange)
    );
}

#[tokio::test]
async fn test_system_broadcast_toggles_approval_flow() {
    let harness = Harness::new(ScriptedPipeline::new()).await;
    let switch = ApprovalFlowSwitch::new(true);
    let consumer = Arc::new(TaskConsumer::new(
        "system-consumer",
        harness.broker.clone(),
        ConsumerBinding::system(&harness.config),
        HandlerTable::new().with(Arc::new(SystemEventHandler::new(switch.clone()))),
    ));
    let (shutdown, handle) = spawn_consumer(consumer.clone());
    wait_consuming(&consumer).await;

    let envelope = TaskEnvelope::new(
        json!({"event": "approval_flow", "enabled": false}),
        MessageType::Broadcast,
        harness.config.system_exchange.as_str(),
        "",
        ExchangeKind::Fanout,
    )
    .unwrap();
    harness.publish(&envelope).await;

    let observed = switch.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let observed = observed.clone();
                async move { !observed.is_enabled() }
            },
            Duration::from_secs(2),
        )
        .await
    );

    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(consumer.state().await, ConsumerState::Cancelled);
}

#[tokio::test]
async fn test_message_without_handler_is_rejected() {
    let harness = Harness::new(ScriptedPipeline::new()).await;
    let consumer = Arc::new(harness.task_consumer(HandlerTable::new()));
    let (shutdown, handle) = spawn_consumer(consumer.clone());
    wait_consuming(&consumer).await;

    let resource = ResourceBuilder::new(1)
        .with_lifecycle(ResourceState::Provision, ResourceStatus::Queued)
        .build();
    let envelope = harness.dispatch(&resource, Action::Execute, 3).await;
    harness.publish(&envelope).await;

    let broker = harness.broker.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let broker = broker.clone();
                async move { !broker.acknowledgements().is_empty() }
            },
            Duration::from_secs(2),
        )
        .await
    );
    assert_eq!(
        harness.broker.acknowledgements()[0].outcome,
        AckOutcome::Nacked { requeue: false }
    );

    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_busy_flag_cleared_after_processing() {
    let harness = Harness::new(ScriptedPipeline::new().then_ok(&["done"])).await;
    let registry = harness.stores.workers.clone();
    registry
        .register(&WorkerRegistration::new("worker-a", "host-a"))
        .await
        .unwrap();

    let consumer = Arc::new(
        harness
            .task_consumer(HandlerTable::new().with(Arc::new(harness.task_handler())))
            .with_busy_tracking(registry.clone(), "worker-a"),
    );
    let (shutdown, handle) = spawn_consumer(consumer.clone());
    wait_consuming(&consumer).await;

    let resource = ResourceBuilder::new(2)
        .with_lifecycle(ResourceState::Provision, ResourceStatus::Queued)
        .build();
    let envelope = harness.dispatch(&resource, Action::Execute, 3).await;
    harness.publish(&envelope).await;

    let broker = harness.broker.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let broker = broker.clone();
                async move { !broker.acknowledgements().is_empty() }
            },
            Duration::from_secs(2),
        )
        .await
    );
    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let worker = registry.get("worker-a").await.unwrap().unwrap();
    assert!(!worker.busy);
    assert_eq!(harness.broker.acknowledgements()[0].outcome, AckOutcome::Acked);
}

#[tokio::test]
async fn test_consumer_fails_when_broker_down() {
    let harness = Harness::new(ScriptedPipeline::new()).await;
    harness.broker.set_connected(false);
    let consumer = harness.task_consumer(HandlerTable::new());

    let (_shutdown, rx) = broadcast::channel(1);
    assert!(consumer.run(rx).await.is_err());
    assert_eq!(consumer.state().await, ConsumerState::Failed);
}

#[tokio::test]
async fn test_reconciliation_reemits_undelivered_task() {
    let harness = Harness::new(ScriptedPipeline::new()).await;
    let stuck = ResourceBuilder::new(3)
        .with_lifecycle(ResourceState::Provision, ResourceStatus::Queued)
        .updated_minutes_ago(30)
        .build();
    let fresh = ResourceBuilder::new(4)
        .with_lifecycle(ResourceState::Provision, ResourceStatus::Queued)
        .build();
    harness.dispatch(&stuck, Action::Execute, 3).await;
    harness.dispatch(&fresh, Action::Execute, 3).await;

    // 把 stuck 的派发记录也回拨到 30 分钟前
    let mut record = harness.stores.ledger.latest_for(3).await.unwrap().unwrap();
    harness.stores.ledger.purge(3).await.unwrap();
    record.created_at = Utc::now() - chrono::Duration::minutes(30);
    record.updated_at = record.created_at;
    harness.stores.ledger.record(record).await.unwrap();

    let handler = ReconciliationHandler::new(
        harness.ports(),
        harness.broker.clone(),
        harness.config.task_exchange.clone(),
        3,
        chrono::Duration::minutes(15),
    );
    let count = handler.reconcile(chrono::Duration::minutes(15)).await.unwrap();
    assert_eq!(count, 1);

    let published = harness.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "task.network.execute");
    assert_eq!(published[0].body["resource_id"], json!(3));

    let latest = harness.stores.ledger.latest_for(3).await.unwrap().unwrap();
    assert_eq!(latest.status, TaskRecordStatus::Dispatched);
    assert_eq!(harness.stores.ledger.records_for(3).await.len(), 2);
}

#[tokio::test]
async fn test_scheduler_job_envelope_routes_to_task_queue() {
    let harness = Harness::new(ScriptedPipeline::new()).await;
    let handler = Arc::new(ReconciliationHandler::new(
        harness.ports(),
        harness.broker.clone(),
        harness.config.task_exchange.clone(),
        3,
        chrono::Duration::minutes(15),
    ));
    let consumer = Arc::new(harness.task_consumer(HandlerTable::new().with(handler)));
    let (shutdown, handle) = spawn_consumer(consumer.clone());
    wait_consuming(&consumer).await;

    let job = SchedulerJob::ReconcileQueued { older_than_seconds: Some(60) };
    harness
        .broker
        .publish(&job.envelope(&harness.config.task_exchange).unwrap())
        .await
        .unwrap();

    let broker = harness.broker.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let broker = broker.clone();
                async move { !broker.acknowledgements().is_empty() }
            },
            Duration::from_secs(2),
        )
        .await
    );
    assert_eq!(harness.broker.acknowledgements()[0].outcome, AckOutcome::Acked);

    shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_health_check_preserves_busy_flag() {
    let registry = Arc::new(InMemoryWorkerRegistry::new());
    let manager = HealthCheckManager::new(
        registry.clone(),
        WorkerRegistration::new("worker-b", "host-b"),
        Duration::from_secs(60),
    );

    manager.register_once().await.unwrap();
    registry.set_busy("worker-b", true, Utc::now()).await.unwrap();
    manager.register_once().await.unwrap();

    let worker = registry.get("worker-b").await.unwrap().unwrap();
    assert!(worker.busy);
}

/// 记录 register 次数；busy 写入只能来自 set_busy
struct CountingRegistry {
    inner: InMemoryWorkerRegistry,
    registrations: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl WorkerRegistry for CountingRegistry {
    async fn register(&self, registration: &WorkerRegistration) -> OrchestratorResult<()> {
        self.registrations
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.register(registration).await
    }

    async fn set_busy(&self, name: &str, busy: bool, at: DateTime<Utc>) -> OrchestratorResult<()> {
        self.inner.set_busy(name, busy, at).await
    }

    async fn touch(&self, name: &str, at: DateTime<Utc>) -> OrchestratorResult<bool> {
        self.inner.touch(name, at).await
    }

    async fn get(&self, name: &str) -> OrchestratorResult<Option<WorkerRegistration>> {
        self.inner.get(name).await
    }

    async fn list(&self) -> OrchestratorResult<Vec<WorkerRegistration>> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn test_heartbeat_never_rewrites_busy_flag() {
    let registry = Arc::new(CountingRegistry {
        inner: InMemoryWorkerRegistry::new(),
        registrations: std::sync::atomic::AtomicUsize::new(0),
    });
    let manager = HealthCheckManager::new(
        registry.clone(),
        WorkerRegistration::new("worker-d", "host-d"),
        Duration::from_secs(60),
    );

    manager.register_once().await.unwrap();
    let first_seen = registry.get("worker-d").await.unwrap().unwrap().last_seen;
    registry.set_busy("worker-d", true, first_seen).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.register_once().await.unwrap();
    manager.register_once().await.unwrap();

    assert_eq!(
        registry.registrations.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    let worker = registry.get("worker-d").await.unwrap().unwrap();
    assert!(worker.busy);
    assert!(worker.last_seen > first_seen);
}

struct BrokenRegistry;

#[async_trait]
impl WorkerRegistry for BrokenRegistry {
    async fn register(&self, _registration: &WorkerRegistration) -> OrchestratorResult<()> {
        Err(OrchestratorError::storage("registry offline"))
    }

    async fn set_busy(&self, _name: &str, _busy: bool, _at: DateTime<Utc>) -> OrchestratorResult<()> {
        Ok(())
    }

    async fn touch(&self, _name: &str, _at: DateTime<Utc>) -> OrchestratorResult<bool> {
        Ok(false)
    }

    async fn get(&self, _name: &str) -> OrchestratorResult<Option<WorkerRegistration>> {
        Ok(None)
    }

    async fn list(&self) -> OrchestratorResult<Vec<WorkerRegistration>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_health_check_failure_stops_worker_service() {
    let harness = Harness::new(ScriptedPipeline::new()).await;
    let consumer = harness.task_consumer(HandlerTable::new());
    let health = HealthCheckManager::new(
        Arc::new(BrokenRegistry),
        WorkerRegistration::new("worker-c", "host-c"),
        Duration::from_secs(60),
    );

    let service = WorkerService::new()
        .with_consumer(consumer)
        .with_health_check(health);
    let (shutdown, _rx) = broadcast::channel(4);

    let result = tokio::time::timeout(Duration::from_secs(2), service.run(shutdown))
        .await
        .expect("worker service did not stop");
    assert!(result.is_err());
}
