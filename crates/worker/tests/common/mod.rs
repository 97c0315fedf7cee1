#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use orchestrator_config::MessageQueueConfig;
use orchestrator_domain::{
    Action, MessageBroker, Resource, ResourceRepository, ResourceTask, TaskEnvelope,
    TaskLedger, TaskRecordStatus,
};
use orchestrator_infrastructure::{InMemoryBroker, MemoryStores, MessageQueueFactory};
use orchestrator_testing_utils::{RecordingEventPublisher, RecordingNotifier, ScriptedPipeline};
use orchestrator_worker::{
    ConsumerBinding, ConsumerState, ExceptionClassifier, HandlerTable, ProvisioningTaskHandler,
    RetryPolicy, TaskConsumer, WorkerPorts,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct Harness {
    pub config: MessageQueueConfig,
    pub broker: Arc<InMemoryBroker>,
    pub stores: MemoryStores,
    pub notifier: RecordingNotifier,
    pub events: RecordingEventPublisher,
    pub pipeline: ScriptedPipeline,
}

impl Harness {
    pub async fn new(pipeline: ScriptedPipeline) -> Self {
        let config = MessageQueueConfig::in_memory_default();
        let broker = Arc::new(InMemoryBroker::without_delays());
        MessageQueueFactory::declare_topology(broker.as_ref(), &config)
            .await
            .unwrap();
        Self {
            config,
            broker,
            stores: MemoryStores::new(),
            notifier: RecordingNotifier::new(),
            events: RecordingEventPublisher::new(),
            pipeline,
        }
    }

    pub fn ports(&self) -> WorkerPorts {
        WorkerPorts {
            resources: self.stores.resources.clone(),
            ledger: self.stores.ledger.clone(),
            execution_log: self.stores.execution_log.clone(),
            audit: self.stores.audit.clone(),
            notifier: Arc::new(self.notifier.clone()),
            events: Arc::new(self.events.clone()),
        }
    }

    pub fn task_handler(&self) -> ProvisioningTaskHandler {
        let classifier = ExceptionClassifier::new(
            self.ports(),
            self.broker.clone(),
            RetryPolicy::new(10, 50),
        );
        ProvisioningTaskHandler::new(self.ports(), Arc::new(self.pipeline.clone()), classifier)
    }

    pub fn task_consumer(&self, handlers: HandlerTable) -> TaskConsumer {
        TaskConsumer::new(
            "test-consumer",
            self.broker.clone(),
            ConsumerBinding::tasks(&self.config),
            handlers,
        )
    }

    /// Persist the resource and a dispatched task record, return the envelope
    pub async fn dispatch(&self, resource: &Resource, action: Action, max_retries: i64) -> TaskEnvelope {
        self.stores.resources.save(resource).await.unwrap();
        let task = ResourceTask::new(resource, action, "alice", action == Action::Dryrun);
        self.stores
            .ledger
            .record(task.record(TaskRecordStatus::Dispatched))
            .await
            .unwrap();
        TaskEnvelope::for_task(&task, &self.config.task_exchange, max_retries).unwrap()
    }

    pub async fn publish(&self, envelope: &TaskEnvelope) {
        self.broker.publish(envelope).await.unwrap();
    }
}

pub fn spawn_consumer(
    consumer: Arc<TaskConsumer>,
) -> (broadcast::Sender<()>, JoinHandle<orchestrator_domain::OrchestratorResult<()>>) {
    let (shutdown, rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move { consumer.run(rx).await });
    (shutdown, handle)
}

pub async fn wait_consuming(consumer: &TaskConsumer) {
    for _ in 0..100 {
        if consumer.state().await == ConsumerState::Consuming {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("consumer never reached consuming state");
}
