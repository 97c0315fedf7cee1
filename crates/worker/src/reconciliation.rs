use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use metrics::counter;
use orchestrator_domain::{
    ExchangeKind, MessageBroker, MessageType, OrchestratorResult, ResourceStatus, ResourceTask,
    TaskEnvelope, TaskRecordStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::handlers::{MessageHandler, TaskFailure, WorkerPorts};

pub const RECONCILE_ROUTING_KEY: &str = "task.scheduler.reconcile";

/// `scheduler_job` 消息体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum SchedulerJob {
    ReconcileQueued {
        #[serde(default)]
        older_than_seconds: Option<i64>,
    },
}

impl SchedulerJob {
    pub fn envelope(&self, exchange: &str) -> OrchestratorResult<TaskEnvelope> {
        TaskEnvelope::new(
            self,
            MessageType::SchedulerJob,
            exchange,
            RECONCILE_ROUTING_KEY,
            ExchangeKind::Topic,
        )
    }
}

/// 对账：重新派发长时间停在 QUEUED 且从未被 worker 接收的任务
pub struct ReconciliationHandler {
    ports: WorkerPorts,
    broker: Arc<dyn MessageBroker>,
    task_exchange: String,
    max_retries: i64,
    default_threshold: Duration,
}

impl ReconciliationHandler {
    pub fn new(
        ports: WorkerPorts,
        broker: Arc<dyn MessageBroker>,
        task_exchange: impl Into<String>,
        max_retries: i64,
        default_threshold: Duration,
    ) -> Self {
        Self {
            ports,
            broker,
            task_exchange: task_exchange.into(),
            max_retries,
            default_threshold,
        }
    }

    /// 返回重新派发的任务数
    pub async fn reconcile(&self, threshold: Duration) -> OrchestratorResult<usize> {
        let cutoff = Utc::now() - threshold;
        let queued = self.ports.resources.find_by_status(ResourceStatus::Queued).await?;
        let mut reemitted = 0;

        for resource in queued.into_iter().filter(|r| r.updated_at <= cutoff) {
            let Some(record) = self.ports.ledger.latest_for(resource.id).await? else {
                debug!(resource_id = resource.id, "排队中的资源没有任务记录");
                continue;
            };
            let undelivered = matches!(
                record.status,
                TaskRecordStatus::Dispatched | TaskRecordStatus::PublishFailed
            );
            if !undelivered || record.updated_at > cutoff {
                continue;
            }

            let task = ResourceTask::new(&resource, record.action, record.actor_id.clone(), record.dry_run);
            self.ports.ledger.record(task.record(TaskRecordStatus::Dispatched)).await?;

            let envelope = TaskEnvelope::for_task(&task, &self.task_exchange, self.max_retries)?;
            match self.broker.publish(&envelope).await {
                Ok(()) => {
                    reemitted += 1;
                    info!(
                        resource_id = resource.id,
                        action = %task.action,
                        superseded = %record.task_id,
                        "已重新派发卡住的任务"
                    );
                }
                Err(e) => {
                    warn!(resource_id = resource.id, error = %e, "重新派发卡住的任务失败");
                    if let Err(e) = self
                        .ports
                        .ledger
                        .update_status(task.task_id, TaskRecordStatus::PublishFailed, Some(e.to_string()))
                        .await
                    {
                        warn!(task_id = %task.task_id, error = %e, "更新任务记录失败");
                    }
                }
            }
        }

        counter!("orchestrator_tasks_reconciled_total").increment(reemitted as u64);
        Ok(reemitted)
    }
}

#[async_trait]
impl MessageHandler for ReconciliationHandler {
    fn message_type(&self) -> MessageType {
        MessageType::SchedulerJob
    }

    async fn handle(&self, envelope: &TaskEnvelope) -> Result<(), TaskFailure> {
        match envelope.body_as::<SchedulerJob>()? {
            SchedulerJob::ReconcileQueued { older_than_seconds } => {
                let threshold = older_than_seconds
                    .map(Duration::seconds)
                    .unwrap_or(self.default_threshold);
                let count = self.reconcile(threshold).await?;
                info!(count, "对账完成");
            }
        }
        Ok(())
    }
}
