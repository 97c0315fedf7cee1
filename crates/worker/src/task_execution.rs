use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use orchestrator_domain::{
    ExecutionEvent, ExecutionPipeline, MessageType, Notification, NotificationLevel, Resource,
    ResourceEvent, ResourceStatus, ResourceTask, StateMachine, TaskEnvelope, TaskRecordStatus,
};
use tracing::{debug, info, warn};

use crate::exception_classifier::ExceptionClassifier;
use crate::handlers::{MessageHandler, TaskFailure, WorkerPorts};

/// `task` 消息处理器：驱动执行管线并回写资源生命周期
pub struct ProvisioningTaskHandler {
    ports: WorkerPorts,
    pipeline: Arc<dyn ExecutionPipeline>,
    classifier: ExceptionClassifier,
}

impl ProvisioningTaskHandler {
    pub fn new(
        ports: WorkerPorts,
        pipeline: Arc<dyn ExecutionPipeline>,
        classifier: ExceptionClassifier,
    ) -> Self {
        Self {
            ports,
            pipeline,
            classifier,
        }
    }

    async fn mark(&self, task: &ResourceTask, status: TaskRecordStatus, detail: Option<String>) {
        if let Err(e) = self.ports.ledger.update_status(task.task_id, status, detail).await {
            warn!(task_id = %task.task_id, error = %e, "更新任务记录失败");
        }
    }

    async fn advance(
        &self,
        resource: &mut Resource,
        task: &ResourceTask,
        event: ExecutionEvent,
    ) -> Result<(), TaskFailure> {
        let next = StateMachine::on_execution(&resource.lifecycle(), event, task.dry_run);
        if next == resource.lifecycle() {
            return Ok(());
        }
        resource.set_lifecycle(next);
        self.ports.resources.save(resource).await?;

        let event = ResourceEvent::for_action(
            resource.id,
            resource.kind,
            task.action,
            &task.actor_id,
            resource.state,
            resource.status,
        );
        if let Err(e) = self.ports.events.publish(&event).await {
            warn!(resource_id = resource.id, error = %e, "发布资源事件失败");
        }
        Ok(())
    }

    /// 资源已离开 QUEUED（reset、destroy 等），或账本中已有更新的派发记录
    async fn stale_reason(
        &self,
        resource: &Resource,
        task: &ResourceTask,
    ) -> Result<Option<&'static str>, TaskFailure> {
        if !task.dry_run && resource.status != ResourceStatus::Queued {
            return Ok(Some("resource no longer queued"));
        }
        match self.ports.ledger.latest_for(task.resource_id).await? {
            Some(latest) if latest.task_id != task.task_id => Ok(Some("superseded by newer task")),
            _ => Ok(None),
        }
    }

    async fn append_lines(&self, task: &ResourceTask, lines: &[String]) {
        for line in lines {
            if let Err(e) = self.ports.execution_log.append(task.resource_id, line).await {
                warn!(resource_id = task.resource_id, error = %e, "追加执行日志失败");
                break;
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ProvisioningTaskHandler {
    fn message_type(&self) -> MessageType {
        MessageType::Task
    }

    async fn handle(&self, envelope: &TaskEnvelope) -> Result<(), TaskFailure> {
        let task: ResourceTask = envelope.body_as()?;
        info!(
            resource_id = task.resource_id,
            action = %task.action,
            retries = envelope.metadata.retries,
            dry_run = task.dry_run,
            "收到任务"
        );
        self.mark(&task, TaskRecordStatus::Received, None).await;

        let Some(mut resource) = self.ports.resources.get(task.resource_id).await? else {
            warn!(resource_id = task.resource_id, "资源已不存在，丢弃任务");
            self.mark(&task, TaskRecordStatus::Failed, Some("resource deleted".to_string()))
                .await;
            return Ok(());
        };

        if let Some(reason) = self.stale_reason(&resource, &task).await? {
            info!(
                task_id = %task.task_id,
                resource_id = task.resource_id,
                status = %resource.status,
                reason,
                "跳过过期任务"
            );
            self.mark(&task, TaskRecordStatus::Superseded, Some(reason.to_string())).await;
            counter!("orchestrator_tasks_skipped_total").increment(1);
            return Ok(());
        }

        self.advance(&mut resource, &task, ExecutionEvent::Started).await?;

        let outcome = match self.pipeline.run(&resource, &task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(resource_id = task.resource_id, error = %e, "执行管线失败");
                return Err(self.classifier.handle(envelope, &task, e).await);
            }
        };

        self.append_lines(&task, &outcome.log_lines).await;

        // 执行期间资源可能被修改，重新读取后再写回
        let mut resource = self
            .ports
            .resources
            .get(task.resource_id)
            .await?
            .unwrap_or(resource);
        self.advance(&mut resource, &task, ExecutionEvent::Succeeded).await?;

        if let Err(e) = self.ports.execution_log.flush(task.resource_id).await {
            warn!(resource_id = task.resource_id, error = %e, "刷新执行日志失败");
        }
        self.mark(&task, TaskRecordStatus::Succeeded, None).await;
        counter!("orchestrator_tasks_succeeded_total", "action" => task.action.as_str()).increment(1);

        let message = format!(
            "Task {} for {} {} finished successfully",
            task.action, task.entity, task.resource_id
        );
        let notification = Notification::new(&task.actor_id, message, NotificationLevel::Info)
            .for_resource(task.resource_id);
        if let Err(e) = self.ports.notifier.notify(&notification).await {
            warn!(user_id = %task.actor_id, error = %e, "发送通知失败");
        }

        info!(
            resource_id = task.resource_id,
            state = %resource.state,
            status = %resource.status,
            "任务执行完成"
        );
        Ok(())
    }
}
