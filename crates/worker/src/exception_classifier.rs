use std::sync::Arc;

use metrics::counter;
use orchestrator_config::MessageQueueConfig;
use orchestrator_domain::{
    EnvelopeMetadata, ExecutionEvent, MessageBroker, Notification, NotificationLevel,
    PipelineError, ResourceEvent, ResourceTask, StateMachine, TaskEnvelope, TaskRecordStatus,
};
use tracing::{error, info, warn};

use crate::handlers::{TaskFailure, WorkerPorts};

/// 执行管线失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 父/子资源就绪竞争，重新投递
    Retry,
    /// 就绪竞争但已用完投递次数
    TimedOut,
    /// CannotProceed / ExitWithoutSave
    FatalExplicit,
    FatalUnexpected,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Retry => "retry",
            FailureClass::TimedOut => "timed_out",
            FailureClass::FatalExplicit => "fatal_explicit",
            FailureClass::FatalUnexpected => "fatal_unexpected",
        }
    }
}

/// 指数退避：base * 2^retries，±10% 抖动，不超过上限
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    pub fn from_config(config: &MessageQueueConfig) -> Self {
        Self::new(config.retry_base_delay_ms, config.retry_max_delay_ms)
    }

    pub fn delay_for(&self, retries: i64) -> i64 {
        let exponent = retries.clamp(0, 20) as u32;
        let raw = self.base_delay_ms.saturating_mul(1u64 << exponent) as f64;
        let jitter = 0.9 + rand::random::<f64>() * 0.2;
        (raw * jitter).min(self.max_delay_ms as f64).round() as i64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&MessageQueueConfig::default())
    }
}

pub struct ExceptionClassifier {
    ports: WorkerPorts,
    broker: Arc<dyn MessageBroker>,
    retry: RetryPolicy,
}

impl ExceptionClassifier {
    pub fn new(ports: WorkerPorts, broker: Arc<dyn MessageBroker>, retry: RetryPolicy) -> Self {
        Self { ports, broker, retry }
    }

    pub fn classify(error: &PipelineError, metadata: &EnvelopeMetadata) -> FailureClass {
        match error {
            e if e.is_not_ready() && metadata.is_exhausted() => FailureClass::TimedOut,
            e if e.is_not_ready() => FailureClass::Retry,
            PipelineError::CannotProceed(_) | PipelineError::ExitWithoutSave(_) => {
                FailureClass::FatalExplicit
            }
            _ => FailureClass::FatalUnexpected,
        }
    }

    pub fn failure_message(class: FailureClass, task: &ResourceTask, error: &PipelineError) -> String {
        let subject = format!("Task {} for {} {}", task.action, task.entity, task.resource_id);
        match class {
            FailureClass::Retry => format!("{subject} is waiting for dependencies"),
            FailureClass::TimedOut => {
                format!("{subject} timed out waiting for dependencies: {error}")
            }
            FailureClass::FatalExplicit => format!("{subject} failed: {error}"),
            FailureClass::FatalUnexpected => {
                format!("{subject} failed with {}", error.kind_name())
            }
        }
    }

    /// 处理一次管线失败，总是返回一个 TaskFailure
    pub async fn handle(
        &self,
        envelope: &TaskEnvelope,
        task: &ResourceTask,
        error: PipelineError,
    ) -> TaskFailure {
        let class = Self::classify(&error, &envelope.metadata);
        counter!("orchestrator_pipeline_failures_total", "class" => class.as_str()).increment(1);

        if class == FailureClass::Retry {
            match self.reschedule(envelope, task).await {
                Ok(failure) => return failure,
                Err(e) => {
                    error!(
                        resource_id = task.resource_id,
                        error = %e,
                        "任务重投失败，按终止失败处理"
                    );
                    let message = format!(
                        "Task {} for {} {} could not be rescheduled: {e}",
                        task.action, task.entity, task.resource_id
                    );
                    return self.fail(task, message, false).await;
                }
            }
        }

        let message = Self::failure_message(class, task, &error);
        self.fail(task, message, class == FailureClass::TimedOut).await
    }

    async fn reschedule(
        &self,
        envelope: &TaskEnvelope,
        task: &ResourceTask,
    ) -> orchestrator_domain::OrchestratorResult<TaskFailure> {
        let delay_ms = self.retry.delay_for(envelope.metadata.retries);
        let next = envelope.retry(delay_ms);
        self.broker.publish(&next).await?;

        counter!("orchestrator_retries_scheduled_total", "action" => task.action.as_str()).increment(1);
        info!(
            resource_id = task.resource_id,
            action = %task.action,
            retries = next.metadata.retries,
            delay_ms,
            "依赖未就绪，任务已延迟重投"
        );

        if let Err(e) = self
            .ports
            .ledger
            .update_status(
                task.task_id,
                TaskRecordStatus::Retrying,
                Some(format!("retry {} of {}", next.metadata.retries, next.metadata.max_retries)),
            )
            .await
        {
            warn!(task_id = %task.task_id, error = %e, "更新任务记录失败");
        }
        self.transition(task, ExecutionEvent::AwaitingRetry).await;

        Ok(TaskFailure::Retried {
            retries: next.metadata.retries,
            delay_ms,
        })
    }

    /// 终止失败：标记 ERROR、刷新日志、通知用户、写一条审计
    async fn fail(&self, task: &ResourceTask, message: String, timed_out: bool) -> TaskFailure {
        error!(
            resource_id = task.resource_id,
            action = %task.action,
            timed_out,
            "{}", message
        );
        counter!("orchestrator_task_failures_total", "action" => task.action.as_str()).increment(1);

        self.transition(task, ExecutionEvent::Failed).await;

        if let Err(e) = self.ports.execution_log.append(task.resource_id, &message).await {
            warn!(resource_id = task.resource_id, error = %e, "追加执行日志失败");
        }
        if let Err(e) = self.ports.execution_log.flush(task.resource_id).await {
            warn!(resource_id = task.resource_id, error = %e, "刷新执行日志失败");
        }
        if let Err(e) = self
            .ports
            .ledger
            .update_status(task.task_id, TaskRecordStatus::Failed, Some(message.clone()))
            .await
        {
            warn!(task_id = %task.task_id, error = %e, "更新任务记录失败");
        }

        let notification = Notification::new(&task.actor_id, &message, NotificationLevel::Error)
            .for_resource(task.resource_id);
        if let Err(e) = self.ports.notifier.notify(&notification).await {
            warn!(user_id = %task.actor_id, error = %e, "发送通知失败");
        }

        let audit_action = format!("{}_failed", task.action);
        if let Err(e) = self
            .ports
            .audit
            .record(task.resource_id, &task.actor_id, &audit_action)
            .await
        {
            warn!(resource_id = task.resource_id, error = %e, "写入审计记录失败");
        }

        TaskFailure::Fatal { message, timed_out }
    }

    async fn transition(&self, task: &ResourceTask, event: ExecutionEvent) {
        let mut resource = match self.ports.resources.get(task.resource_id).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                warn!(resource_id = task.resource_id, "执行期间资源被删除");
                return;
            }
            Err(e) => {
                warn!(resource_id = task.resource_id, error = %e, "加载资源失败");
                return;
            }
        };

        let next = StateMachine::on_execution(&resource.lifecycle(), event, task.dry_run);
        if next == resource.lifecycle() {
            return;
        }
        resource.set_lifecycle(next);
        if let Err(e) = self.ports.resources.save(&resource).await {
            warn!(resource_id = task.resource_id, error = %e, "保存资源状态失败");
            return;
        }

        let event = ResourceEvent::for_action(
            resource.id,
            resource.kind,
            task.action,
            &task.actor_id,
            resource.state,
            resource.status,
        );
        if let Err(e) = self.ports.events.publish(&event).await {
            warn!(resource_id = task.resource_id, error = %e, "发布资源事件失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(retries: i64, max_retries: i64) -> EnvelopeMetadata {
        EnvelopeMetadata {
            retries,
            max_retries,
            delay_ms: 0,
        }
    }

    #[test]
    fn test_classification() {
        let not_ready = PipelineError::ParentIsNotReady(vec![1]);
        assert_eq!(ExceptionClassifier::classify(&not_ready, &metadata(0, 3)), FailureClass::Retry);
        assert_eq!(ExceptionClassifier::classify(&not_ready, &metadata(1, 3)), FailureClass::Retry);
        assert_eq!(ExceptionClassifier::classify(&not_ready, &metadata(2, 3)), FailureClass::TimedOut);

        let children = PipelineError::ChildrenIsNotReady(vec![2]);
        assert_eq!(ExceptionClassifier::classify(&children, &metadata(0, 1)), FailureClass::TimedOut);

        assert_eq!(
            ExceptionClassifier::classify(&PipelineError::CannotProceed("quota".into()), &metadata(0, 3)),
            FailureClass::FatalExplicit
        );
        assert_eq!(
            ExceptionClassifier::classify(&PipelineError::ExitWithoutSave("noop".into()), &metadata(0, 3)),
            FailureClass::FatalExplicit
        );
        assert_eq!(
            ExceptionClassifier::classify(&PipelineError::unexpected("KeyError", "vpc_id"), &metadata(0, 3)),
            FailureClass::FatalUnexpected
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(1_000, 5_000);
        for _ in 0..20 {
            let first = policy.delay_for(0);
            assert!((900..=1_100).contains(&first), "first delay {first}");
            let second = policy.delay_for(1);
            assert!((1_800..=2_200).contains(&second), "second delay {second}");
            assert!(policy.delay_for(10) <= 5_000);
        }
    }
}
