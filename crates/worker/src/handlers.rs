use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_domain::{
    AuditTrail, EventPublisher, ExecutionLog, MessageType, Notifier, OrchestratorError,
    ResourceRepository, TaskEnvelope, TaskLedger,
};
use thiserror::Error;

/// 单条消息处理的终止结果，由消费循环决定 ack/nack
#[derive(Debug, Error)]
pub enum TaskFailure {
    /// 已发布 retries+1 的副本，原消息应当确认
    #[error("任务已重新调度 (retries={retries}, delay={delay_ms}ms)")]
    Retried { retries: i64, delay_ms: i64 },

    /// 终止失败，已通知用户并标记资源错误
    #[error("任务失败: {message}")]
    Fatal { message: String, timed_out: bool },

    #[error("消息无法处理: {0}")]
    Rejected(#[from] OrchestratorError),
}

impl TaskFailure {
    pub fn is_retried(&self) -> bool {
        matches!(self, TaskFailure::Retried { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, TaskFailure::Fatal { timed_out: true, .. })
    }

    pub fn outcome_label(&self) -> &'static str {
        match self {
            TaskFailure::Retried { .. } => "retried",
            TaskFailure::Fatal { .. } => "failed",
            TaskFailure::Rejected(_) => "rejected",
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn message_type(&self) -> MessageType;

    async fn handle(&self, envelope: &TaskEnvelope) -> Result<(), TaskFailure>;
}

/// 按 `_message_type` 分发的处理器表
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.register(handler);
        self
    }

    /// 同一消息类型后注册的覆盖先注册的
    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(handler.message_type(), handler);
    }

    pub fn get(&self, message_type: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&message_type).cloned()
    }

    pub fn message_types(&self) -> Vec<MessageType> {
        self.handlers.keys().copied().collect()
    }
}

/// worker 侧处理器共用的协作者
#[derive(Clone)]
pub struct WorkerPorts {
    pub resources: Arc<dyn ResourceRepository>,
    pub ledger: Arc<dyn TaskLedger>,
    pub execution_log: Arc<dyn ExecutionLog>,
    pub audit: Arc<dyn AuditTrail>,
    pub notifier: Arc<dyn Notifier>,
    pub events: Arc<dyn EventPublisher>,
}
