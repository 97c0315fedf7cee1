//! 外部协作者抽象
//!
//! 持久化、授权、审计、通知均通过这些接口注入

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_errors::OrchestratorResult;
use uuid::Uuid;

use crate::entities::{
    Capability, PendingEdit, Resource, ResourceId, ResourceStatus, TaskRecord, TaskRecordStatus,
    WorkerRegistration,
};
use crate::events::{Notification, ResourceEvent};

/// 资源仓储。并发写入的隔离由实现方负责
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn get(&self, id: ResourceId) -> OrchestratorResult<Option<Resource>>;
    /// 只返回存在的资源，顺序与输入一致
    async fn get_many(&self, ids: &[ResourceId]) -> OrchestratorResult<Vec<Resource>>;
    async fn save(&self, resource: &Resource) -> OrchestratorResult<()>;
    async fn delete(&self, id: ResourceId) -> OrchestratorResult<bool>;
    /// 把 id 列为父资源的其他资源
    async fn find_dependents(&self, id: ResourceId) -> OrchestratorResult<Vec<ResourceId>>;
    async fn find_by_status(&self, status: ResourceStatus) -> OrchestratorResult<Vec<Resource>>;
    async fn next_id(&self) -> OrchestratorResult<ResourceId>;
}

/// 待审批修改存储，每个资源至多一条
#[async_trait]
pub trait PendingEditStore: Send + Sync {
    /// 返回被替换掉的旧修改
    async fn put(&self, edit: PendingEdit) -> OrchestratorResult<Option<PendingEdit>>;
    async fn get(&self, resource_id: ResourceId) -> OrchestratorResult<Option<PendingEdit>>;
    async fn remove(&self, resource_id: ResourceId) -> OrchestratorResult<Option<PendingEdit>>;
}

#[async_trait]
pub trait PolicyGate: Send + Sync {
    async fn check(&self, subject_id: &str, object_id: ResourceId, capability: Capability) -> OrchestratorResult<bool>;
}

#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn record(&self, entity_id: ResourceId, actor_id: &str, action: &str) -> OrchestratorResult<()>;
}

#[async_trait]
pub trait RevisionStore: Send + Sync {
    async fn snapshot(&self, resource: &Resource) -> OrchestratorResult<()>;
    /// 返回删除的修订数
    async fn purge(&self, resource_id: ResourceId) -> OrchestratorResult<usize>;
}

#[async_trait]
pub trait TaskLedger: Send + Sync {
    async fn record(&self, record: TaskRecord) -> OrchestratorResult<()>;
    async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskRecordStatus,
        detail: Option<String>,
    ) -> OrchestratorResult<()>;
    async fn latest_for(&self, resource_id: ResourceId) -> OrchestratorResult<Option<TaskRecord>>;
    async fn purge(&self, resource_id: ResourceId) -> OrchestratorResult<usize>;
}

/// 执行日志，按资源缓冲，flush 后持久化
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn append(&self, resource_id: ResourceId, line: &str) -> OrchestratorResult<()>;
    async fn flush(&self, resource_id: ResourceId) -> OrchestratorResult<()>;
    async fn purge(&self, resource_id: ResourceId) -> OrchestratorResult<usize>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ResourceEvent) -> OrchestratorResult<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> OrchestratorResult<()>;
}

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register(&self, registration: &WorkerRegistration) -> OrchestratorResult<()>;
    async fn set_busy(&self, name: &str, busy: bool, at: DateTime<Utc>) -> OrchestratorResult<()>;
    /// 只刷新 last_seen；worker 未注册时返回 false
    async fn touch(&self, name: &str, at: DateTime<Utc>) -> OrchestratorResult<bool>;
    async fn get(&self, name: &str) -> OrchestratorResult<Option<WorkerRegistration>>;
    async fn list(&self) -> OrchestratorResult<Vec<WorkerRegistration>>;
}
