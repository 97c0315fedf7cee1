//! 内存存储实现
//!
//! 单进程部署与测试使用的仓储、暂存、审计、修订、任务账本、执行日志与 worker 注册表

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_domain::{
    AuditTrail, ExecutionLog, OrchestratorError, OrchestratorResult, PendingEdit,
    PendingEditStore, Resource, ResourceId, ResourceRepository, ResourceStatus, RevisionStore,
    TaskLedger, TaskRecord, TaskRecordStatus, WorkerRegistration, WorkerRegistry,
};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryResourceRepository {
    resources: RwLock<BTreeMap<ResourceId, Resource>>,
    sequence: AtomicI64,
}

impl InMemoryResourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入（测试准备数据用），同时推进 id 序列
    pub async fn insert(&self, resource: Resource) {
        self.sequence.fetch_max(resource.id, Ordering::SeqCst);
        self.resources.write().await.insert(resource.id, resource);
    }

    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }
}

#[async_trait]
impl ResourceRepository for InMemoryResourceRepository {
    async fn get(&self, id: ResourceId) -> OrchestratorResult<Option<Resource>> {
        Ok(self.resources.read().await.get(&id).cloned())
    }

    async fn get_many(&self, ids: &[ResourceId]) -> OrchestratorResult<Vec<Resource>> {
        let resources = self.resources.read().await;
        Ok(ids.iter().filter_map(|id| resources.get(id).cloned()).collect())
    }

    async fn save(&self, resource: &Resource) -> OrchestratorResult<()> {
        self.sequence.fetch_max(resource.id, Ordering::SeqCst);
        self.resources
            .write()
            .await
            .insert(resource.id, resource.clone());
        Ok(())
    }

    async fn delete(&self, id: ResourceId) -> OrchestratorResult<bool> {
        Ok(self.resources.write().await.remove(&id).is_some())
    }

    async fn find_dependents(&self, id: ResourceId) -> OrchestratorResult<Vec<ResourceId>> {
        Ok(self
            .resources
            .read()
            .await
            .values()
            .filter(|r| r.parents.contains(&id))
            .map(|r| r.id)
            .collect())
    }

    async fn find_by_status(&self, status: ResourceStatus) -> OrchestratorResult<Vec<Resource>> {
        Ok(self
            .resources
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn next_id(&self) -> OrchestratorResult<ResourceId> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[derive(Default)]
pub struct InMemoryPendingEditStore {
    edits: RwLock<HashMap<ResourceId, PendingEdit>>,
}

impl InMemoryPendingEditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingEditStore for InMemoryPendingEditStore {
    async fn put(&self, edit: PendingEdit) -> OrchestratorResult<Option<PendingEdit>> {
        Ok(self.edits.write().await.insert(edit.resource_id, edit))
    }

    async fn get(&self, resource_id: ResourceId) -> OrchestratorResult<Option<PendingEdit>> {
        Ok(self.edits.read().await.get(&resource_id).cloned())
    }

    async fn remove(&self, resource_id: ResourceId) -> OrchestratorResult<Option<PendingEdit>> {
        Ok(self.edits.write().await.remove(&resource_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub entity_id: ResourceId,
    pub actor_id: String,
    pub action: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryAuditTrail {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn entries_for(&self, entity_id: ResourceId) -> Vec<AuditEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditTrail for InMemoryAuditTrail {
    async fn record(&self, entity_id: ResourceId, actor_id: &str, action: &str) -> OrchestratorResult<()> {
        debug!(entity_id, actor_id, action, "写入审计");
        self.entries.write().await.push(AuditEntry {
            entity_id,
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRevisionStore {
    revisions: RwLock<HashMap<ResourceId, Vec<Resource>>>,
}

impl InMemoryRevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn revisions(&self, resource_id: ResourceId) -> Vec<Resource> {
        self.revisions
            .read()
            .await
            .get(&resource_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RevisionStore for InMemoryRevisionStore {
    async fn snapshot(&self, resource: &Resource) -> OrchestratorResult<()> {
        self.revisions
            .write()
            .await
            .entry(resource.id)
            .or_default()
            .push(resource.clone());
        Ok(())
    }

    async fn purge(&self, resource_id: ResourceId) -> OrchestratorResult<usize> {
        Ok(self
            .revisions
            .write()
            .await
            .remove(&resource_id)
            .map(|r| r.len())
            .unwrap_or(0))
    }
}

#[derive(Default)]
pub struct InMemoryTaskLedger {
    records: RwLock<Vec<TaskRecord>>,
}

impl InMemoryTaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records_for(&self, resource_id: ResourceId) -> Vec<TaskRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.resource_id == resource_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskLedger for InMemoryTaskLedger {
    async fn record(&self, record: TaskRecord) -> OrchestratorResult<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskRecordStatus,
        detail: Option<String>,
    ) -> OrchestratorResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.task_id == task_id)
            .ok_or_else(|| OrchestratorError::entity_not_found("任务记录", task_id.to_string()))?;
        record.status = status;
        record.detail = detail;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn latest_for(&self, resource_id: ResourceId) -> OrchestratorResult<Option<TaskRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.resource_id == resource_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn purge(&self, resource_id: ResourceId) -> OrchestratorResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.resource_id != resource_id);
        Ok(before - records.len())
    }
}

/// 执行日志：append 写入缓冲区，flush 后移入持久区
#[derive(Default)]
pub struct InMemoryExecutionLog {
    buffered: RwLock<HashMap<ResourceId, Vec<String>>>,
    flushed: RwLock<HashMap<ResourceId, Vec<String>>>,
}

impl InMemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn flushed_lines(&self, resource_id: ResourceId) -> Vec<String> {
        self.flushed
            .read()
            .await
            .get(&resource_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionLog for InMemoryExecutionLog {
    async fn append(&self, resource_id: ResourceId, line: &str) -> OrchestratorResult<()> {
        self.buffered
            .write()
            .await
            .entry(resource_id)
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn flush(&self, resource_id: ResourceId) -> OrchestratorResult<()> {
        let lines = self
            .buffered
            .write()
            .await
            .remove(&resource_id)
            .unwrap_or_default();
        if !lines.is_empty() {
            self.flushed
                .write()
                .await
                .entry(resource_id)
                .or_default()
                .extend(lines);
        }
        Ok(())
    }

    async fn purge(&self, resource_id: ResourceId) -> OrchestratorResult<usize> {
        let buffered = self
            .buffered
            .write()
            .await
            .remove(&resource_id)
            .map(|l| l.len())
            .unwrap_or(0);
        let flushed = self
            .flushed
            .write()
            .await
            .remove(&resource_id)
            .map(|l| l.len())
            .unwrap_or(0);
        Ok(buffered + flushed)
    }
}

#[derive(Default)]
pub struct InMemoryWorkerRegistry {
    workers: RwLock<HashMap<String, WorkerRegistration>>,
}

impl InMemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn register(&self, registration: &WorkerRegistration) -> OrchestratorResult<()> {
        let mut workers = self.workers.write().await;
        let mut registration = registration.clone();
        if let Some(existing) = workers.get(&registration.name) {
            registration.registered_at = existing.registered_at;
            registration.busy = existing.busy;
        }
        workers.insert(registration.name.clone(), registration);
        Ok(())
    }

    async fn set_busy(&self, name: &str, busy: bool, at: DateTime<Utc>) -> OrchestratorResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::entity_not_found("Worker", name))?;
        worker.busy = busy;
        worker.last_seen = at;
        Ok(())
    }

    async fn touch(&self, name: &str, at: DateTime<Utc>) -> OrchestratorResult<bool> {
        let mut workers = self.workers.write().await;
        let Some(worker) = workers.get_mut(name) else {
            return Ok(false);
        };
        worker.last_seen = at;
        Ok(true)
    }

    async fn get(&self, name: &str) -> OrchestratorResult<Option<WorkerRegistration>> {
        Ok(self.workers.read().await.get(name).cloned())
    }

    async fn list(&self) -> OrchestratorResult<Vec<WorkerRegistration>> {
        Ok(self.workers.read().await.values().cloned().collect())
    }
}

/// 一组共享的内存存储
#[derive(Clone, Default)]
pub struct MemoryStores {
    pub resources: Arc<InMemoryResourceRepository>,
    pub pending_edits: Arc<InMemoryPendingEditStore>,
    pub audit: Arc<InMemoryAuditTrail>,
    pub revisions: Arc<InMemoryRevisionStore>,
    pub ledger: Arc<InMemoryTaskLedger>,
    pub execution_log: Arc<InMemoryExecutionLog>,
    pub workers: Arc<InMemoryWorkerRegistry>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::ResourceKind;

    #[tokio::test]
    async fn test_repository_ids_and_dependents() {
        let repo = InMemoryResourceRepository::new();
        let parent = Resource::new(repo.next_id().await.unwrap(), "acct", ResourceKind::Account, "u", false);
        let mut child = Resource::new(repo.next_id().await.unwrap(), "net", ResourceKind::Network, "u", false);
        child.parents = vec![parent.id];
        repo.save(&parent).await.unwrap();
        repo.save(&child).await.unwrap();

        assert_eq!(parent.id, 1);
        assert_eq!(child.id, 2);
        assert_eq!(repo.find_dependents(parent.id).await.unwrap(), vec![child.id]);
        assert_eq!(repo.get_many(&[2, 99, 1]).await.unwrap().len(), 2);

        repo.insert(Resource::new(10, "c", ResourceKind::Cluster, "u", false)).await;
        assert_eq!(repo.next_id().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_pending_edit_replaces() {
        let store = InMemoryPendingEditStore::new();
        let first = PendingEdit::new(1, serde_json::Map::new(), "alice");
        let second = PendingEdit::new(1, serde_json::Map::new(), "bob");
        assert!(store.put(first).await.unwrap().is_none());
        let replaced = store.put(second).await.unwrap().unwrap();
        assert_eq!(replaced.author_id, "alice");
        assert_eq!(store.get(1).await.unwrap().unwrap().author_id, "bob");
        assert!(store.remove(1).await.unwrap().is_some());
        assert!(store.remove(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execution_log_flush_and_purge() {
        let log = InMemoryExecutionLog::new();
        log.append(5, "terraform init").await.unwrap();
        log.append(5, "terraform apply").await.unwrap();
        assert!(log.flushed_lines(5).await.is_empty());

        log.flush(5).await.unwrap();
        assert_eq!(log.flushed_lines(5).await.len(), 2);
        assert_eq!(log.purge(5).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_worker_registry_keeps_registration_time() {
        let registry = InMemoryWorkerRegistry::new();
        let first = WorkerRegistration::new("w1", "host");
        registry.register(&first).await.unwrap();
        registry.set_busy("w1", true, Utc::now()).await.unwrap();

        let mut again = WorkerRegistration::new("w1", "host");
        again.registered_at = first.registered_at + chrono::Duration::seconds(60);
        registry.register(&again).await.unwrap();

        let stored = registry.get("w1").await.unwrap().unwrap();
        assert_eq!(stored.registered_at, first.registered_at);
        assert!(stored.busy);
        assert!(registry.set_busy("ghost", true, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_touch_only_moves_last_seen() {
        let registry = InMemoryWorkerRegistry::new();
        assert!(!registry.touch("w2", Utc::now()).await.unwrap());

        registry.register(&WorkerRegistration::new("w2", "host")).await.unwrap();
        registry.set_busy("w2", true, Utc::now()).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(30);
        assert!(registry.touch("w2", later).await.unwrap());

        let stored = registry.get("w2").await.unwrap().unwrap();
        assert!(stored.busy);
        assert_eq!(stored.last_seen, later);
    }
}
