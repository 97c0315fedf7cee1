use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use orchestrator_domain::{
    OrchestratorResult, PendingEdit, PendingEditStore, Resource, ResourceId,
};

/// 待审批修改的暂存区。每个资源至多一条，新的修改直接覆盖旧的
pub struct ApprovalStaging {
    store: Arc<dyn PendingEditStore>,
}

impl ApprovalStaging {
    pub fn new(store: Arc<dyn PendingEditStore>) -> Self {
        Self { store }
    }

    /// 返回被覆盖的旧修改（不做合并）
    pub async fn set(
        &self,
        resource_id: ResourceId,
        diff: Map<String, Value>,
        author_id: &str,
    ) -> OrchestratorResult<Option<PendingEdit>> {
        Resource::validate_diff(&diff)?;
        let replaced = self
            .store
            .put(PendingEdit::new(resource_id, diff, author_id))
            .await?;
        if let Some(previous) = &replaced {
            debug!(
                resource_id,
                previous_author = %previous.author_id,
                "替换已暂存的修改"
            );
        }
        Ok(replaced)
    }

    pub async fn get(&self, resource_id: ResourceId) -> OrchestratorResult<Option<PendingEdit>> {
        self.store.get(resource_id).await
    }

    pub async fn has_pending(&self, resource_id: ResourceId) -> OrchestratorResult<bool> {
        Ok(self.store.get(resource_id).await?.is_some())
    }

    /// 幂等删除
    pub async fn clear(&self, resource_id: ResourceId) -> OrchestratorResult<Option<PendingEdit>> {
        self.store.remove(resource_id).await
    }
}
