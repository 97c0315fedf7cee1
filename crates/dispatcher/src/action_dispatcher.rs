use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use orchestrator_domain::{
    Action, ApprovalFlowSwitch, AuditTrail, Capability, EventPublisher, ExecutionEvent,
    ExecutionLog, MessageBroker, OrchestratorError, OrchestratorResult, PendingEditStore,
    PolicyGate, Resource, ResourceEvent, ResourceId, ResourceKind, ResourceRepository,
    ResourceState, ResourceStatus, ResourceTask, ResourceView, RevisionStore, StateMachine,
    TaskEnvelope, TaskLedger, TaskMode, TaskRecordStatus, TransitionContext, Variable,
    DEFAULT_MAX_RETRIES,
};

use crate::approval_staging::ApprovalStaging;
use crate::dependency_gate::{DependencyGate, DEFAULT_ACCEPTABLE};

/// 派发器依赖的外部协作者
#[derive(Clone)]
pub struct DispatcherPorts {
    pub resources: Arc<dyn ResourceRepository>,
    pub pending_edits: Arc<dyn PendingEditStore>,
    pub policy: Arc<dyn PolicyGate>,
    pub audit: Arc<dyn AuditTrail>,
    pub revisions: Arc<dyn RevisionStore>,
    pub ledger: Arc<dyn TaskLedger>,
    pub execution_log: Arc<dyn ExecutionLog>,
    pub broker: Arc<dyn MessageBroker>,
    pub events: Arc<dyn EventPublisher>,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub task_exchange: String,
    pub max_retries: i64,
    pub reset_cooldown: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            task_exchange: "tasks".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            reset_cooldown: Duration::minutes(10),
        }
    }
}

/// 创建资源的请求
#[derive(Debug, Clone, Deserialize)]
pub struct NewResource {
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parents: Vec<ResourceId>,
    #[serde(default)]
    pub children: Vec<ResourceId>,
    #[serde(rename = "abstract", default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependency_tags: Vec<String>,
    #[serde(default)]
    pub configuration: Map<String, Value>,
}

impl NewResource {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            parents: Vec::new(),
            children: Vec::new(),
            is_abstract: false,
            variables: Vec::new(),
            labels: Vec::new(),
            dependency_tags: Vec::new(),
            configuration: Map::new(),
        }
    }
}

/// 动作派发：加载、授权、状态机守卫、依赖检查、持久化与审计、派发任务、发布事件
pub struct ActionDispatcher {
    ports: DispatcherPorts,
    staging: ApprovalStaging,
    gate: DependencyGate,
    approval: ApprovalFlowSwitch,
    settings: DispatcherSettings,
}

impl ActionDispatcher {
    pub fn new(ports: DispatcherPorts, approval: ApprovalFlowSwitch, settings: DispatcherSettings) -> Self {
        Self {
            staging: ApprovalStaging::new(ports.pending_edits.clone()),
            gate: DependencyGate::new(ports.resources.clone()),
            ports,
            approval,
            settings,
        }
    }

    pub fn staging(&self) -> &ApprovalStaging {
        &self.staging
    }

    pub fn approval_switch(&self) -> &ApprovalFlowSwitch {
        &self.approval
    }

    pub async fn apply(&self, id: ResourceId, action: Action, actor_id: &str) -> OrchestratorResult<ResourceView> {
        match self.try_apply(id, action, actor_id).await {
            Ok(view) => {
                counter!("orchestrator_actions_applied_total", "action" => action.as_str()).increment(1);
                Ok(view)
            }
            Err(e) => {
                counter!("orchestrator_actions_rejected_total", "action" => action.as_str()).increment(1);
                self.audit_failure(id, actor_id, action.as_str(), &e).await;
                Err(e)
            }
        }
    }

    /// 调用方当前可执行的动作；无权限时返回空列表而不是错误
    pub async fn get_actions(&self, id: ResourceId, actor_id: &str) -> OrchestratorResult<Vec<Action>> {
        let resource = self.load(id).await?;
        let Some(level) = self.capability_of(actor_id, id).await? else {
            debug!(resource_id = id, actor_id, "调用方对资源没有任何权限");
            return Ok(Vec::new());
        };

        Ok(StateMachine::legal_actions(id, &resource.lifecycle(), &self.context())
            .into_iter()
            .filter(|action| action.required_capability() <= level)
            .collect())
    }

    /// 修改资源。未 provision 或已销毁的资源直接修改；已 provision 的资源在审批开启时暂存，
    /// 销毁进行中的资源不允许修改
    pub async fn update(
        &self,
        id: ResourceId,
        diff: Map<String, Value>,
        actor_id: &str,
    ) -> OrchestratorResult<ResourceView> {
        let result = self.try_update(id, diff, actor_id).await;
        if let Err(e) = &result {
            self.audit_failure(id, actor_id, "update", e).await;
        }
        result
    }

    pub async fn create(&self, request: NewResource, actor_id: &str) -> OrchestratorResult<ResourceView> {
        let id = self.ports.resources.next_id().await?;
        let result = self.try_create(id, request, actor_id).await;
        if let Err(e) = &result {
            self.audit_failure(id, actor_id, "create", e).await;
        }
        result
    }

    async fn try_apply(&self, id: ResourceId, action: Action, actor_id: &str) -> OrchestratorResult<ResourceView> {
        let mut resource = self.load(id).await?;
        self.authorize(actor_id, id, action.required_capability(), action.as_str())
            .await?;

        let current = resource.lifecycle();
        let transition = StateMachine::apply(id, &current, action, &self.context())?;

        if DependencyGate::applies_to(action, &current, &transition.next) {
            self.gate.check_parents(&resource, DEFAULT_ACCEPTABLE).await?;
        }

        if transition.remove {
            self.gate.check_delete(&resource).await?;
            return self.remove(resource, actor_id).await;
        }

        if transition.idempotent_replay {
            debug!(resource_id = id, action = %action, "动作已生效，无需处理");
            let pending = self.staging.has_pending(id).await?;
            return Ok(resource.view(pending));
        }

        resource.set_lifecycle(transition.next);

        let merged_edit = match action {
            Action::Approve => self.staging.get(id).await?,
            // destroy 的审批不能顺带合并与之无关的修改
            Action::Reject | Action::Destroy => {
                if self.staging.clear(id).await?.is_some() {
                    info!(resource_id = id, action = %action, "丢弃已暂存的修改");
                }
                None
            }
            _ => None,
        };
        if let Some(edit) = &merged_edit {
            resource.apply_diff(&edit.diff)?;
        }

        let mut task = transition.task;
        if resource.is_abstract {
            if let Some(mode) = task.take() {
                let done = StateMachine::on_execution(
                    &resource.lifecycle(),
                    ExecutionEvent::Succeeded,
                    mode == TaskMode::DryRun,
                );
                resource.set_lifecycle(done);
                debug!(resource_id = id, "抽象资源在进程内完成");
            }
        }

        self.ports.resources.save(&resource).await?;
        self.record_audit(id, actor_id, action.as_str()).await;

        if let Some(edit) = merged_edit {
            self.snapshot(&resource).await;
            self.record_audit(id, &edit.author_id, "update").await;
            self.staging.clear(id).await?;
            info!(resource_id = id, author = %edit.author_id, "审批通过，合并暂存修改");
        }

        info!(
            resource_id = id,
            action = %action,
            actor_id,
            state = %resource.state,
            status = %resource.status,
            "动作执行成功"
        );

        if let Some(mode) = task {
            self.emit_task(&resource, action, actor_id, mode).await;
        }
        self.publish_event(&resource, action.as_str(), actor_id).await;

        let pending = self.staging.has_pending(id).await?;
        Ok(resource.view(pending))
    }

    async fn try_update(
        &self,
        id: ResourceId,
        diff: Map<String, Value>,
        actor_id: &str,
    ) -> OrchestratorResult<ResourceView> {
        let mut resource = self.load(id).await?;
        self.authorize(actor_id, id, Capability::Write, "update").await?;
        Resource::validate_diff(&diff)?;

        if resource.status.is_in_flight() || resource.state == ResourceState::Destroy {
            return Err(OrchestratorError::wrong_state(
                id,
                "update",
                resource.state,
                resource.status,
            ));
        }

        // 暂存前先在副本上试合并，格式错误的值在提交时就拒绝
        let mut patched = resource.clone();
        patched.apply_diff(&diff)?;

        let direct = matches!(resource.state, ResourceState::Provision | ResourceState::Destroyed)
            || !self.approval.is_enabled();
        if direct {
            resource = patched;
            if resource.state == ResourceState::Provisioned {
                resource.status = ResourceStatus::Ready;
            }
            if self.staging.clear(id).await?.is_some() {
                info!(resource_id = id, "直接修改覆盖了暂存修改");
            }
            self.ports.resources.save(&resource).await?;
            self.snapshot(&resource).await;
            self.record_audit(id, actor_id, "update").await;
            self.publish_event(&resource, "update", actor_id).await;
            return Ok(resource.view(false));
        }

        self.staging.set(id, diff, actor_id).await?;
        resource.status = ResourceStatus::ApprovalPending;
        resource.updated_at = Utc::now();
        self.ports.resources.save(&resource).await?;
        self.record_audit(id, actor_id, "stage_edit").await;
        self.publish_event(&resource, "stage_edit", actor_id).await;

        info!(resource_id = id, actor_id, "修改已暂存，等待审批");
        Ok(resource.view(true))
    }

    async fn try_create(
        &self,
        id: ResourceId,
        request: NewResource,
        actor_id: &str,
    ) -> OrchestratorResult<ResourceView> {
        self.authorize(actor_id, id, Capability::Write, "create").await?;
        if request.name.trim().is_empty() {
            return Err(OrchestratorError::invalid_input("资源名称不能为空"));
        }
        self.gate
            .validate_links(id, &request.parents, &request.children)
            .await?;

        let mut resource = Resource::new(
            id,
            request.name,
            request.kind,
            actor_id,
            self.approval.is_enabled(),
        );
        resource.description = request.description;
        resource.parents = request.parents;
        resource.children = request.children;
        resource.is_abstract = request.is_abstract;
        resource.variables = request.variables;
        resource.labels = request.labels;
        resource.dependency_tags = request.dependency_tags;
        resource.configuration = request.configuration;

        self.ports.resources.save(&resource).await?;

        for mut parent in self.ports.resources.get_many(&resource.parents).await? {
            parent.add_child(id);
            self.ports.resources.save(&parent).await?;
        }
        for mut child in self.ports.resources.get_many(&resource.children).await? {
            if !child.parents.contains(&id) {
                child.parents.push(id);
                self.ports.resources.save(&child).await?;
            }
        }

        self.snapshot(&resource).await;
        self.record_audit(id, actor_id, "create").await;
        self.publish_event(&resource, "create", actor_id).await;

        info!(resource_id = id, kind = %resource.kind, actor_id, "资源已创建");
        Ok(resource.view(false))
    }

    /// 永久删除并清理暂存修改、修订、日志和任务记录
    async fn remove(&self, resource: Resource, actor_id: &str) -> OrchestratorResult<ResourceView> {
        let id = resource.id;

        self.ports.resources.delete(id).await?;
        for mut parent in self.ports.resources.get_many(&resource.parents).await? {
            parent.remove_child(id);
            self.ports.resources.save(&parent).await?;
        }

        self.staging.clear(id).await?;
        match self.ports.revisions.purge(id).await {
            Ok(count) => debug!(resource_id = id, count, "已清理修订"),
            Err(e) => warn!(resource_id = id, error = %e, "清理修订失败"),
        }
        match self.ports.execution_log.purge(id).await {
            Ok(count) => debug!(resource_id = id, count, "已清理执行日志"),
            Err(e) => warn!(resource_id = id, error = %e, "清理执行日志失败"),
        }
        match self.ports.ledger.purge(id).await {
            Ok(count) => debug!(resource_id = id, count, "已清理任务记录"),
            Err(e) => warn!(resource_id = id, error = %e, "清理任务记录失败"),
        }

        self.record_audit(id, actor_id, Action::Delete.as_str()).await;
        self.publish_event(&resource, Action::Delete.as_str(), actor_id).await;

        info!(resource_id = id, actor_id, "资源已删除");
        Ok(resource.view(false))
    }

    /// broker 不可用时不回滚已持久化的状态，由对账任务补发
    async fn emit_task(&self, resource: &Resource, action: Action, actor_id: &str, mode: TaskMode) {
        let task = ResourceTask::new(resource, action, actor_id, mode == TaskMode::DryRun);
        let envelope = match TaskEnvelope::for_task(&task, &self.settings.task_exchange, self.settings.max_retries) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(resource_id = resource.id, error = %e, "构建任务消息失败");
                return;
            }
        };

        if let Err(e) = self.ports.ledger.record(task.record(TaskRecordStatus::Dispatched)).await {
            warn!(task_id = %task.task_id, error = %e, "记录派发任务失败");
        }

        match self.ports.broker.publish(&envelope).await {
            Ok(()) => {
                counter!("orchestrator_envelopes_published_total").increment(1);
                info!(
                    task_id = %task.task_id,
                    resource_id = resource.id,
                    routing_key = %envelope.routing_key,
                    dry_run = task.dry_run,
                    "任务已派发"
                );
            }
            Err(e) => {
                warn!(
                    task_id = %task.task_id,
                    resource_id = resource.id,
                    error = %e,
                    "消息代理不可用，任务留待对账补发"
                );
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

    async fn publish_event(&self, resource: &Resource, action: &str, actor_id: &str) {
        let event = ResourceEvent::new(
            resource.id,
            resource.kind,
            action,
            actor_id,
            resource.state,
            resource.status,
        );
        if let Err(e) = self.ports.events.publish(&event).await {
            warn!(resource_id = resource.id, error = %e, "发布资源事件失败");
        }
    }

    async fn snapshot(&self, resource: &Resource) {
        if let Err(e) = self.ports.revisions.snapshot(resource).await {
            warn!(resource_id = resource.id, error = %e, "保存修订快照失败");
        }
    }

    async fn record_audit(&self, id: ResourceId, actor_id: &str, action: &str) {
        if let Err(e) = self.ports.audit.record(id, actor_id, action).await {
            warn!(resource_id = id, actor_id, action, error = %e, "写入审计记录失败");
        }
    }

    async fn audit_failure(&self, id: ResourceId, actor_id: &str, action: &str, err: &OrchestratorError) {
        warn!(resource_id = id, actor_id, action, error = %err, "动作被拒绝");
        self.record_audit(id, actor_id, &format!("{action}_failed")).await;
    }

    async fn load(&self, id: ResourceId) -> OrchestratorResult<Resource> {
        self.ports
            .resources
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::resource_not_found(id))
    }

    async fn authorize(
        &self,
        actor_id: &str,
        id: ResourceId,
        capability: Capability,
        action: &str,
    ) -> OrchestratorResult<()> {
        if actor_id.is_empty() {
            return Err(OrchestratorError::AccessUnauthorized);
        }
        if self.ports.policy.check(actor_id, id, capability).await? {
            Ok(())
        } else {
            Err(OrchestratorError::access_denied(actor_id, id, action))
        }
    }

    async fn capability_of(&self, actor_id: &str, id: ResourceId) -> OrchestratorResult<Option<Capability>> {
        for capability in [Capability::Admin, Capability::Write] {
            if self.ports.policy.check(actor_id, id, capability).await? {
                return Ok(Some(capability));
            }
        }
        Ok(None)
    }

    fn context(&self) -> TransitionContext {
        TransitionContext::new(self.approval.is_enabled(), self.settings.reset_cooldown)
    }
}
