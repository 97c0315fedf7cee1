use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::state_machine::{Action, Lifecycle};

pub type ResourceId = i64;

/// 生命周期阶段（目标基础设施状态）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    Provision,
    Provisioned,
    Destroy,
    Destroyed,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Provision => "PROVISION",
            ResourceState::Provisioned => "PROVISIONED",
            ResourceState::Destroy => "DESTROY",
            ResourceState::Destroyed => "DESTROYED",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 执行阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Queued,
    InProgress,
    Ready,
    Done,
    Error,
    ApprovalPending,
    Pending,
    Rejected,
    Unknown,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Queued => "QUEUED",
            ResourceStatus::InProgress => "IN_PROGRESS",
            ResourceStatus::Ready => "READY",
            ResourceStatus::Done => "DONE",
            ResourceStatus::Error => "ERROR",
            ResourceStatus::ApprovalPending => "APPROVAL_PENDING",
            ResourceStatus::Pending => "PENDING",
            ResourceStatus::Rejected => "REJECTED",
            ResourceStatus::Unknown => "UNKNOWN",
        }
    }

    /// 已派发给 worker、尚未结束
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ResourceStatus::Queued | ResourceStatus::InProgress)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Account,
    Network,
    Cluster,
    Namespace,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Account => "account",
            ResourceKind::Network => "network",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Namespace => "namespace",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variable {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub sensitive: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }
}

/// 可被编辑（直接修改或暂存审批）的字段，均按整字段覆盖
pub const MUTABLE_FIELDS: &[&str] = &[
    "name",
    "description",
    "variables",
    "labels",
    "dependency_tags",
    "configuration",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub description: Option<String>,
    pub state: ResourceState,
    pub status: ResourceStatus,
    /// destroy 之前所处的阶段，reject/recreate 时用于回退
    #[serde(default)]
    pub previous_state: Option<ResourceState>,
    /// 执行过真实任务且尚未销毁
    #[serde(default)]
    pub live_infrastructure: bool,
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
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// 新资源处于 PROVISION，审批流程开启时等待审批
    pub fn new(
        id: ResourceId,
        name: impl Into<String>,
        kind: ResourceKind,
        created_by: impl Into<String>,
        approval_flow_enabled: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            kind,
            description: None,
            state: ResourceState::Provision,
            status: if approval_flow_enabled {
                ResourceStatus::ApprovalPending
            } else {
                ResourceStatus::Ready
            },
            previous_state: None,
            live_infrastructure: false,
            parents: Vec::new(),
            children: Vec::new(),
            is_abstract: false,
            variables: Vec::new(),
            labels: Vec::new(),
            dependency_tags: Vec::new(),
            configuration: Map::new(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle {
            state: self.state,
            status: self.status,
            previous_state: self.previous_state,
            live_infrastructure: self.live_infrastructure,
            updated_at: self.updated_at,
        }
    }

    pub fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.state = lifecycle.state;
        self.status = lifecycle.status;
        self.previous_state = lifecycle.previous_state;
        self.live_infrastructure = lifecycle.live_infrastructure;
        self.updated_at = Utc::now();
    }

    pub fn add_child(&mut self, child: ResourceId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    pub fn remove_child(&mut self, child: ResourceId) {
        self.children.retain(|c| *c != child);
    }

    /// 校验 diff 只包含可编辑字段
    pub fn validate_diff(diff: &Map<String, Value>) -> OrchestratorResult<()> {
        if diff.is_empty() {
            return Err(OrchestratorError::invalid_input("修改内容不能为空"));
        }
        let rejected: Vec<&str> = diff
            .keys()
            .map(String::as_str)
            .filter(|k| !MUTABLE_FIELDS.contains(k))
            .collect();
        if !rejected.is_empty() {
            return Err(OrchestratorError::invalid_input(format!(
                "以下字段不可修改: {rejected:?}"
            )));
        }
        Ok(())
    }

    /// 逐字段覆盖。列表字段（variables/labels/dependency_tags）整体替换，不做合并
    pub fn apply_diff(&mut self, diff: &Map<String, Value>) -> OrchestratorResult<()> {
        Self::validate_diff(diff)?;

        let mut current = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => return Err(OrchestratorError::Internal("资源序列化结果不是对象".into())),
        };
        for (field, value) in diff {
            current.insert(field.clone(), value.clone());
        }

        let mut patched: Resource = serde_json::from_value(Value::Object(current))
            .map_err(|e| OrchestratorError::invalid_input(format!("修改内容格式错误: {e}")))?;
        patched.updated_at = Utc::now();
        *self = patched;
        Ok(())
    }

    pub fn view(&self, has_pending_edit: bool) -> ResourceView {
        ResourceView {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            state: self.state,
            status: self.status,
            parents: self.parents.clone(),
            children: self.children.clone(),
            is_abstract: self.is_abstract,
            variables: self.variables.clone(),
            labels: self.labels.clone(),
            has_pending_edit,
            updated_at: self.updated_at,
        }
    }
}

/// API 返回的资源视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceView {
    pub id: ResourceId,
    pub name: String,
    pub kind: ResourceKind,
    pub state: ResourceState,
    pub status: ResourceStatus,
    pub parents: Vec<ResourceId>,
    pub children: Vec<ResourceId>,
    #[serde(rename = "abstract")]
    pub is_abstract: bool,
    pub variables: Vec<Variable>,
    pub labels: Vec<String>,
    pub has_pending_edit: bool,
    pub updated_at: DateTime<Utc>,
}

/// 待审批的修改，每个资源至多一条
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEdit {
    pub resource_id: ResourceId,
    pub diff: Map<String, Value>,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

impl PendingEdit {
    pub fn new(resource_id: ResourceId, diff: Map<String, Value>, author_id: impl Into<String>) -> Self {
        Self {
            resource_id,
            diff,
            author_id: author_id.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskRecordStatus {
    Dispatched,
    PublishFailed,
    Received,
    Retrying,
    Succeeded,
    Failed,
    /// 资源已离开 QUEUED 或有更新的派发，任务未执行即被丢弃
    Superseded,
}

/// 派发到 broker 的任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub resource_id: ResourceId,
    pub action: Action,
    pub actor_id: String,
    pub dry_run: bool,
    pub status: TaskRecordStatus,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 正在运行的消费者进程
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub name: String,
    pub host: String,
    pub pid: u32,
    pub busy: bool,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl WorkerRegistration {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            host: host.into(),
            pid: std::process::id(),
            busy: false,
            last_seen: now,
            registered_at: now,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_silence: chrono::Duration) -> bool {
        now - self.last_seen > max_silence
    }
}

/// 策略网关中的能力级别，Admin 包含 Write，Write 包含 Read
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Admin,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Admin => "admin",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
