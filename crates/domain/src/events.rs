use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{ResourceId, ResourceKind, ResourceState, ResourceStatus};
use crate::state_machine::Action;

/// 资源状态变化事件，推送给实时订阅者
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceEvent {
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    pub action: String,
    pub actor_id: String,
    pub state: ResourceState,
    pub status: ResourceStatus,
    pub occurred_at: DateTime<Utc>,
}

impl ResourceEvent {
    pub fn new(
        resource_id: ResourceId,
        kind: ResourceKind,
        action: impl Into<String>,
        actor_id: impl Into<String>,
        state: ResourceState,
        status: ResourceStatus,
    ) -> Self {
        Self {
            resource_id,
            kind,
            action: action.into(),
            actor_id: actor_id.into(),
            state,
            status,
            occurred_at: Utc::now(),
        }
    }

    pub fn for_action(
        resource_id: ResourceId,
        kind: ResourceKind,
        action: Action,
        actor_id: impl Into<String>,
        state: ResourceState,
        status: ResourceStatus,
    ) -> Self {
        Self::new(resource_id, kind, action.as_str(), actor_id, state, status)
    }

    /// `logs.<entity>.<id>`
    pub fn routing_key(&self) -> String {
        format!("logs.{}.{}", self.kind, self.resource_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// 发给用户的通知
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub user_id: String,
    pub msg: String,
    pub level: NotificationLevel,
    pub resource_id: Option<ResourceId>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: impl Into<String>, msg: impl Into<String>, level: NotificationLevel) -> Self {
        Self {
            user_id: user_id.into(),
            msg: msg.into(),
            level,
            resource_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_resource(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    /// `notifications.task.<user>`
    pub fn routing_key(&self) -> String {
        format!("notifications.task.{}", self.user_id)
    }
}
