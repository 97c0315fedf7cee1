use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{entity}未找到: {id}")]
    EntityNotFound { entity: &'static str, id: String },
    #[error("资源 {id} 当前状态 {state}/{status} 不允许执行 {action}")]
    EntityWrongState {
        id: i64,
        action: String,
        state: String,
        status: String,
    },
    #[error("依赖关系阻止操作: {message} {ids:?}")]
    DependencyError { message: String, ids: Vec<i64> },
    #[error("权限不足: {actor} 无法对 {object} 执行 {action}")]
    AccessDenied {
        actor: String,
        object: String,
        action: String,
    },
    #[error("未认证的请求")]
    AccessUnauthorized,
    #[error("无效的输入: {0}")]
    InvalidInput(String),
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("存储错误: {0}")]
    Storage(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn resource_not_found(id: i64) -> Self {
        Self::EntityNotFound {
            entity: "资源",
            id: id.to_string(),
        }
    }
    pub fn entity_not_found<S: Into<String>>(entity: &'static str, id: S) -> Self {
        Self::EntityNotFound {
            entity,
            id: id.into(),
        }
    }
    pub fn wrong_state(
        id: i64,
        action: impl ToString,
        state: impl ToString,
        status: impl ToString,
    ) -> Self {
        Self::EntityWrongState {
            id,
            action: action.to_string(),
            state: state.to_string(),
            status: status.to_string(),
        }
    }
    pub fn dependency<S: Into<String>>(message: S, ids: Vec<i64>) -> Self {
        Self::DependencyError {
            message: message.into(),
            ids,
        }
    }
    pub fn access_denied(actor: &str, object: impl ToString, action: impl ToString) -> Self {
        Self::AccessDenied {
            actor: actor.to_string(),
            object: object.to_string(),
            action: action.to_string(),
        }
    }
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }
    pub fn message_queue<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    /// 依赖方实体id（仅 DependencyError 携带）
    pub fn dependency_ids(&self) -> Option<&[i64]> {
        match self {
            Self::DependencyError { ids, .. } => Some(ids),
            _ => None,
        }
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::MessageQueue(_) | OrchestratorError::Storage(_)
        )
    }
    /// 是否为调用方可见的业务拒绝（而非系统故障）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            OrchestratorError::EntityNotFound { .. }
                | OrchestratorError::EntityWrongState { .. }
                | OrchestratorError::DependencyError { .. }
                | OrchestratorError::AccessDenied { .. }
                | OrchestratorError::AccessUnauthorized
                | OrchestratorError::InvalidInput(_)
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
