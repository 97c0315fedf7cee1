use async_trait::async_trait;
use thiserror::Error;

use crate::entities::{Resource, ResourceId};
use crate::messaging::ResourceTask;

/// 执行管线抛出的失败，只在 worker 内部处理
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("父资源尚未就绪: {0:?}")]
    ParentIsNotReady(Vec<ResourceId>),
    #[error("子资源尚未就绪: {0:?}")]
    ChildrenIsNotReady(Vec<ResourceId>),
    #[error("无法继续执行: {0}")]
    CannotProceed(String),
    #[error("提前退出且不保存状态: {0}")]
    ExitWithoutSave(String),
    #[error("{kind}: {message}")]
    Unexpected { kind: String, message: String },
}

impl PipelineError {
    pub fn unexpected(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unexpected {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind_name(&self) -> &str {
        match self {
            PipelineError::ParentIsNotReady(_) => "ParentIsNotReady",
            PipelineError::ChildrenIsNotReady(_) => "ChildrenIsNotReady",
            PipelineError::CannotProceed(_) => "CannotProceed",
            PipelineError::ExitWithoutSave(_) => "ExitWithoutSave",
            PipelineError::Unexpected { kind, .. } => kind,
        }
    }

    /// 父子资源就绪竞争，可重投
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            PipelineError::ParentIsNotReady(_) | PipelineError::ChildrenIsNotReady(_)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub log_lines: Vec<String>,
}

impl PipelineOutcome {
    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            log_lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

/// 真正执行 provision/destroy 的外部协作者
#[async_trait]
pub trait ExecutionPipeline: Send + Sync {
    async fn run(&self, resource: &Resource, task: &ResourceTask) -> Result<PipelineOutcome, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(PipelineError::ParentIsNotReady(vec![1]).kind_name(), "ParentIsNotReady");
        assert_eq!(
            PipelineError::unexpected("KeyError", "missing 'vpc_id'").kind_name(),
            "KeyError"
        );
    }

    #[test]
    fn test_not_ready_family() {
        assert!(PipelineError::ChildrenIsNotReady(vec![2, 3]).is_not_ready());
        assert!(!PipelineError::CannotProceed("quota".into()).is_not_ready());
        assert!(!PipelineError::ExitWithoutSave("noop".into()).is_not_ready());
    }
}
