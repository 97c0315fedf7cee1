use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

use crate::entities::{Capability, ResourceId, ResourceState, ResourceStatus};

/// 资源上可执行的动作（封闭集合）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Execute,
    Dryrun,
    Destroy,
    Recreate,
    Approve,
    Reject,
    Retry,
    Reset,
    Delete,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Execute,
        Action::Dryrun,
        Action::Destroy,
        Action::Recreate,
        Action::Approve,
        Action::Reject,
        Action::Retry,
        Action::Reset,
        Action::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Execute => "execute",
            Action::Dryrun => "dryrun",
            Action::Destroy => "destroy",
            Action::Recreate => "recreate",
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Retry => "retry",
            Action::Reset => "reset",
            Action::Delete => "delete",
        }
    }

    /// approve/reject/delete 需要 admin，其余需要 write
    pub fn required_capability(&self) -> Capability {
        match self {
            Action::Approve | Action::Reject | Action::Delete => Capability::Admin,
            _ => Capability::Write,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| OrchestratorError::invalid_input(format!("不支持的动作: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub state: ResourceState,
    pub status: ResourceStatus,
    pub previous_state: Option<ResourceState>,
    /// 真实执行过且尚未成功销毁，即可能存在实际基础设施
    pub live_infrastructure: bool,
    pub updated_at: DateTime<Utc>,
}

impl Lifecycle {
    pub fn new(state: ResourceState, status: ResourceStatus) -> Self {
        Self {
            state,
            status,
            previous_state: None,
            live_infrastructure: false,
            updated_at: Utc::now(),
        }
    }

    fn with(&self, state: ResourceState, status: ResourceStatus) -> Self {
        Self {
            state,
            status,
            previous_state: self.previous_state,
            live_infrastructure: self.live_infrastructure,
            updated_at: self.updated_at,
        }
    }
}

/// 派发时读取的运行时上下文，不属于转移表本身
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    pub approval_flow_enabled: bool,
    pub reset_cooldown: Duration,
    pub now: DateTime<Utc>,
}

impl TransitionContext {
    pub fn new(approval_flow_enabled: bool, reset_cooldown: Duration) -> Self {
        Self {
            approval_flow_enabled,
            reset_cooldown,
            now: Utc::now(),
        }
    }

    fn pending_status(&self) -> ResourceStatus {
        if self.approval_flow_enabled {
            ResourceStatus::ApprovalPending
        } else {
            ResourceStatus::Ready
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Run,
    DryRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: Lifecycle,
    /// 需要派发给 worker 的任务
    pub task: Option<TaskMode>,
    /// 资源应被永久删除
    pub remove: bool,
    /// 已处于目标状态的重复请求
    pub idempotent_replay: bool,
}

impl Transition {
    fn to(next: Lifecycle) -> Self {
        Self {
            next,
            task: None,
            remove: false,
            idempotent_replay: false,
        }
    }

    fn with_task(mut self, mode: TaskMode) -> Self {
        self.task = Some(mode);
        self
    }
}

/// worker 回报的执行进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEvent {
    Started,
    Succeeded,
    Failed,
    AwaitingRetry,
}

pub struct StateMachine;

impl StateMachine {
    /// 纯函数：给定当前生命周期与动作，返回转移结果或 EntityWrongState
    pub fn apply(
        id: ResourceId,
        current: &Lifecycle,
        action: Action,
        ctx: &TransitionContext,
    ) -> OrchestratorResult<Transition> {
        use ResourceState::*;
        use ResourceStatus::*;

        let state = current.state;
        let status = current.status;
        let in_flight = status.is_in_flight();
        let refuse = || OrchestratorError::wrong_state(id, action, state, status);

        let transition = match action {
            Action::Execute if !in_flight => {
                Transition::to(current.with(state, Queued)).with_task(TaskMode::Run)
            }
            Action::Dryrun if matches!(status, Ready | Error | Done) => {
                Transition::to(*current).with_task(TaskMode::DryRun)
            }
            Action::Destroy if matches!(state, Provision | Provisioned) => {
                let mut next = current.with(Destroy, ctx.pending_status());
                next.previous_state = Some(state);
                Transition::to(next)
            }
            Action::Recreate if (status == Rejected || matches!(state, Destroy | Destroyed)) && !in_flight => {
                let target = match state {
                    Destroy => current.previous_state.unwrap_or(Provisioned),
                    _ => Provision,
                };
                let mut next = current.with(target, ctx.pending_status());
                next.previous_state = None;
                Transition::to(next)
            }
            Action::Approve if status == ApprovalPending => Transition::to(current.with(state, Ready)),
            Action::Approve if status == Ready => Transition {
                idempotent_replay: true,
                ..Transition::to(*current)
            },
            Action::Reject if status == ApprovalPending => {
                // 只有从未执行的 PROVISION 会进入 REJECTED，其余阶段回到审批前的稳定状态
                let mut next = match state {
                    Destroy => current.with(current.previous_state.unwrap_or(Provisioned), Done),
                    Provision => current.with(Provision, Rejected),
                    Provisioned | Destroyed => current.with(state, Done),
                };
                next.previous_state = None;
                Transition::to(next)
            }
            Action::Retry if status == Queued => {
                Transition::to(*current).with_task(TaskMode::Run)
            }
            Action::Reset if status == InProgress => {
                if ctx.now - current.updated_at < ctx.reset_cooldown {
                    return Err(refuse());
                }
                Transition::to(current.with(state, Error))
            }
            Action::Delete if !in_flight && Self::deletable(current) => Transition {
                remove: true,
                ..Transition::to(*current)
            },
            _ => return Err(refuse()),
        };

        Ok(transition)
    }

    /// 终态 DESTROYED，或从未执行过（PROVISION 且无实际基础设施）
    pub fn deletable(current: &Lifecycle) -> bool {
        if current.live_infrastructure {
            return false;
        }
        match current.state {
            ResourceState::Destroyed => true,
            ResourceState::Provision => matches!(
                current.status,
                ResourceStatus::Ready | ResourceStatus::Rejected | ResourceStatus::ApprovalPending
            ),
            _ => false,
        }
    }

    /// 当前生命周期下可执行的动作（不含幂等重放）
    pub fn legal_actions(id: ResourceId, current: &Lifecycle, ctx: &TransitionContext) -> Vec<Action> {
        Action::ALL
            .iter()
            .copied()
            .filter(|action| {
                matches!(
                    Self::apply(id, current, *action, ctx),
                    Ok(t) if !t.idempotent_replay
                )
            })
            .collect()
    }

    /// worker 执行反馈导致的转移；dry run 成功不改变状态
    ///
    /// 真实的创建任务一旦开始就标记存在基础设施，只有销毁成功才清除
    pub fn on_execution(current: &Lifecycle, event: ExecutionEvent, dry_run: bool) -> Lifecycle {
        use ResourceState::*;
        use ResourceStatus::*;

        let creating = matches!(current.state, Provision | Provisioned);
        match event {
            ExecutionEvent::Failed => current.with(current.state, Error),
            _ if dry_run => *current,
            ExecutionEvent::Started => {
                let mut next = current.with(current.state, InProgress);
                next.live_infrastructure |= creating;
                next
            }
            ExecutionEvent::AwaitingRetry => current.with(current.state, Queued),
            ExecutionEvent::Succeeded if creating => {
                let mut next = current.with(Provisioned, Done);
                next.live_infrastructure = true;
                next
            }
            ExecutionEvent::Succeeded => {
                let mut next = current.with(Destroyed, Done);
                next.live_infrastructure = false;
                next
            }
        }
    }
}
