use async_trait::async_trait;
use orchestrator_domain::{ApprovalFlowSwitch, MessageType, TaskEnvelope};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::handlers::{MessageHandler, TaskFailure};

/// 系统 fanout 交换机上的广播事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    ApprovalFlow { enabled: bool },
}

pub struct SystemEventHandler {
    approval: ApprovalFlowSwitch,
}

impl SystemEventHandler {
    pub fn new(approval: ApprovalFlowSwitch) -> Self {
        Self { approval }
    }
}

#[async_trait]
impl MessageHandler for SystemEventHandler {
    fn message_type(&self) -> MessageType {
        MessageType::Broadcast
    }

    async fn handle(&self, envelope: &TaskEnvelope) -> Result<(), TaskFailure> {
        let event = match envelope.body_as::<SystemEvent>() {
            Ok(event) => event,
            Err(e) => {
                // 未知事件直接确认，不影响其他订阅者
                warn!(error = %e, "忽略无法识别的系统事件");
                return Ok(());
            }
        };

        match event {
            SystemEvent::ApprovalFlow { enabled } => {
                let previous = self.approval.set(enabled);
                info!(previous, enabled, "审批开关已更新");
            }
        }
        Ok(())
    }
}
