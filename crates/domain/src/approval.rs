use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 进程级审批流程开关，派发时读取
#[derive(Debug, Clone)]
pub struct ApprovalFlowSwitch(Arc<AtomicBool>);

impl ApprovalFlowSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// 返回修改前的值
    pub fn set(&self, enabled: bool) -> bool {
        self.0.swap(enabled, Ordering::SeqCst)
    }
}

impl Default for ApprovalFlowSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}
