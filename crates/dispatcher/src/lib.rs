//! 资源动作派发
//!
//! 审批暂存、依赖检查与动作派发，所有外部协作者通过 domain 中的接口注入

pub mod action_dispatcher;
pub mod approval_staging;
pub mod dependency_gate;

pub use action_dispatcher::{ActionDispatcher, DispatcherPorts, DispatcherSettings, NewResource};
pub use approval_staging::ApprovalStaging;
pub use dependency_gate::{DependencyGate, DEFAULT_ACCEPTABLE};
