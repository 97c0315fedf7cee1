pub mod approval;
pub mod entities;
pub mod events;
pub mod messaging;
pub mod pipeline;
pub mod ports;
pub mod state_machine;

pub use approval::ApprovalFlowSwitch;
pub use entities::*;
pub use events::*;
pub use messaging::*;
pub use orchestrator_errors::{OrchestratorError, OrchestratorResult};
pub use pipeline::*;
pub use ports::*;
pub use state_machine::*;
