pub mod components;
pub mod exception_classifier;
pub mod handlers;
pub mod reconciliation;
pub mod service;
pub mod shell_pipeline;
pub mod system_events;
pub mod task_execution;

pub use components::{ConsumerBinding, ConsumerState, HealthCheckManager, TaskConsumer};
pub use exception_classifier::{ExceptionClassifier, FailureClass, RetryPolicy};
pub use handlers::{HandlerTable, MessageHandler, TaskFailure, WorkerPorts};
pub use reconciliation::{ReconciliationHandler, SchedulerJob, RECONCILE_ROUTING_KEY};
pub use service::WorkerService;
pub use shell_pipeline::ShellPipeline;
pub use system_events::{SystemEvent, SystemEventHandler};
pub use task_execution::ProvisioningTaskHandler;
