pub mod consumer;
pub mod health_check;

pub use consumer::{ConsumerBinding, ConsumerState, TaskConsumer};
pub use health_check::HealthCheckManager;
