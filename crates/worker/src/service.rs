use std::sync::Arc;

use orchestrator_domain::{OrchestratorError, OrchestratorResult};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::components::{HealthCheckManager, TaskConsumer};

/// 把多个消费者和健康检查放在同一个关闭信号下运行
#[derive(Default)]
pub struct WorkerService {
    consumers: Vec<Arc<TaskConsumer>>,
    health_check: Option<Arc<HealthCheckManager>>,
}

impl WorkerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_consumer(mut self, consumer: TaskConsumer) -> Self {
        self.consumers.push(Arc::new(consumer));
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheckManager) -> Self {
        self.health_check = Some(Arc::new(health_check));
        self
    }

    pub fn consumers(&self) -> &[Arc<TaskConsumer>] {
        &self.consumers
    }

    /// 任一组件失败时广播关闭，等待其余组件退出后返回第一个错误
    pub async fn run(self, shutdown: broadcast::Sender<()>) -> OrchestratorResult<()> {
        let mut tasks = JoinSet::new();

        for consumer in &self.consumers {
            let consumer = Arc::clone(consumer);
            let rx = shutdown.subscribe();
            tasks.spawn(async move { consumer.run(rx).await });
        }
        if let Some(health_check) = &self.health_check {
            let health_check = Arc::clone(health_check);
            let rx = shutdown.subscribe();
            tasks.spawn(async move { health_check.run(rx).await });
        }
        info!(consumers = self.consumers.len(), "Worker 服务已启动");

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| OrchestratorError::Internal(format!("worker 组件异常退出: {e}")))
                .and_then(|r| r);
            if let Err(e) = result {
                error!(error = %e, "Worker 组件失败，开始关闭");
                let _ = shutdown.send(());
                first_error.get_or_insert(e);
            }
        }

        info!("Worker 服务已停止");
        first_error.map_or(Ok(()), Err)
    }
}
