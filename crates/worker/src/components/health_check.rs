use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use orchestrator_domain::{OrchestratorResult, WorkerRegistration, WorkerRegistry};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info};

/// 按固定间隔重新注册 worker，与消息流量无关
pub struct HealthCheckManager {
    registry: Arc<dyn WorkerRegistry>,
    registration: WorkerRegistration,
    interval: Duration,
}

impl HealthCheckManager {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        registration: WorkerRegistration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            registration,
            interval,
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.registration.name
    }

    /// 已注册时只刷新 last_seen，busy 标记完全由消费者维护
    pub async fn register_once(&self) -> OrchestratorResult<()> {
        let name = &self.registration.name;
        let now = Utc::now();
        if self.registry.touch(name, now).await? {
            debug!(worker = %name, "Worker 心跳已刷新");
            return Ok(());
        }

        let mut registration = self.registration.clone();
        registration.last_seen = now;
        self.registry.register(&registration).await?;
        info!(worker = %name, host = %registration.host, "Worker 已注册");
        Ok(())
    }

    /// 注册失败直接返回错误，由进程退出交给外部监管重启
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> OrchestratorResult<()> {
        let mut ticker = interval(self.interval);
        info!(
            worker = %self.registration.name,
            interval_secs = self.interval.as_secs(),
            "健康检查已启动"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.register_once().await {
                        error!(worker = %self.registration.name, error = %e, "健康检查失败");
                        counter!("orchestrator_health_check_failures_total").increment(1);
                        return Err(e);
                    }
                }
                _ = shutdown.recv() => {
                    info!(worker = %self.registration.name, "健康检查停止");
                    return Ok(());
                }
            }
        }
    }
}
