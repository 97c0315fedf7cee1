use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 审批流程开关的初始值，运行期可通过系统广播切换
    pub approval_flow_enabled: bool,
    /// IN_PROGRESS 状态允许 reset 前的冷却时间
    pub reset_cooldown_seconds: u64,
    /// QUEUED 超过该时长且未被 worker 接收的资源会被对账任务重新派发
    pub reconcile_after_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            approval_flow_enabled: true,
            reset_cooldown_seconds: 600,
            reconcile_after_seconds: 900,
        }
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout(
            self.reset_cooldown_seconds,
            "dispatcher.reset_cooldown_seconds",
        )?;
        ValidationUtils::validate_timeout(
            self.reconcile_after_seconds,
            "dispatcher.reconcile_after_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_name: String,
    pub hostname: String,
    pub health_check_interval_seconds: u64,
    /// 处理消息前后切换 busy/free 标记
    pub track_busy: bool,
    pub pipeline: PipelineConfig,
}

/// 执行 provision/destroy 的外部命令
///
/// 命令以 `<command> <args...> <action> <resource_id>` 的形式调用，资源信息同时通过
/// `ORCH_*` 环境变量传入。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub timeout_seconds: u64,
    /// 该退出码表示命令主动放弃且不保存状态
    pub exit_without_save_code: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            command: "echo".to_string(),
            args: Vec::new(),
            working_dir: None,
            timeout_seconds: 3600,
            exit_without_save_code: 3,
        }
    }
}

impl ConfigValidator for PipelineConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.command, "worker.pipeline.command")?;
        ValidationUtils::validate_timeout(self.timeout_seconds, "worker.pipeline.timeout_seconds")
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            worker_name: format!("worker-{hostname}"),
            hostname,
            health_check_interval_seconds: 60,
            track_busy: true,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.worker_name, "worker.worker_name")?;
        ValidationUtils::validate_not_empty(&self.hostname, "worker.hostname")?;
        ValidationUtils::validate_timeout(
            self.health_check_interval_seconds,
            "worker.health_check_interval_seconds",
        )?;
        self.pipeline.validate()
    }
}
