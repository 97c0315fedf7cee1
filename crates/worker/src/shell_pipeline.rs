use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use orchestrator_config::PipelineConfig;
use orchestrator_domain::{
    ExecutionPipeline, OrchestratorError, PipelineError, PipelineOutcome, Resource, ResourceId,
    ResourceRepository, ResourceState, ResourceStatus, ResourceTask,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 调用外部命令执行 provision/destroy
///
/// 执行前检查依赖是否就绪：provision 需要所有父资源 PROVISIONED/DONE，
/// destroy 需要所有仍存在的子资源已销毁。未就绪时返回可重投的错误，不启动命令。
pub struct ShellPipeline {
    config: PipelineConfig,
    resources: Arc<dyn ResourceRepository>,
}

impl ShellPipeline {
    pub fn new(config: PipelineConfig, resources: Arc<dyn ResourceRepository>) -> Self {
        Self { config, resources }
    }

    async fn check_readiness(&self, resource: &Resource) -> Result<(), PipelineError> {
        match resource.state {
            ResourceState::Provision | ResourceState::Provisioned => {
                let parents = self
                    .resources
                    .get_many(&resource.parents)
                    .await
                    .map_err(storage_failure)?;
                let ready: HashSet<ResourceId> = parents
                    .iter()
                    .filter(|p| (p.state, p.status) == (ResourceState::Provisioned, ResourceStatus::Done))
                    .map(|p| p.id)
                    .collect();
                let waiting: Vec<ResourceId> = resource
                    .parents
                    .iter()
                    .copied()
                    .filter(|id| !ready.contains(id))
                    .collect();
                if !waiting.is_empty() {
                    return Err(PipelineError::ParentIsNotReady(waiting));
                }
            }
            ResourceState::Destroy | ResourceState::Destroyed => {
                let children = self
                    .resources
                    .get_many(&resource.children)
                    .await
                    .map_err(storage_failure)?;
                let waiting: Vec<ResourceId> = children
                    .iter()
                    .filter(|c| c.state != ResourceState::Destroyed)
                    .map(|c| c.id)
                    .collect();
                if !waiting.is_empty() {
                    return Err(PipelineError::ChildrenIsNotReady(waiting));
                }
            }
        }
        Ok(())
    }

    fn command(&self, resource: &Resource, task: &ResourceTask) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .arg(task.action.as_str())
            .arg(resource.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in environment(resource, task) {
            cmd.env(key, value);
        }
        cmd
    }
}

/// 传给外部命令的环境变量；资源变量以 `ORCH_VAR_<NAME>` 传入
fn environment(resource: &Resource, task: &ResourceTask) -> Vec<(String, String)> {
    let mut env = vec![
        ("ORCH_TASK_ID".to_string(), task.task_id.to_string()),
        ("ORCH_RESOURCE_ID".to_string(), resource.id.to_string()),
        ("ORCH_RESOURCE_NAME".to_string(), resource.name.clone()),
        ("ORCH_RESOURCE_KIND".to_string(), resource.kind.as_str().to_string()),
        ("ORCH_STATE".to_string(), resource.state.as_str().to_string()),
        ("ORCH_ACTION".to_string(), task.action.as_str().to_string()),
        ("ORCH_DRY_RUN".to_string(), task.dry_run.to_string()),
    ];

    for variable in &resource.variables {
        let name: String = variable
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        let value = match &variable.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        env.push((format!("ORCH_VAR_{name}"), value));
    }
    env
}

fn storage_failure(err: OrchestratorError) -> PipelineError {
    PipelineError::unexpected("StorageError", err.to_string())
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push(line);
    }
    collected
}

#[async_trait]
impl ExecutionPipeline for ShellPipeline {
    async fn run(&self, resource: &Resource, task: &ResourceTask) -> Result<PipelineOutcome, PipelineError> {
        if !task.dry_run {
            self.check_readiness(resource).await?;
        }

        info!(
            task_id = %task.task_id,
            resource_id = resource.id,
            command = %self.config.command,
            action = %task.action,
            "启动执行管线命令"
        );

        let start = Instant::now();
        let mut child = self
            .command(resource, task)
            .spawn()
            .map_err(|e| PipelineError::unexpected("SpawnError", e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::unexpected("IoError", "无法获取stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::unexpected("IoError", "无法获取stderr"))?;

        let limit = Duration::from_secs(self.config.timeout_seconds);
        let finished = tokio::time::timeout(limit, async {
            let (out, err) = tokio::join!(read_lines(stdout), read_lines(stderr));
            (out, err, child.wait().await)
        })
        .await;

        let (stdout_lines, stderr_lines, status) = match finished {
            Ok(result) => result,
            Err(_) => {
                warn!(task_id = %task.task_id, timeout_seconds = self.config.timeout_seconds, "执行管线命令超时");
                return Err(PipelineError::CannotProceed(format!(
                    "命令执行超时 ({}s)",
                    self.config.timeout_seconds
                )));
            }
        };
        let status = status.map_err(|e| PipelineError::unexpected("IoError", e.to_string()))?;

        debug!(
            task_id = %task.task_id,
            exit_code = ?status.code(),
            duration_ms = start.elapsed().as_millis() as u64,
            stdout_lines = stdout_lines.len(),
            "执行管线命令结束"
        );

        match status.code() {
            Some(0) => Ok(PipelineOutcome::with_lines(stdout_lines)),
            Some(code) if code == self.config.exit_without_save_code => {
                let reason = stderr_lines
                    .last()
                    .or(stdout_lines.last())
                    .cloned()
                    .unwrap_or_else(|| format!("退出码 {code}"));
                Err(PipelineError::ExitWithoutSave(reason))
            }
            code => {
                let reason = if stderr_lines.is_empty() {
                    format!("命令执行失败，退出码: {code:?}")
                } else {
                    stderr_lines.join("\n")
                };
                Err(PipelineError::CannotProceed(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_domain::{Action, Variable};
    use orchestrator_infrastructure::InMemoryResourceRepository;
    use orchestrator_testing_utils::ResourceBuilder;

    fn sh(script: &str) -> PipelineConfig {
        PipelineConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "pipeline".to_string()],
            ..PipelineConfig::default()
        }
    }

    async fn pipeline(config: PipelineConfig, seeded: Vec<Resource>) -> ShellPipeline {
        let repo = Arc::new(InMemoryResourceRepository::new());
        for resource in seeded {
            repo.insert(resource).await;
        }
        ShellPipeline::new(config, repo)
    }

    fn queued(id: ResourceId) -> ResourceBuilder {
        ResourceBuilder::new(id).with_lifecycle(ResourceState::Provision, ResourceStatus::InProgress)
    }

    #[tokio::test]
    async fn test_stdout_becomes_log_lines() {
        let resource = queued(1)
            .with_variables(vec![Variable::new("region", "eu-west-1")])
            .build();
        let pipeline = pipeline(sh("echo \"$1 $2\"; echo \"$ORCH_VAR_REGION\""), vec![]).await;
        let task = ResourceTask::new(&resource, Action::Execute, "alice", false);

        let outcome = pipeline.run(&resource, &task).await.unwrap();
        assert_eq!(outcome.log_lines, vec!["execute 1", "eu-west-1"]);
    }

    #[tokio::test]
    async fn test_unready_parent_is_not_ready_error() {
        let parent = ResourceBuilder::new(2)
            .with_lifecycle(ResourceState::Provision, ResourceStatus::InProgress)
            .build();
        let resource = queued(3).with_parents(vec![2, 99]).build();
        let pipeline = pipeline(sh("exit 0"), vec![parent]).await;
        let task = ResourceTask::new(&resource, Action::Execute, "alice", false);

        let err = pipeline.run(&resource, &task).await.unwrap_err();
        assert_eq!(err, PipelineError::ParentIsNotReady(vec![2, 99]));
    }

    #[tokio::test]
    async fn test_live_child_blocks_destroy() {
        let child = ResourceBuilder::new(5).with_parents(vec![4]).build();
        let resource = ResourceBuilder::new(4)
            .with_lifecycle(ResourceState::Destroy, ResourceStatus::InProgress)
            .with_children(vec![5, 6])
            .build();
        let pipeline = pipeline(sh("exit 0"), vec![child]).await;
        let task = ResourceTask::new(&resource, Action::Execute, "alice", false);

        let err = pipeline.run(&resource, &task).await.unwrap_err();
        assert_eq!(err, PipelineError::ChildrenIsNotReady(vec![5]));
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_pipeline_errors() {
        let resource = queued(7).build();
        let task = ResourceTask::new(&resource, Action::Execute, "alice", false);

        let skip = pipeline(sh("echo 'nothing changed' >&2; exit 3"), vec![]).await;
        assert_eq!(
            skip.run(&resource, &task).await.unwrap_err(),
            PipelineError::ExitWithoutSave("nothing changed".to_string())
        );

        let broken = pipeline(sh("echo 'quota exceeded' >&2; exit 1"), vec![]).await;
        assert_eq!(
            broken.run(&resource, &task).await.unwrap_err(),
            PipelineError::CannotProceed("quota exceeded".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_command_is_unexpected() {
        let resource = queued(8).build();
        let task = ResourceTask::new(&resource, Action::Execute, "alice", false);
        let config = PipelineConfig {
            command: "/nonexistent/orchestrator-pipeline".to_string(),
            ..PipelineConfig::default()
        };

        let err = pipeline(config, vec![]).await.run(&resource, &task).await.unwrap_err();
        assert_eq!(err.kind_name(), "SpawnError");
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let resource = queued(9).build();
        let task = ResourceTask::new(&resource, Action::Execute, "alice", false);
        let config = PipelineConfig {
            timeout_seconds: 1,
            ..sh("sleep 5")
        };

        let err = pipeline(config, vec![]).await.run(&resource, &task).await.unwrap_err();
        assert!(matches!(err, PipelineError::CannotProceed(_)));
    }
}
