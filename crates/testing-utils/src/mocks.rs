//! Test doubles for the collaborator ports
//!
//! Every double records what it was asked to do so tests can assert on side
//! effects, and most can be switched into a failing mode.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use orchestrator_domain::{
    Capability, EventPublisher, ExecutionPipeline, Notification, Notifier, PipelineError,
    PipelineOutcome, PolicyGate, Resource, ResourceEvent, ResourceId, ResourceTask,
};
use orchestrator_errors::{OrchestratorError, OrchestratorResult};

/// Policy gate backed by an explicit grant table
///
/// Grants can be global (`grant`) or scoped to one object (`grant_on`); the
/// more specific grant wins.
#[derive(Debug, Clone, Default)]
pub struct GrantPolicyGate {
    global: Arc<Mutex<HashMap<String, Capability>>>,
    scoped: Arc<Mutex<HashMap<(String, ResourceId), Capability>>>,
}

impl GrantPolicyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(self, actor: &str, capability: Capability) -> Self {
        self.global.lock().unwrap().insert(actor.to_string(), capability);
        self
    }

    pub fn grant_on(self, actor: &str, object_id: ResourceId, capability: Capability) -> Self {
        self.scoped
            .lock()
            .unwrap()
            .insert((actor.to_string(), object_id), capability);
        self
    }

    pub fn revoke(&self, actor: &str) {
        self.global.lock().unwrap().remove(actor);
        self.scoped.lock().unwrap().retain(|(a, _), _| a != actor);
    }
}

#[async_trait]
impl PolicyGate for GrantPolicyGate {
    async fn check(&self, subject_id: &str, object_id: ResourceId, capability: Capability) -> OrchestratorResult<bool> {
        let scoped = self
            .scoped
            .lock()
            .unwrap()
            .get(&(subject_id.to_string(), object_id))
            .copied();
        let level = scoped.or_else(|| self.global.lock().unwrap().get(subject_id).copied());
        Ok(level.is_some_and(|level| level >= capability))
    }
}

/// Execution pipeline that replays a script of results
///
/// Once the script is exhausted every run succeeds with no log lines.
#[derive(Clone, Default)]
pub struct ScriptedPipeline {
    script: Arc<Mutex<VecDeque<Result<PipelineOutcome, PipelineError>>>>,
    calls: Arc<Mutex<Vec<ResourceTask>>>,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_ok(self, lines: &[&str]) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(PipelineOutcome::with_lines(lines.iter().copied())));
        self
    }

    pub fn then_fail(self, error: PipelineError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn then_fail_times(self, error: PipelineError, times: usize) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            for _ in 0..times {
                script.push_back(Err(error.clone()));
            }
        }
        self
    }

    pub fn calls(&self) -> Vec<ResourceTask> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutionPipeline for ScriptedPipeline {
    async fn run(&self, _resource: &Resource, task: &ResourceTask) -> Result<PipelineOutcome, PipelineError> {
        self.calls.lock().unwrap().push(task.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(PipelineOutcome::default()))
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn messages_for(&self, user_id: &str) -> Vec<String> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.user_id == user_id)
            .map(|n| n.msg.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> OrchestratorResult<()> {
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingEventPublisher {
    events: Arc<Mutex<Vec<ResourceEvent>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subsequent publishes fail without recording
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn events(&self) -> Vec<ResourceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn actions_for(&self, resource_id: ResourceId) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.resource_id == resource_id)
            .map(|e| e.action.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: &ResourceEvent) -> OrchestratorResult<()> {
        if *self.failing.lock().unwrap() {
            return Err(OrchestratorError::message_queue("event publisher unavailable"));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_policy_hierarchy() {
        let gate = GrantPolicyGate::new()
            .grant("alice", Capability::Admin)
            .grant("bob", Capability::Write)
            .grant_on("bob", 9, Capability::Read);

        assert!(gate.check("alice", 1, Capability::Admin).await.unwrap());
        assert!(gate.check("bob", 1, Capability::Write).await.unwrap());
        assert!(!gate.check("bob", 1, Capability::Admin).await.unwrap());
        assert!(!gate.check("bob", 9, Capability::Write).await.unwrap());
        assert!(!gate.check("mallory", 1, Capability::Read).await.unwrap());
    }

    #[tokio::test]
    async fn test_scripted_pipeline_replays_then_succeeds() {
        let pipeline = ScriptedPipeline::new()
            .then_fail(PipelineError::ParentIsNotReady(vec![1]))
            .then_ok(&["applied"]);
        let resource = crate::ResourceBuilder::new(5).build();
        let task = ResourceTask::new(&resource, orchestrator_domain::Action::Execute, "alice", false);

        assert!(pipeline.run(&resource, &task).await.is_err());
        assert_eq!(pipeline.run(&resource, &task).await.unwrap().log_lines, vec!["applied"]);
        assert!(pipeline.run(&resource, &task).await.unwrap().log_lines.is_empty());
        assert_eq!(pipeline.call_count(), 3);
    }
}
