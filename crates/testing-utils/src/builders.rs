//! Test data builders
//!
//! Builders start from a sensible default and let tests override only the
//! fields they care about.

use orchestrator_domain::{
    Resource, ResourceId, ResourceKind, ResourceState, ResourceStatus, Variable,
};
use serde_json::{Map, Value};

/// Builder for `Resource` entities
pub struct ResourceBuilder {
    resource: Resource,
}

impl ResourceBuilder {
    /// A provisioned, healthy network owned by `owner`
    pub fn new(id: ResourceId) -> Self {
        let mut resource = Resource::new(id, format!("resource-{id}"), ResourceKind::Network, "owner", false);
        resource.state = ResourceState::Provisioned;
        resource.status = ResourceStatus::Done;
        resource.live_infrastructure = true;
        Self { resource }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.resource.name = name.to_string();
        self
    }

    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.resource.kind = kind;
        self
    }

    /// Infrastructure is assumed live for `Provisioned` and `Destroy`
    pub fn with_lifecycle(mut self, state: ResourceState, status: ResourceStatus) -> Self {
        self.resource.state = state;
        self.resource.status = status;
        self.resource.live_infrastructure =
            matches!(state, ResourceState::Provisioned | ResourceState::Destroy);
        self
    }

    pub fn with_live_infrastructure(mut self, live: bool) -> Self {
        self.resource.live_infrastructure = live;
        self
    }

    pub fn with_previous_state(mut self, state: ResourceState) -> Self {
        self.resource.previous_state = Some(state);
        self
    }

    pub fn with_parents(mut self, parents: Vec<ResourceId>) -> Self {
        self.resource.parents = parents;
        self
    }

    pub fn with_children(mut self, children: Vec<ResourceId>) -> Self {
        self.resource.children = children;
        self
    }

    pub fn with_variables(mut self, variables: Vec<Variable>) -> Self {
        self.resource.variables = variables;
        self
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.resource.labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_configuration(mut self, configuration: Map<String, Value>) -> Self {
        self.resource.configuration = configuration;
        self
    }

    pub fn abstract_resource(mut self) -> Self {
        self.resource.is_abstract = true;
        self
    }

    pub fn created_by(mut self, actor: &str) -> Self {
        self.resource.created_by = actor.to_string();
        self
    }

    /// Backdate `updated_at`, e.g. for sweeps that look at idle time
    pub fn updated_minutes_ago(mut self, minutes: i64) -> Self {
        self.resource.updated_at = chrono::Utc::now() - chrono::Duration::minutes(minutes);
        self
    }

    pub fn build(self) -> Resource {
        self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_provisioned_done() {
        let resource = ResourceBuilder::new(3).build();
        assert_eq!(resource.id, 3);
        assert_eq!(resource.state, ResourceState::Provisioned);
        assert_eq!(resource.status, ResourceStatus::Done);
        assert!(resource.live_infrastructure);
    }

    #[test]
    fn test_overrides() {
        let resource = ResourceBuilder::new(1)
            .with_kind(ResourceKind::Cluster)
            .with_lifecycle(ResourceState::Provision, ResourceStatus::Error)
            .with_parents(vec![7, 8])
            .abstract_resource()
            .build();
        assert_eq!(resource.kind, ResourceKind::Cluster);
        assert_eq!(resource.status, ResourceStatus::Error);
        assert_eq!(resource.parents, vec![7, 8]);
        assert!(resource.is_abstract);
        assert!(!resource.live_infrastructure);
    }
}
