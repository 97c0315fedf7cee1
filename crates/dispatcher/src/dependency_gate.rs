use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use orchestrator_domain::{
    Action, Lifecycle, OrchestratorError, OrchestratorResult, Resource, ResourceId,
    ResourceRepository, ResourceState, ResourceStatus, StateMachine,
};

/// 父资源默认可接受的 (state, status)
pub const DEFAULT_ACCEPTABLE: &[(ResourceState, ResourceStatus)] =
    &[(ResourceState::Provisioned, ResourceStatus::Done)];

pub struct DependencyGate {
    repo: Arc<dyn ResourceRepository>,
}

impl DependencyGate {
    pub fn new(repo: Arc<dyn ResourceRepository>) -> Self {
        Self { repo }
    }

    /// recreate 以及任何离开 DESTROY/DESTROYED 的动作都需要检查父资源
    pub fn applies_to(action: Action, current: &Lifecycle, next: &Lifecycle) -> bool {
        let destroyed = |state: ResourceState| {
            matches!(state, ResourceState::Destroy | ResourceState::Destroyed)
        };
        action == Action::Recreate || (destroyed(current.state) && !destroyed(next.state))
    }

    /// 收集所有不满足条件的父资源（不存在的父资源同样计入），一次性报告
    pub async fn check_parents(
        &self,
        resource: &Resource,
        acceptable: &[(ResourceState, ResourceStatus)],
    ) -> OrchestratorResult<()> {
        if resource.parents.is_empty() {
            return Ok(());
        }

        debug!(resource_id = resource.id, parents = ?resource.parents, "检查父资源状态");

        let parents = self.repo.get_many(&resource.parents).await?;
        let found: HashMap<ResourceId, &Resource> = parents.iter().map(|p| (p.id, p)).collect();

        let offending: Vec<ResourceId> = resource
            .parents
            .iter()
            .copied()
            .filter(|id| match found.get(id) {
                Some(parent) => !acceptable.contains(&(parent.state, parent.status)),
                None => true,
            })
            .collect();

        if offending.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::dependency(
                format!("以下父资源未就绪: {offending:?}"),
                offending,
            ))
        }
    }

    /// 删除前检查：不能有依赖方，且生命周期必须是终态或从未执行
    pub async fn check_delete(&self, resource: &Resource) -> OrchestratorResult<()> {
        let dependents = self.dependents_of(resource).await?;
        if !dependents.is_empty() {
            return Err(OrchestratorError::dependency(
                format!("资源 {} 仍被其他资源依赖", resource.id),
                dependents,
            ));
        }
        if !StateMachine::deletable(&resource.lifecycle()) {
            return Err(OrchestratorError::wrong_state(
                resource.id,
                Action::Delete,
                resource.state,
                resource.status,
            ));
        }
        Ok(())
    }

    pub async fn dependents_of(&self, resource: &Resource) -> OrchestratorResult<Vec<ResourceId>> {
        let mut dependents: BTreeSet<ResourceId> =
            self.repo.find_dependents(resource.id).await?.into_iter().collect();
        let live_children = self.repo.get_many(&resource.children).await?;
        dependents.extend(live_children.iter().map(|c| c.id));
        dependents.remove(&resource.id);
        Ok(dependents.into_iter().collect())
    }

    /// 新节点的父子关系必须全部存在且不能成环
    pub async fn validate_links(
        &self,
        id: ResourceId,
        parents: &[ResourceId],
        children: &[ResourceId],
    ) -> OrchestratorResult<()> {
        if parents.contains(&id) || children.contains(&id) {
            return Err(OrchestratorError::dependency("资源不能依赖自身", vec![id]));
        }
        for &linked in parents.iter().chain(children) {
            if self.repo.get(linked).await?.is_none() {
                return Err(OrchestratorError::resource_not_found(linked));
            }
        }

        let mut graph = self.ancestor_graph(parents).await?;
        graph.insert(id, parents.to_vec());
        for &child in children {
            graph.entry(child).or_default().push(id);
        }

        if Self::has_cycle(&graph) {
            warn!(resource_id = id, ?parents, ?children, "检测到循环依赖");
            let mut involved: Vec<ResourceId> = parents.iter().chain(children).copied().collect();
            involved.sort_unstable();
            involved.dedup();
            return Err(OrchestratorError::dependency("父子关系形成循环", involved));
        }
        Ok(())
    }

    /// 从给定节点出发，沿 parents 向上 BFS 得到的子图（节点 -> 父节点列表）
    async fn ancestor_graph(
        &self,
        start: &[ResourceId],
    ) -> OrchestratorResult<HashMap<ResourceId, Vec<ResourceId>>> {
        let mut graph = HashMap::new();
        let mut visited: HashSet<ResourceId> = start.iter().copied().collect();
        let mut queue: VecDeque<ResourceId> = start.iter().copied().collect();

        while let Some(current_id) = queue.pop_front() {
            let Some(current) = self.repo.get(current_id).await? else {
                continue;
            };
            for &parent in &current.parents {
                if visited.insert(parent) {
                    queue.push_back(parent);
                }
            }
            graph.insert(current_id, current.parents);
        }

        Ok(graph)
    }

    /// Kahn 拓扑排序，无法处理完所有节点即有环
    fn has_cycle(graph: &HashMap<ResourceId, Vec<ResourceId>>) -> bool {
        let mut in_degree: HashMap<ResourceId, usize> = HashMap::new();
        for (&node, edges) in graph {
            in_degree.entry(node).or_insert(0);
            for &target in edges {
                *in_degree.entry(target).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<ResourceId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&node, _)| node)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop_front() {
            processed += 1;
            if let Some(edges) = graph.get(&node) {
                for target in edges {
                    if let Some(degree) = in_degree.get_mut(target) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*target);
                        }
                    }
                }
            }
        }

        processed < in_degree.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_cycle() {
        let mut graph = HashMap::new();
        graph.insert(1, vec![2]);
        graph.insert(2, vec![3]);
        assert!(!DependencyGate::has_cycle(&graph));

        graph.insert(3, vec![1]);
        assert!(DependencyGate::has_cycle(&graph));
    }

    #[test]
    fn test_applies_to_leaving_destroy() {
        let destroying = Lifecycle::new(ResourceState::Destroy, ResourceStatus::ApprovalPending);
        let restored = Lifecycle::new(ResourceState::Provisioned, ResourceStatus::Done);
        assert!(DependencyGate::applies_to(Action::Reject, &destroying, &restored));
        assert!(!DependencyGate::applies_to(Action::Approve, &destroying, &destroying));
        assert!(DependencyGate::applies_to(Action::Recreate, &destroying, &restored));
        assert!(!DependencyGate::applies_to(Action::Execute, &restored, &restored));
    }
}
