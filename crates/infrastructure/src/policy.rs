use std::collections::HashMap;

use async_trait::async_trait;
use orchestrator_config::PolicyConfig;
use orchestrator_domain::{Capability, OrchestratorResult, PolicyGate, ResourceId};
use tokio::sync::RwLock;
use tracing::debug;

/// 基于配置的静态授权表，不区分资源
pub struct StaticPolicyGate {
    grants: RwLock<HashMap<String, Capability>>,
    default_level: Option<Capability>,
}

impl StaticPolicyGate {
    pub fn from_config(config: &PolicyConfig) -> Self {
        let mut grants = HashMap::new();
        for reader in &config.readers {
            grants.insert(reader.clone(), Capability::Read);
        }
        for writer in &config.writers {
            grants.insert(writer.clone(), Capability::Write);
        }
        for admin in &config.admins {
            grants.insert(admin.clone(), Capability::Admin);
        }

        Self {
            grants: RwLock::new(grants),
            default_level: config.default_level.as_deref().and_then(Self::parse_level),
        }
    }

    fn parse_level(level: &str) -> Option<Capability> {
        match level {
            "read" => Some(Capability::Read),
            "write" => Some(Capability::Write),
            "admin" => Some(Capability::Admin),
            _ => None,
        }
    }

    pub async fn grant(&self, subject_id: &str, level: Capability) {
        self.grants
            .write()
            .await
            .insert(subject_id.to_string(), level);
    }

    pub async fn revoke(&self, subject_id: &str) {
        self.grants.write().await.remove(subject_id);
    }

    pub async fn level_of(&self, subject_id: &str) -> Option<Capability> {
        self.grants
            .read()
            .await
            .get(subject_id)
            .copied()
            .or(self.default_level)
    }
}

#[async_trait]
impl PolicyGate for StaticPolicyGate {
    async fn check(&self, subject_id: &str, object_id: ResourceId, capability: Capability) -> OrchestratorResult<bool> {
        let allowed = self
            .level_of(subject_id)
            .await
            .is_some_and(|level| level >= capability);
        debug!(subject_id, object_id, %capability, allowed, "权限检查");
        Ok(allowed)
    }
}
