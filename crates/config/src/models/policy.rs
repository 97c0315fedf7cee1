use crate::validation::ConfigValidator;
use serde::{Deserialize, Serialize};

/// 内置静态策略网关的授权表
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub admins: Vec<String>,
    pub writers: Vec<String>,
    pub readers: Vec<String>,
    /// 未列出的调用方的权限: none | read | write | admin
    pub default_level: Option<String>,
}

impl ConfigValidator for PolicyConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if let Some(level) = &self.default_level {
            let valid_levels = ["none", "read", "write", "admin"];
            if !valid_levels.contains(&level.as_str()) {
                return Err(crate::ConfigError::Validation(format!(
                    "Invalid policy.default_level: {level}. Valid options: {valid_levels:?}"
                )));
            }
        }
        Ok(())
    }
}
