// 配置验证
// 每个配置段实现 ConfigValidator，AppConfig 汇总调用

use crate::{ConfigError, ConfigResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// 验证工具函数
pub struct ValidationUtils;

impl ValidationUtils {
    /// 验证字符串非空
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// 验证超时值
    pub fn validate_timeout(timeout_seconds: u64, field_name: &str) -> ConfigResult<()> {
        if timeout_seconds == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if timeout_seconds > 86400 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 86400 seconds"
            )));
        }
        Ok(())
    }

    /// 验证URL格式
    pub fn validate_url(url: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;

        if !url.contains("://") {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be a valid URL with protocol"
            )));
        }

        Ok(())
    }

    /// 验证计数值
    pub fn validate_count(count: usize, field_name: &str, max_value: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max_value {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max_value}"
            )));
        }
        Ok(())
    }

    /// 验证监听地址（host:port）
    pub fn validate_bind_address(addr: &str, field_name: &str) -> ConfigResult<()> {
        addr.parse::<std::net::SocketAddr>().map(|_| ()).map_err(|e| {
            ConfigError::Validation(format!("{field_name} is not a valid socket address: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_not_empty() {
        assert!(ValidationUtils::validate_not_empty("tasks", "q").is_ok());
        assert!(ValidationUtils::validate_not_empty("  ", "q").is_err());
    }

    #[test]
    fn test_validate_timeout_bounds() {
        assert!(ValidationUtils::validate_timeout(60, "t").is_ok());
        assert!(ValidationUtils::validate_timeout(0, "t").is_err());
        assert!(ValidationUtils::validate_timeout(86401, "t").is_err());
    }

    #[test]
    fn test_validate_url_requires_scheme() {
        assert!(ValidationUtils::validate_url("amqp://localhost:5672", "u").is_ok());
        assert!(ValidationUtils::validate_url("localhost:5672", "u").is_err());
    }

    #[test]
    fn test_validate_bind_address() {
        assert!(ValidationUtils::validate_bind_address("0.0.0.0:8080", "a").is_ok());
        assert!(ValidationUtils::validate_bind_address("nope", "a").is_err());
    }
}
