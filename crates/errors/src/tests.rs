use crate::*;

#[test]
fn test_error_display() {
    let not_found = OrchestratorError::resource_not_found(42);
    assert_eq!(not_found.to_string(), "资源未找到: 42");

    let wrong_state = OrchestratorError::wrong_state(7, "approve", "PROVISIONED", "DONE");
    assert_eq!(
        wrong_state.to_string(),
        "资源 7 当前状态 PROVISIONED/DONE 不允许执行 approve"
    );

    let denied = OrchestratorError::access_denied("alice", 3, "admin");
    assert_eq!(denied.to_string(), "权限不足: alice 无法对 3 执行 admin");

    assert_eq!(
        OrchestratorError::AccessUnauthorized.to_string(),
        "未认证的请求"
    );
}

#[test]
fn test_dependency_error_carries_ids() {
    let err = OrchestratorError::dependency("父资源状态不满足", vec![2, 5]);
    assert_eq!(err.dependency_ids(), Some(&[2_i64, 5][..]));
    assert!(OrchestratorError::invalid_input("x").dependency_ids().is_none());
}

#[test]
fn test_retryable_and_rejection_classes() {
    assert!(OrchestratorError::message_queue("down").is_retryable());
    assert!(OrchestratorError::storage("locked").is_retryable());
    assert!(!OrchestratorError::invalid_input("bad").is_retryable());

    assert!(OrchestratorError::resource_not_found(1).is_rejection());
    assert!(OrchestratorError::AccessUnauthorized.is_rejection());
    assert!(!OrchestratorError::Internal("boom".into()).is_rejection());
}

#[test]
fn test_from_serde_json_error() {
    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: OrchestratorError = json_err.into();
    assert!(matches!(err, OrchestratorError::Serialization(_)));
}

#[test]
fn test_from_anyhow_error() {
    let err: OrchestratorError = anyhow::anyhow!("wrapped").into();
    assert_eq!(err.to_string(), "内部错误: wrapped");
}
